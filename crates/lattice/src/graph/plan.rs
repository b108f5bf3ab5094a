// Plan: the nodes one request actually needs
//
// A compiled graph may have several targets (say a loss and a prediction).
// A plan selects some of them, plus optionally a loss, and keeps:
//
//   nodes       - the dependency closure of the selection, in forward order
//   ops         - the operator subset of `nodes`
//   backward    - operators that take part in back-propagation, reversed
//   grad_nodes  - every node that gets a gradient buffer
//
// PRUNING: a node takes part in back-propagation iff
//
//   need_grad is set  AND  it feeds the loss  AND
//   (it is a leaf  OR  at least one of its inputs takes part)
//
// So an instance (need_grad false by default) or a subgraph under a
// need_grad = false node costs nothing in the backward pass. CSR inputs never
// take part.

use log::debug;

use lattice_core::{Error, Result, TensorKind};

use super::{Graph, NodeId};

/// Deterministic execution plan for one `(targets, loss)` request.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    targets: Vec<NodeId>,
    loss: Option<NodeId>,
    nodes: Vec<NodeId>,
    ops: Vec<NodeId>,
    instances: Vec<NodeId>,
    variables: Vec<NodeId>,
    backward: Vec<NodeId>,
    grad_nodes: Vec<NodeId>,
    participates: Vec<bool>,
}

impl Plan {
    /// Selected targets, in request order.
    pub fn targets(&self) -> &[NodeId] {
        &self.targets
    }

    pub fn loss(&self) -> Option<NodeId> {
        self.loss
    }

    /// Dependency closure in forward order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Operators to run in the forward pass, in order.
    pub fn ops(&self) -> &[NodeId] {
        &self.ops
    }

    pub fn instances(&self) -> &[NodeId] {
        &self.instances
    }

    pub fn variables(&self) -> &[NodeId] {
        &self.variables
    }

    /// Operators to run in the backward pass, in order.
    pub fn backward(&self) -> &[NodeId] {
        &self.backward
    }

    /// Nodes that own a gradient buffer, in forward order.
    pub fn grad_nodes(&self) -> &[NodeId] {
        &self.grad_nodes
    }

    /// Does `id` take part in back-propagation?
    pub fn needs_grad(&self, id: NodeId) -> bool {
        self.participates.get(id.index()).copied().unwrap_or(false)
    }
}

impl Graph {
    /// Build the plan for compiled targets `target_indices` and optional
    /// loss target `loss_index` (indices into the compile targets).
    pub fn plan(&self, target_indices: &[usize], loss_index: Option<usize>) -> Result<Plan> {
        let compiled = self.compiled()?;
        let resolve = |i: usize| {
            compiled.targets.get(i).copied().ok_or_else(|| {
                Error::UnknownTarget(format!(
                    "target index {i} (graph compiled with {} targets)",
                    compiled.targets.len()
                ))
            })
        };
        let targets = target_indices
            .iter()
            .map(|&i| resolve(i))
            .collect::<Result<Vec<_>>>()?;
        let loss = loss_index.map(resolve).transpose()?;

        let n = self.len();
        let mut roots = targets.clone();
        roots.extend(loss);
        let in_plan = self.closure(&roots);
        let order: Vec<usize> = compiled
            .order
            .iter()
            .copied()
            .filter(|&i| in_plan[i])
            .collect();

        let mut participates = vec![false; n];
        if let Some(loss) = loss {
            let feeds_loss = self.closure(&[loss]);
            for &i in &order {
                let node = self.node_at(i);
                participates[i] = feeds_loss[i]
                    && node.need_grad
                    && node.kind != TensorKind::Csr
                    && (node.is_leaf() || node.inputs.iter().any(|x| participates[x.index()]));
            }
        }

        let mut plan = Plan {
            targets,
            loss,
            nodes: Vec::with_capacity(order.len()),
            ops: Vec::new(),
            instances: Vec::new(),
            variables: Vec::new(),
            backward: Vec::new(),
            grad_nodes: Vec::new(),
            participates,
        };
        for &i in &order {
            let id = self.id_of(i);
            let node = self.node_at(i);
            plan.nodes.push(id);
            if node.role.is_instance() {
                plan.instances.push(id);
            } else if node.role.is_variable() {
                plan.variables.push(id);
            } else {
                plan.ops.push(id);
                if plan.participates[i] {
                    plan.backward.push(id);
                }
            }
            if plan.participates[i] {
                plan.grad_nodes.push(id);
            }
        }
        plan.backward.reverse();

        debug!(
            "plan for graph {}: {} nodes, {} ops, {} backward ops, {} gradients",
            self.id(),
            plan.nodes.len(),
            plan.ops.len(),
            plan.backward.len(),
            plan.grad_nodes.len()
        );
        Ok(plan)
    }

    /// Membership mask of everything reachable from `roots` through inputs.
    fn closure(&self, roots: &[NodeId]) -> Vec<bool> {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<usize> = roots.iter().map(NodeId::index).collect();
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            stack.extend(self.node_at(i).inputs.iter().map(NodeId::index));
        }
        seen
    }
}
