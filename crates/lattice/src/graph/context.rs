// OpContext: executes a compiled graph for one stream of batches
//
// A context borrows the graph read-only and owns two tensor maps:
//
//   inst    - this batch's instance inputs, filled by the caller
//   hidden  - operator outputs and gradient buffers ("{node}:grad")
//
// The parameter map is NOT owned: every pass takes `&TensorMap`, so it is
// read-only while a pass runs and can be updated by a single writer between
// passes. Several contexts on several threads may share one graph and one
// parameter map.
//
// CALL ORDER:
//
//   let mut ctx = OpContext::new(&graph)?;
//   ctx.init_op(&[0], Some(0))?;         // plan: targets + optional loss
//   loop {
//       ctx.inst_mut().put(...);          // this batch's inputs
//       ctx.init_forward(&params)?;       // validate, bind batch, size buffers
//       ctx.init_backward()?;             // gradient buffers (once is enough)
//       ctx.forward(&params)?;
//       ctx.backward(&params)?;          // only after a completed forward
//       // read ctx.grad::<Tensor>("W") and update params
//   }
//
// Buffers keep their allocation across batches. Operators run in place: the
// output buffer is moved out of the hidden map, written, and moved back, so
// the other entries stay readable as inputs. A failing operator puts its
// buffer back before the error is returned.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use lattice_core::{
    Dim, Error, Result, SparseRowMatrix, Tensor, TensorKind, TensorMap, TensorStorage,
    TensorValue,
};

use super::node::{grad_name, GraphNode, NodeRole};
use super::op::{GradMut, Operator, TensorRef};
use super::{Graph, NodeId, Plan};

type PlanKey = (Vec<usize>, Option<usize>);

/// Per-thread execution state for a compiled [`Graph`].
#[derive(Debug)]
pub struct OpContext<'g> {
    graph: &'g Graph,
    inst: TensorMap,
    hidden: TensorMap,
    plans: HashMap<PlanKey, Arc<Plan>>,
    plan: Option<Arc<Plan>>,
    batch: Option<usize>,
    forward_ready: bool,
    backward_ready: bool,
    // every op of the plan has run since the last init_forward
    forwarded: bool,
}

impl<'g> OpContext<'g> {
    /// Bind a compiled graph. Allocates nothing.
    pub fn new(graph: &'g Graph) -> Result<Self> {
        graph.compiled()?;
        Ok(OpContext {
            graph,
            inst: TensorMap::new(),
            hidden: TensorMap::new(),
            plans: HashMap::new(),
            plan: None,
            batch: None,
            forward_ready: false,
            backward_ready: false,
            forwarded: false,
        })
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Select the plan for `target_indices` and optional `loss_index`.
    ///
    /// Plans are cached per request, so switching between a training and a
    /// prediction plan does not rebuild them.
    pub fn init_op(&mut self, target_indices: &[usize], loss_index: Option<usize>) -> Result<()> {
        let key = (target_indices.to_vec(), loss_index);
        let plan = match self.plans.get(&key) {
            Some(plan) => Arc::clone(plan),
            None => {
                let plan = Arc::new(self.graph.plan(target_indices, loss_index)?);
                self.plans.insert(key, Arc::clone(&plan));
                plan
            }
        };
        self.plan = Some(plan);
        self.forward_ready = false;
        self.backward_ready = false;
        self.forwarded = false;
        Ok(())
    }

    pub fn plan(&self) -> Result<&Plan> {
        self.plan
            .as_deref()
            .ok_or_else(|| Error::msg("no plan selected: call init_op first"))
    }

    pub fn inst(&self) -> &TensorMap {
        &self.inst
    }

    /// Instance inputs for the next batch.
    pub fn inst_mut(&mut self) -> &mut TensorMap {
        &mut self.inst
    }

    /// Operator outputs and gradient buffers.
    pub fn hidden(&self) -> &TensorMap {
        &self.hidden
    }

    /// Batch size bound by the last `init_forward`.
    pub fn batch_size(&self) -> Option<usize> {
        self.batch
    }

    /// Value of plan target `target_index` after `forward`.
    ///
    /// Variables are not held by the context; read them from the parameter
    /// map instead.
    pub fn output(&self, target_index: usize) -> Result<&Tensor> {
        let plan = self.plan()?;
        let id = *plan.targets().get(target_index).ok_or_else(|| {
            Error::UnknownTarget(format!("plan target index {target_index}"))
        })?;
        let node = self.graph.node(id)?;
        match node.role {
            NodeRole::Op(_) => self.hidden.get::<Tensor>(&node.name),
            NodeRole::Instance => self.inst.get::<Tensor>(&node.name),
            NodeRole::Variable(_) => Err(Error::msg(format!(
                "target '{}' is a variable; read it from the parameter map",
                node.name
            ))),
        }
    }

    /// Gradient of node `name` after `backward`.
    pub fn grad<K: TensorStorage>(&self, name: &str) -> Result<&K> {
        self.hidden.get::<K>(&grad_name(name))
    }

    // Binding

    /// Validate this batch's inputs and the parameters against the plan,
    /// bind the batch size, and size every operator output.
    pub fn init_forward(&mut self, params: &TensorMap) -> Result<()> {
        self.forward_ready = false;
        self.forwarded = false;
        let plan = self.current_plan()?;
        let batch = self.bind_instances(&plan, None)?.unwrap_or(1);

        for &id in plan.variables() {
            let node = self.graph.node(id)?;
            check_variable(node, params)?;
        }

        if let Some(previous) = self.batch {
            if batch > previous {
                warn!(
                    "batch size grew from {previous} to {batch}; hidden buffers will be reallocated"
                );
            }
        }
        for &id in plan.ops() {
            let node = self.graph.node(id)?;
            let dims = node.shape.resolve(batch)?;
            self.hidden.get_or_insert::<Tensor>(&node.name).resize(&dims)?;
        }
        self.batch = Some(batch);
        self.forward_ready = true;
        if self.backward_ready {
            self.size_grads(&plan, batch)?;
        }
        Ok(())
    }

    /// Allocate and zero the gradient buffers of the plan.
    ///
    /// Requires a plan with a loss and a prior `init_forward`.
    pub fn init_backward(&mut self) -> Result<()> {
        let plan = self.current_plan()?;
        if plan.loss().is_none() {
            return Err(Error::msg("plan has no loss: pass a loss index to init_op"));
        }
        let batch = match (self.forward_ready, self.batch) {
            (true, Some(batch)) => batch,
            _ => return Err(Error::msg("init_backward requires init_forward first")),
        };
        self.size_grads(&plan, batch)?;
        self.backward_ready = true;
        debug!("{} gradient buffers ready", plan.grad_nodes().len());
        Ok(())
    }

    fn size_grads(&mut self, plan: &Plan, batch: usize) -> Result<()> {
        for &id in plan.grad_nodes() {
            let node = self.graph.node(id)?;
            let name = node.grad_name();
            match node.kind {
                TensorKind::Srm => {
                    let col = node.shape.fixed_dim(1).unwrap_or(0);
                    let grad = self.hidden.get_or_insert::<SparseRowMatrix>(&name);
                    grad.clear();
                    grad.set_col(col)?;
                }
                _ => {
                    let grad = self.hidden.get_or_insert::<Tensor>(&name);
                    grad.resize(&node.shape.resolve(batch)?)?;
                    grad.zero();
                }
            }
        }
        Ok(())
    }

    /// Check every instance of the plan and infer the batch size.
    ///
    /// With `expected` set, every batched instance must match it.
    fn bind_instances(&self, plan: &Plan, expected: Option<usize>) -> Result<Option<usize>> {
        let mut batch = expected;
        for &id in plan.instances() {
            let node = self.graph.node(id)?;
            let value = self.inst.value(&node.name)?;
            if value.kind() != node.kind {
                return Err(Error::TensorKindMismatch {
                    name: node.name.clone(),
                    expected: node.kind,
                    got: value.kind(),
                });
            }
            let rows = match value {
                TensorValue::Dense(t) => {
                    if !node.shape.matches(t.dims(), None) {
                        return Err(Error::Binding {
                            name: node.name.clone(),
                            expected: node.shape.to_string(),
                            got: format!("{:?}", t.dims()),
                        });
                    }
                    t.dim(0)
                }
                TensorValue::Csr(m) => m.rows(),
                TensorValue::Srm(_) => {
                    return Err(Error::TensorKindMismatch {
                        name: node.name.clone(),
                        expected: node.kind,
                        got: TensorKind::Srm,
                    })
                }
            };
            match node.shape.dims().first() {
                Some(Dim::Batch) => match batch {
                    Some(b) if b != rows => {
                        return Err(Error::Binding {
                            name: node.name.clone(),
                            expected: format!("batch size {b}"),
                            got: format!("batch size {rows}"),
                        })
                    }
                    _ => batch = Some(rows),
                },
                Some(Dim::Fixed(n)) if *n != rows => {
                    return Err(Error::Binding {
                        name: node.name.clone(),
                        expected: format!("{n} rows"),
                        got: format!("{rows} rows"),
                    })
                }
                _ => {}
            }
        }
        Ok(batch)
    }

    // Execution

    /// Run the plan's operators in order.
    pub fn forward(&mut self, params: &TensorMap) -> Result<()> {
        if !self.forward_ready {
            return Err(Error::msg("forward requires init_forward first"));
        }
        self.forwarded = false;
        let plan = self.current_plan()?;
        self.bind_instances(&plan, self.batch)?;
        for &id in plan.ops() {
            let node = self.graph.node(id)?;
            let NodeRole::Op(op) = &node.role else {
                continue;
            };
            let mut out = self.hidden.take(&node.name)?;
            let result = match &mut out {
                TensorValue::Dense(t) => {
                    let inputs = self.input_refs(node, params);
                    inputs.and_then(|inputs| op.forward(&inputs, t))
                }
                other => Err(Error::TensorKindMismatch {
                    name: node.name.clone(),
                    expected: TensorKind::Dense,
                    got: other.kind(),
                }),
            };
            self.hidden.put(&node.name, out);
            result?;
        }
        self.forwarded = true;
        Ok(())
    }

    /// Back-propagate from the loss, leaving each gradient buffer holding
    /// the sum over every path from its node to the loss.
    ///
    /// Requires `init_backward` and a completed `forward` on this batch.
    pub fn backward(&mut self, params: &TensorMap) -> Result<()> {
        if !self.backward_ready {
            return Err(Error::msg("backward requires init_backward first"));
        }
        if !self.forwarded {
            return Err(Error::msg("backward requires forward on the current batch"));
        }
        let plan = self.current_plan()?;
        let loss = plan
            .loss()
            .ok_or_else(|| Error::msg("plan has no loss"))?;

        for &id in plan.grad_nodes() {
            match self.hidden.value_mut(&grad_name(&self.graph.node(id)?.name))? {
                TensorValue::Dense(t) => t.zero(),
                TensorValue::Srm(m) => m.clear(),
                TensorValue::Csr(m) => m.clear(),
            }
        }
        if plan.needs_grad(loss) {
            let name = grad_name(&self.graph.node(loss)?.name);
            self.hidden.get_mut::<Tensor>(&name)?.fill(1.0);
        }

        for &id in plan.backward() {
            let node = self.graph.node(id)?;
            let NodeRole::Op(op) = &node.role else {
                continue;
            };
            for (slot, &input) in node.inputs.iter().enumerate() {
                if !plan.needs_grad(input) {
                    continue;
                }
                let gx_name = grad_name(&self.graph.node(input)?.name);
                let mut gx = self.hidden.take(&gx_name)?;
                let result = self.backward_one(node, op, slot, params, &mut gx);
                self.hidden.put(&gx_name, gx);
                result?;
            }
        }
        Ok(())
    }

    fn backward_one(
        &self,
        node: &GraphNode,
        op: &impl Operator,
        slot: usize,
        params: &TensorMap,
        gx: &mut TensorValue,
    ) -> Result<()> {
        let inputs = self.input_refs(node, params)?;
        let y = self.hidden.get::<Tensor>(&node.name)?;
        let gy = self.hidden.get::<Tensor>(&node.grad_name())?;
        op.backward(slot, &inputs, y, gy, GradMut::from_value(gx)?)
    }

    /// Resolve an operator's inputs to the maps that hold them.
    fn input_refs<'a>(
        &'a self,
        node: &GraphNode,
        params: &'a TensorMap,
    ) -> Result<Vec<TensorRef<'a>>> {
        node.inputs
            .iter()
            .map(|&id| self.value_of(id, params).map(TensorRef::from_value))
            .collect()
    }

    fn value_of<'a>(&'a self, id: NodeId, params: &'a TensorMap) -> Result<&'a TensorValue> {
        let node = self.graph.node(id)?;
        match node.role {
            NodeRole::Instance => self.inst.value(&node.name),
            NodeRole::Variable(_) => params.value(&node.name),
            NodeRole::Op(_) => self.hidden.value(&node.name),
        }
    }

    fn current_plan(&self) -> Result<Arc<Plan>> {
        self.plan
            .clone()
            .ok_or_else(|| Error::msg("no plan selected: call init_op first"))
    }
}

/// A parameter must exist with the declared kind and shape.
fn check_variable(node: &GraphNode, params: &TensorMap) -> Result<()> {
    let value = params.value(&node.name)?;
    if value.kind() != node.kind {
        return Err(Error::TensorKindMismatch {
            name: node.name.clone(),
            expected: node.kind,
            got: value.kind(),
        });
    }
    let fits = match value {
        TensorValue::Dense(t) => node.shape.matches(t.dims(), None),
        TensorValue::Srm(m) => node.shape.fixed_dim(1) == Some(m.col()),
        TensorValue::Csr(_) => false,
    };
    if !fits {
        let got = match value {
            TensorValue::Dense(t) => format!("{:?}", t.dims()),
            TensorValue::Srm(m) => format!("sparse rows of width {}", m.col()),
            TensorValue::Csr(_) => "csr".to_string(),
        };
        return Err(Error::Binding {
            name: node.name.clone(),
            expected: node.shape.to_string(),
            got,
        });
    }
    Ok(())
}
