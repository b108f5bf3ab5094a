// Graph: declarative computation graph
//
// A Graph is built once, compiled against a set of targets, and then shared
// read-only by any number of OpContexts that execute it.
//
// LIFECYCLE:
//
//   1. Build:    instance / variable / op / add_by_name
//   2. Compile:  compile(&[targets]) - names, cycles, shapes, order
//   3. Plan:     plan(target_indices, loss_index) - per-request node subset
//   4. Execute:  OpContext::new(&graph) ... forward / backward
//
// Any mutation after compile drops the compiled state; the graph must be
// compiled again before it can be planned.
//
// ORDER:
//
//   Compile walks each target depth-first, inputs in declared order, and
//   emits a node after all of its inputs (post-order). Every node appears
//   once. The same graph and targets therefore always give the same order.
//   A node reached again while it is still on the DFS path closes a cycle.

pub mod context;
pub mod node;
pub mod op;
pub mod plan;

use std::collections::HashSet;

use log::debug;
use rand::Rng;

use lattice_core::{
    Error, Result, Shape, SparseRowMatrix, Tensor, TensorKind, TensorMap, TensorValue,
};
use lattice_nn::Initializer;

pub use context::OpContext;
pub use node::{grad_name, GraphNode, NodeId, NodeRole, GRAD_SUFFIX};
pub use op::{Arity, GradMut, InputKind, OpKind, Operator, TensorRef};
pub use plan::Plan;

use crate::registry::{self, Attrs, OpRegistry};

#[derive(Debug, Clone)]
pub(crate) struct Compiled {
    pub(crate) targets: Vec<NodeId>,
    /// Node indices in forward order.
    pub(crate) order: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// An arena of nodes plus the result of the last successful compile.
#[derive(Debug)]
pub struct Graph {
    uid: u32,
    nodes: Vec<GraphNode>,
    compiled: Option<Compiled>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            uid: node::next_graph_id(),
            nodes: Vec::new(),
            compiled: None,
        }
    }

    /// Process-unique id carried by every [`NodeId`] of this graph.
    pub fn id(&self) -> u32 {
        self.uid
    }

    // Building

    /// Declare a per-batch input.
    ///
    /// Dense instances may put `Dim::Batch` at axis 0; CSR instances must be
    /// rank 2 (rows, columns), the column count being informational.
    pub fn instance(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        kind: TensorKind,
    ) -> Result<NodeId> {
        let shape = shape.into();
        let name = self.name_or_auto(name, "Instance")?;
        let invalid = |reason: &str| Error::InvalidShape {
            name: name.clone(),
            shape: shape.clone(),
            reason: reason.to_string(),
        };
        if shape.rank() == 0 {
            return Err(invalid("instance must have rank >= 1"));
        }
        if !shape.has_valid_batch_axis() {
            return Err(invalid("batch placeholder only allowed at axis 0"));
        }
        match kind {
            TensorKind::Dense => {
                if shape.dims().iter().any(|d| d.fixed() == Some(0)) {
                    return Err(invalid("zero-sized dimension"));
                }
            }
            TensorKind::Csr => {
                if !shape.is_rank(2) {
                    return Err(invalid("csr instance must be rank 2"));
                }
            }
            TensorKind::Srm => return Err(invalid("instances must be dense or csr")),
        }
        Ok(self.push(GraphNode {
            name,
            shape,
            kind,
            need_grad: false,
            inputs: Vec::new(),
            role: NodeRole::Instance,
        }))
    }

    /// Declare a learnable parameter.
    ///
    /// The shape must be concrete. Sparse-row tables are rank 2 (rows, col);
    /// the row count only matters for dense tables.
    pub fn variable(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        kind: TensorKind,
        init: Initializer,
    ) -> Result<NodeId> {
        let shape = shape.into();
        let name = self.name_or_auto(name, "Variable")?;
        let invalid = |reason: String| Error::InvalidShape {
            name: name.clone(),
            shape: shape.clone(),
            reason,
        };
        if shape.rank() == 0 {
            return Err(invalid("variable must have rank >= 1".to_string()));
        }
        if shape.has_batch() {
            return Err(invalid("variables cannot have a batch dimension".to_string()));
        }
        if shape.dims().iter().any(|d| d.fixed() == Some(0)) {
            return Err(invalid("zero-sized dimension".to_string()));
        }
        shape.total_dim().map_err(|e| invalid(e.to_string()))?;
        match kind {
            TensorKind::Dense => {}
            TensorKind::Srm if shape.is_rank(2) => {}
            TensorKind::Srm => return Err(invalid("sparse-row variable must be rank 2".to_string())),
            TensorKind::Csr => return Err(invalid("variables must be dense or srm".to_string())),
        }
        init.validate()?;
        Ok(self.push(GraphNode {
            name,
            shape,
            kind,
            need_grad: true,
            inputs: Vec::new(),
            role: NodeRole::Variable(init),
        }))
    }

    /// Add an operator node. An empty `name` becomes `"{op name}:{index}"`.
    pub fn op(&mut self, name: &str, op: OpKind, inputs: &[NodeId]) -> Result<NodeId> {
        let name = self.name_or_auto(name, op.name())?;
        for &id in inputs {
            self.check_id(id)?;
        }
        check_arity(&name, &op, inputs.len())?;
        op.validate(&name)?;
        Ok(self.push(GraphNode {
            name,
            shape: Shape::default(),
            kind: TensorKind::Dense,
            need_grad: true,
            inputs: inputs.to_vec(),
            role: NodeRole::Op(op),
        }))
    }

    /// Add an operator by name from the global registry, building its
    /// parameters from `attrs`.
    pub fn add_by_name(
        &mut self,
        type_name: &str,
        name: &str,
        attrs: &Attrs,
        inputs: &[NodeId],
    ) -> Result<NodeId> {
        self.add_from(registry::global(), type_name, name, attrs, inputs)
    }

    /// Like [`Graph::add_by_name`], resolving `type_name` in `registry`.
    pub fn add_from(
        &mut self,
        registry: &OpRegistry,
        type_name: &str,
        name: &str,
        attrs: &Attrs,
        inputs: &[NodeId],
    ) -> Result<NodeId> {
        let op = registry.build(type_name, attrs)?;
        self.op(name, op, inputs)
    }

    /// Enable or disable gradient flow through a node.
    pub fn set_need_grad(&mut self, id: NodeId, need_grad: bool) -> Result<()> {
        let i = self.check_id(id)?;
        self.nodes[i].need_grad = need_grad;
        self.compiled = None;
        Ok(())
    }

    /// Rewire an operator's inputs. Cycles are allowed here and reported by
    /// [`Graph::compile`].
    pub fn set_inputs(&mut self, id: NodeId, inputs: &[NodeId]) -> Result<()> {
        let i = self.check_id(id)?;
        for &input in inputs {
            self.check_id(input)?;
        }
        let node = &self.nodes[i];
        let op = node.role.op().ok_or_else(|| Error::Arity {
            name: node.name.clone(),
            op: "leaf",
            expected: "0".to_string(),
            got: inputs.len(),
        })?;
        check_arity(&node.name, op, inputs.len())?;
        self.nodes[i].inputs = inputs.to_vec();
        self.compiled = None;
        Ok(())
    }

    // Lookup

    pub fn node(&self, id: NodeId) -> Result<&GraphNode> {
        let i = self.check_id(id)?;
        Ok(&self.nodes[i])
    }

    /// First node named `name`.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| self.id_of(i))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(move |(i, n)| (self.id_of(i), n))
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Targets of the last successful compile.
    pub fn targets(&self) -> &[NodeId] {
        self.compiled
            .as_ref()
            .map(|c| c.targets.as_slice())
            .unwrap_or(&[])
    }

    /// Forward order of the last successful compile.
    pub fn order(&self) -> Result<Vec<NodeId>> {
        let compiled = self.compiled()?;
        Ok(compiled.order.iter().map(|&i| self.id_of(i)).collect())
    }

    /// Shape of a node after compilation.
    pub fn shape_of(&self, id: NodeId) -> Result<&Shape> {
        self.compiled()?;
        Ok(&self.node(id)?.shape)
    }

    // Compilation

    /// Validate the graph for `targets` and fix its execution order.
    ///
    /// On failure the graph is left uncompiled.
    pub fn compile(&mut self, targets: &[NodeId]) -> Result<()> {
        self.compiled = None;
        if targets.is_empty() {
            return Err(Error::UnknownTarget("no compile targets".to_string()));
        }
        for &t in targets {
            if t.graph != self.uid || t.index() >= self.nodes.len() {
                return Err(Error::UnknownTarget(t.to_string()));
            }
        }

        let mut names = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::DuplicateName {
                    name: node.name.clone(),
                });
            }
        }

        let order = self.topo_order(targets)?;

        let mut inferred: Vec<Option<Shape>> = vec![None; self.nodes.len()];
        for &i in &order {
            let node = &self.nodes[i];
            let Some(op) = node.role.op() else { continue };
            let mut input_shapes = Vec::with_capacity(node.inputs.len());
            for (slot, input) in node.inputs.iter().enumerate() {
                let j = input.index();
                let input_node = &self.nodes[j];
                let accepted = op.input_kind(slot);
                if !accepted.accepts(input_node.kind) {
                    return Err(Error::TensorKindMismatch {
                        name: input_node.name.clone(),
                        expected: accepted.expected(),
                        got: input_node.kind,
                    });
                }
                input_shapes.push(inferred[j].as_ref().unwrap_or(&input_node.shape));
            }
            let shape = op.infer_shape(&node.name, &input_shapes)?;
            inferred[i] = Some(shape);
        }
        for (node, shape) in self.nodes.iter_mut().zip(inferred) {
            if let Some(shape) = shape {
                node.shape = shape;
            }
        }

        debug!(
            "compiled graph {}: {} targets, {} of {} nodes in order",
            self.uid,
            targets.len(),
            order.len(),
            self.nodes.len()
        );
        self.compiled = Some(Compiled {
            targets: targets.to_vec(),
            order,
        });
        Ok(())
    }

    /// Post-order DFS from each target.
    fn topo_order(&self, targets: &[NodeId]) -> Result<Vec<usize>> {
        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for target in targets {
            let root = target.index();
            if marks[root] != Mark::White {
                continue;
            }
            marks[root] = Mark::Grey;
            stack.push((root, 0));
            while let Some(top) = stack.last_mut() {
                let (i, next) = *top;
                match self.nodes[i].inputs.get(next) {
                    Some(input) => {
                        top.1 += 1;
                        let j = input.index();
                        match marks[j] {
                            Mark::White => {
                                marks[j] = Mark::Grey;
                                stack.push((j, 0));
                            }
                            Mark::Grey => {
                                return Err(Error::CyclicGraph {
                                    name: self.nodes[j].name.clone(),
                                })
                            }
                            Mark::Black => {}
                        }
                    }
                    None => {
                        marks[i] = Mark::Black;
                        order.push(i);
                        stack.pop();
                    }
                }
            }
        }
        Ok(order)
    }

    // Parameters

    /// Create every variable missing from `params` with its initializer.
    ///
    /// Existing entries are kept; an entry of the wrong kind is an error.
    pub fn init_params<R: Rng + ?Sized>(&self, params: &mut TensorMap, rng: &mut R) -> Result<()> {
        let mut created = 0usize;
        for node in &self.nodes {
            let NodeRole::Variable(init) = &node.role else {
                continue;
            };
            if let Some(kind) = params.kind_of(&node.name) {
                if kind != node.kind {
                    return Err(Error::TensorKindMismatch {
                        name: node.name.clone(),
                        expected: node.kind,
                        got: kind,
                    });
                }
                continue;
            }
            let value = match node.kind {
                TensorKind::Srm => {
                    let col = node.shape.fixed_dim(1).unwrap_or(0);
                    TensorValue::Srm(SparseRowMatrix::new(col))
                }
                _ => {
                    let dims = node.shape.resolve(1)?;
                    let mut t = Tensor::zeros(&dims)?;
                    init.fill(&mut t, rng)?;
                    TensorValue::Dense(t)
                }
            };
            params.insert_value(&node.name, value)?;
            created += 1;
        }
        debug!("initialized {created} parameters for graph {}", self.uid);
        Ok(())
    }

    // Internals

    pub(crate) fn compiled(&self) -> Result<&Compiled> {
        self.compiled.as_ref().ok_or(Error::NotCompiled)
    }

    pub(crate) fn node_at(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    pub(crate) fn id_of(&self, index: usize) -> NodeId {
        NodeId {
            graph: self.uid,
            index: index as u32,
        }
    }

    fn check_id(&self, id: NodeId) -> Result<usize> {
        if id.graph != self.uid || id.index() >= self.nodes.len() {
            return Err(Error::UnknownNode(format!(
                "{id} is not a node of graph {}",
                self.uid
            )));
        }
        Ok(id.index())
    }

    fn name_or_auto(&self, name: &str, prefix: &str) -> Result<String> {
        if name.is_empty() {
            return Ok(format!("{prefix}:{}", self.nodes.len()));
        }
        // Gradient buffers share the context's hidden map with op outputs.
        if name.ends_with(GRAD_SUFFIX) {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("'{GRAD_SUFFIX}' is reserved for gradient buffers"),
            });
        }
        Ok(name.to_string())
    }

    fn push(&mut self, node: GraphNode) -> NodeId {
        let id = self.id_of(self.nodes.len());
        self.nodes.push(node);
        self.compiled = None;
        id
    }
}

fn check_arity(name: &str, op: &OpKind, got: usize) -> Result<()> {
    let arity = op.arity();
    if !arity.accepts(got) {
        return Err(Error::Arity {
            name: name.to_string(),
            op: op.name(),
            expected: arity.to_string(),
            got,
        });
    }
    Ok(())
}
