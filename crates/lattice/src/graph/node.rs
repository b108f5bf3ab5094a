// Graph nodes
//
// A graph is an arena of GraphNode values addressed by NodeId. There are
// three roles:
//
//   Instance  - per-batch input supplied by the caller (dense or CSR)
//   Variable  - persistent learnable parameter (dense or sparse-row table)
//   Op        - operator applied to other nodes; always produces a dense
//               tensor whose shape is inferred when the graph is compiled
//
// NodeId carries the id of the graph that created it, so an id used with the
// wrong graph is reported instead of silently addressing another node.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use lattice_core::{Shape, TensorKind};
use lattice_nn::Initializer;

use super::op::OpKind;

/// Handle of a node inside one [`Graph`](super::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) graph: u32,
    pub(crate) index: u32,
}

impl NodeId {
    /// Position of the node in its graph's arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Id of the graph that owns the node.
    pub fn graph_id(&self) -> u32 {
        self.graph
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.graph, self.index)
    }
}

/// A fresh process-unique graph id.
pub(crate) fn next_graph_id() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// What a node is.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRole {
    Instance,
    Variable(Initializer),
    Op(OpKind),
}

impl NodeRole {
    pub fn is_instance(&self) -> bool {
        matches!(self, NodeRole::Instance)
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, NodeRole::Variable(_))
    }

    pub fn op(&self) -> Option<&OpKind> {
        match self {
            NodeRole::Op(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub(crate) name: String,
    pub(crate) shape: Shape,
    pub(crate) kind: TensorKind,
    pub(crate) need_grad: bool,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) role: NodeRole,
}

impl GraphNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared shape for instances and variables. For operators, the shape
    /// inferred by the last successful compile (empty before that).
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn need_grad(&self) -> bool {
        self.need_grad
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn role(&self) -> &NodeRole {
        &self.role
    }

    /// Instances and variables have no inputs.
    pub fn is_leaf(&self) -> bool {
        !matches!(self.role, NodeRole::Op(_))
    }

    /// Name of this node's gradient buffer in a context's hidden map.
    pub fn grad_name(&self) -> String {
        grad_name(&self.name)
    }
}

/// Suffix of gradient buffer names. Node names may not end with it.
pub const GRAD_SUFFIX: &str = ":grad";

/// Gradient buffer name for node `name`.
pub fn grad_name(name: &str) -> String {
    format!("{name}{GRAD_SUFFIX}")
}
