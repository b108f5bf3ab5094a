//! # lattice
//!
//! A computation-graph execution engine for parametric numeric models.
//!
//! Build a [`Graph`] of instances, variables and operators, compile it
//! against its targets, then run forward and backward passes through an
//! [`OpContext`]:
//!
//! ```rust
//! use lattice::prelude::*;
//!
//! # fn main() -> lattice::Result<()> {
//! let mut graph = Graph::new();
//! let x = graph.instance("X", Shape::batch(&[1]), TensorKind::Dense)?;
//! let w = graph.variable("W", (1, 1), TensorKind::Dense, Initializer::Ones)?;
//! let y = graph.op("Y", OpKind::Matmul, &[x, w])?;
//! graph.compile(&[y])?;
//!
//! let mut params = TensorMap::new();
//! graph.init_params(&mut params, &mut rand::thread_rng())?;
//!
//! let mut ctx = OpContext::new(&graph)?;
//! ctx.init_op(&[0], None)?;
//! ctx.inst_mut().put("X", TensorValue::Dense(Tensor::from_vec(&[2, 1], vec![3.0, 4.0])?));
//! ctx.init_forward(&params)?;
//! ctx.forward(&params)?;
//! assert_eq!(ctx.output(0)?.data(), &[3.0, 4.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `lattice-core` | Error, Shape, Tensor, sparse storage, TensorMap, GroupConfig |
//! | `lattice-nn` | Reference CPU kernels and initializers |
//! | `lattice` | Graph, operators, plans, OpContext, operator registry |
//!
//! ## Modules
//!
//! - [`graph`] - nodes, operators, compilation, plans and the execution context
//! - [`registry`] - build operators from a type name and attributes

pub mod graph;
pub mod registry;

/// Re-export core types.
pub use lattice_core::{
    bail, CsrMatrix, Dim, Error, ErrorCategory, GroupConfig, GroupConfigItem, Result, Shape,
    SparseRowMatrix, Tensor, TensorKind, TensorMap, TensorStorage, TensorValue,
};

/// Re-export kernels and initializers.
pub mod nn {
    pub use lattice_nn::*;
}

pub use graph::{Graph, NodeId, OpContext, OpKind, Operator, Plan};
pub use lattice_nn::Initializer;
pub use registry::{AttrValue, Attrs, OpRegistry};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::graph::{grad_name, Graph, NodeId, OpContext, OpKind, Operator, Plan};
    pub use crate::registry::{AttrValue, Attrs};
    pub use crate::{
        Dim, Error, GroupConfig, Initializer, Result, Shape, SparseRowMatrix, Tensor, TensorKind,
        TensorMap, TensorValue,
    };
    pub use lattice_core::CsrMatrix;
}
