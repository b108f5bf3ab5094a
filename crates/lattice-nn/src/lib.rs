//! # lattice-nn
//!
//! Reference CPU kernels for the lattice graph engine, plus parameter
//! initializers.
//!
//! Kernels are plain functions over [`lattice_core::Tensor`] and the sparse
//! storage types. Forward kernels size and overwrite their output buffer;
//! backward kernels accumulate into the input gradient buffer. The graph
//! engine owns every buffer, so nothing here allocates per batch once the
//! buffers have reached their working size.
//!
//! | Module | Kernels |
//! |--------|---------|
//! | [`elementwise`] | add, sub, mul, div, broadcast add/mul |
//! | [`activation`] | sigmoid, tanh, relu |
//! | [`linalg`] | matmul, fully connect |
//! | [`reduce`] | sum, mean |
//! | [`loss`] | sigmoid BCE, square error, absolute error |
//! | [`shape_ops`] | reshape, concat |
//! | [`embedding`] | group embedding lookup (16/18-bit, per-group/shared) |
//! | [`init`] | initializers |

pub mod activation;
pub mod elementwise;
pub mod embedding;
pub mod init;
pub mod linalg;
pub mod loss;
pub mod reduce;
pub mod shape_ops;

pub use activation::Activation;
pub use elementwise::BinaryOp;
pub use embedding::{GroupBits, GroupLayout, TableGradMut, TableRef};
pub use init::Initializer;
pub use loss::Loss;
pub use reduce::Reduction;
