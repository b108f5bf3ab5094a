//! # lattice-core
//!
//! Core data types for the lattice graph engine.
//!
//! This crate provides:
//! - [`Shape`] / [`Dim`] - node shapes with an explicit batch placeholder
//! - [`Tensor`] - dense row-major storage, reused across batches
//! - [`SparseRowMatrix`] / [`CsrMatrix`] - sparse tables and feature lists
//! - [`TensorMap`] - named storage for params, instances and hidden tensors
//! - [`GroupConfig`] - embedding table shapes for sparse feature groups
//! - [`Error`] / [`Result`] - the error type shared by every lattice crate

pub mod error;
pub mod group_config;
pub mod shape;
pub mod sparse;
pub mod tensor;
pub mod tensor_map;

pub use error::{Error, ErrorCategory, Result};
pub use group_config::{GroupConfig, GroupConfigItem, MAX_GROUP_ID};
pub use shape::{Dim, Shape};
pub use sparse::{
    group_id_16, group_id_18, make_feature_id_16, make_feature_id_18, CsrMatrix, SparseRowMatrix,
};
pub use tensor::Tensor;
pub use tensor_map::{TensorKind, TensorMap, TensorStorage, TensorValue};
