// Tensor: dense row-major storage
//
// Dense tensors back instance inputs, dense variables, hidden outputs and
// their gradients. They are plain owned buffers: no autograd bookkeeping, no
// reference counting. The graph engine keeps them alive in tensor maps and
// reuses them across batches, so `resize` never shrinks the allocation and
// only grows it when the new element count exceeds the current capacity.

use crate::error::{Error, Result};
use crate::shape::checked_total;

/// Dense `f32` tensor with concrete dims.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// A zero-filled tensor.
    pub fn zeros(dims: &[usize]) -> Result<Self> {
        let n = checked_total(dims)?;
        Ok(Tensor {
            dims: dims.to_vec(),
            data: vec![0.0; n],
        })
    }

    /// Wrap existing data; the element count must match the dims.
    pub fn from_vec(dims: &[usize], data: Vec<f32>) -> Result<Self> {
        let n = checked_total(dims)?;
        if n != data.len() {
            return Err(Error::msg(format!(
                "element count mismatch: dims {dims:?} require {n} elements, got {}",
                data.len()
            )));
        }
        Ok(Tensor {
            dims: dims.to_vec(),
            data,
        })
    }

    /// A rank-1 tensor holding one value.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            dims: vec![1],
            data: vec![value],
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Allocated element capacity.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Change dims, reusing the allocation when it is large enough.
    ///
    /// Existing values are kept up to the new length; new elements are zero.
    pub fn resize(&mut self, dims: &[usize]) -> Result<()> {
        let n = checked_total(dims)?;
        self.data.resize(n, 0.0);
        if self.dims != dims {
            self.dims.clear();
            self.dims.extend_from_slice(dims);
        }
        Ok(())
    }

    /// Reinterpret with new dims of the same element count.
    pub fn reshape(&mut self, dims: &[usize]) -> Result<()> {
        let n = checked_total(dims)?;
        if n != self.data.len() {
            return Err(Error::msg(format!(
                "cannot reshape {:?} ({} elements) to {dims:?} ({n} elements)",
                self.dims,
                self.data.len()
            )));
        }
        self.dims.clear();
        self.dims.extend_from_slice(dims);
        Ok(())
    }

    pub fn zero(&mut self) {
        self.fill(0.0);
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// Copy dims and values from `other`, reusing this allocation.
    pub fn copy_from(&mut self, other: &Tensor) -> Result<()> {
        self.resize(other.dims())?;
        self.data.copy_from_slice(other.data());
        Ok(())
    }

    /// Size of axis `d`.
    pub fn dim(&self, d: usize) -> usize {
        self.dims.get(d).copied().unwrap_or(1)
    }

    /// Number of rows when viewed as a 2-D matrix with the last axis as columns.
    pub fn rows(&self) -> usize {
        match self.dims.split_last() {
            Some((_, rest)) => rest.iter().product(),
            None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_count() {
        assert!(Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0]).is_err());
        let t = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
        assert_eq!(t.rows(), 2);
    }

    #[test]
    fn test_resize_reuses_capacity() {
        let mut t = Tensor::zeros(&[8, 4]).unwrap();
        let cap = t.capacity();
        let ptr = t.data().as_ptr();
        t.resize(&[2, 4]).unwrap();
        assert_eq!(t.len(), 8);
        assert_eq!(t.capacity(), cap);
        t.resize(&[8, 4]).unwrap();
        assert_eq!(t.data().as_ptr(), ptr);
        assert_eq!(t.dims(), &[8, 4]);
    }

    #[test]
    fn test_reshape() {
        let mut t = Tensor::zeros(&[2, 3]).unwrap();
        t.reshape(&[3, 2]).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(t.reshape(&[4]).is_err());
    }

    #[test]
    fn test_copy_from() {
        let src = Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        let mut dst = Tensor::default();
        dst.copy_from(&src).unwrap();
        assert_eq!(dst, src);
    }
}
