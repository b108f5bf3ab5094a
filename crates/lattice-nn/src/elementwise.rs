// Elementwise kernels: same-shape binary ops and right-aligned broadcasting
//
// Forward kernels size their output (reusing its allocation) and overwrite
// it. Backward kernels ACCUMULATE into the input gradient, never assign, so
// a tensor consumed along several paths receives the sum of all of them.
//
// GRADIENT RULES (same shape):
//
//   z = a + b    →  ∂L/∂a += gz        ∂L/∂b += gz
//   z = a - b    →  ∂L/∂a += gz        ∂L/∂b -= gz
//   z = a * b    →  ∂L/∂a += gz·b      ∂L/∂b += gz·a
//   z = a / b    →  ∂L/∂a += gz/b      ∂L/∂b -= gz·a/b²
//
// BROADCASTING:
//
//   Shapes are aligned on the right; a dimension of 1 stretches to match.
//   [B, 4] + [1, 4] → [B, 4]     [B, 1] * [1, 4] → [B, 4]
//
// The gradient of a stretched input sums over the stretched positions.

use lattice_core::{Error, Result, Tensor};

/// Binary elementwise operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    /// ∂z/∂a or ∂z/∂b at one element.
    #[inline]
    fn partial(self, input: usize, a: f32, b: f32) -> f32 {
        match (self, input) {
            (BinaryOp::Add, _) => 1.0,
            (BinaryOp::Sub, 0) => 1.0,
            (BinaryOp::Sub, _) => -1.0,
            (BinaryOp::Mul, 0) => b,
            (BinaryOp::Mul, _) => a,
            (BinaryOp::Div, 0) => 1.0 / b,
            (BinaryOp::Div, _) => -a / (b * b),
        }
    }
}

fn check_same_dims(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(Error::msg(format!(
            "{op:?}: operand dims differ: {:?} vs {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

/// `out = a op b` for operands of identical dims.
pub fn binary_forward(op: BinaryOp, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
    check_same_dims(op, a, b)?;
    out.resize(a.dims())?;
    for ((z, &x), &y) in out.data_mut().iter_mut().zip(a.data()).zip(b.data()) {
        *z = op.apply(x, y);
    }
    Ok(())
}

/// Accumulate the gradient of input `input` (0 = a, 1 = b) into `gx`.
pub fn binary_backward(
    op: BinaryOp,
    input: usize,
    a: &Tensor,
    b: &Tensor,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    check_same_dims(op, a, b)?;
    if gy.len() != a.len() || gx.len() != a.len() {
        return Err(Error::msg(format!(
            "{op:?}: gradient size mismatch: {} / {} vs {}",
            gy.len(),
            gx.len(),
            a.len()
        )));
    }
    let (ad, bd, g) = (a.data(), b.data(), gy.data());
    for (i, dx) in gx.data_mut().iter_mut().enumerate() {
        *dx += g[i] * op.partial(input, ad[i], bd[i]);
    }
    Ok(())
}

/// Right-aligned broadcast of two dims slices.
pub fn broadcast_dims(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::msg(format!(
                    "cannot broadcast {a:?} with {b:?}"
                )))
            }
        };
    }
    Ok(out)
}

/// Strides for reading `src` as if it had dims `out`; stretched axes get 0.
fn broadcast_strides(src: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - src.len();
    let mut strides = vec![0; out.len()];
    let mut stride = 1;
    for i in (0..src.len()).rev() {
        if src[i] != 1 {
            strides[i + offset] = stride;
        }
        stride *= src[i];
    }
    strides
}

/// Visit every output element with the matching offsets into `a` and `b`.
fn for_each_broadcast(
    out: &[usize],
    sa: &[usize],
    sb: &[usize],
    mut f: impl FnMut(usize, usize, usize),
) {
    let n: usize = out.iter().product();
    let rank = out.len();
    let mut counter = vec![0usize; rank];
    let (mut ia, mut ib) = (0usize, 0usize);
    for i in 0..n {
        f(i, ia, ib);
        let mut d = rank;
        while d > 0 {
            d -= 1;
            counter[d] += 1;
            ia += sa[d];
            ib += sb[d];
            if counter[d] < out[d] {
                break;
            }
            ia -= sa[d] * out[d];
            ib -= sb[d] * out[d];
            counter[d] = 0;
        }
    }
}

/// `out = a op b` with right-aligned broadcasting.
pub fn broadcast_forward(op: BinaryOp, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
    let dims = broadcast_dims(a.dims(), b.dims())?;
    let sa = broadcast_strides(a.dims(), &dims);
    let sb = broadcast_strides(b.dims(), &dims);
    out.resize(&dims)?;
    let (ad, bd) = (a.data(), b.data());
    let z = out.data_mut();
    for_each_broadcast(&dims, &sa, &sb, |i, ia, ib| {
        z[i] = op.apply(ad[ia], bd[ib]);
    });
    Ok(())
}

/// Accumulate the gradient of broadcast input `input` into `gx`, summing
/// over stretched positions.
pub fn broadcast_backward(
    op: BinaryOp,
    input: usize,
    a: &Tensor,
    b: &Tensor,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    let dims = broadcast_dims(a.dims(), b.dims())?;
    if gy.dims() != dims.as_slice() {
        return Err(Error::msg(format!(
            "{op:?}: gradient dims {:?}, expected {dims:?}",
            gy.dims()
        )));
    }
    let src = if input == 0 { a } else { b };
    if gx.len() != src.len() {
        return Err(Error::msg(format!(
            "{op:?}: input gradient has {} elements, expected {}",
            gx.len(),
            src.len()
        )));
    }
    let sa = broadcast_strides(a.dims(), &dims);
    let sb = broadcast_strides(b.dims(), &dims);
    let (ad, bd, g) = (a.data(), b.data(), gy.data());
    let dx = gx.data_mut();
    for_each_broadcast(&dims, &sa, &sb, |i, ia, ib| {
        let at = if input == 0 { ia } else { ib };
        dx[at] += g[i] * op.partial(input, ad[ia], bd[ib]);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(dims: &[usize], data: &[f32]) -> Tensor {
        Tensor::from_vec(dims, data.to_vec()).unwrap()
    }

    #[test]
    fn test_binary_forward() -> Result<()> {
        let a = t(&[2], &[6.0, 8.0]);
        let b = t(&[2], &[2.0, 4.0]);
        let mut out = Tensor::default();
        binary_forward(BinaryOp::Div, &a, &b, &mut out)?;
        assert_eq!(out.data(), &[3.0, 2.0]);
        binary_forward(BinaryOp::Sub, &a, &b, &mut out)?;
        assert_eq!(out.data(), &[4.0, 4.0]);
        assert!(binary_forward(BinaryOp::Add, &a, &t(&[1], &[1.0]), &mut out).is_err());
        Ok(())
    }

    #[test]
    fn test_binary_backward_accumulates() -> Result<()> {
        let a = t(&[2], &[3.0, 4.0]);
        let b = t(&[2], &[5.0, 6.0]);
        let gy = t(&[2], &[1.0, 1.0]);
        let mut ga = Tensor::zeros(&[2])?;
        binary_backward(BinaryOp::Mul, 0, &a, &b, &gy, &mut ga)?;
        binary_backward(BinaryOp::Mul, 0, &a, &b, &gy, &mut ga)?;
        assert_eq!(ga.data(), &[10.0, 12.0]);
        let mut gb = Tensor::zeros(&[2])?;
        binary_backward(BinaryOp::Div, 1, &a, &t(&[2], &[1.0, 2.0]), &gy, &mut gb)?;
        assert_eq!(gb.data(), &[-3.0, -1.0]);
        Ok(())
    }

    #[test]
    fn test_broadcast_dims() -> Result<()> {
        assert_eq!(broadcast_dims(&[3, 4], &[1, 4])?, vec![3, 4]);
        assert_eq!(broadcast_dims(&[3, 1], &[4])?, vec![3, 4]);
        assert!(broadcast_dims(&[3, 4], &[2, 4]).is_err());
        Ok(())
    }

    #[test]
    fn test_broadcast_forward_backward() -> Result<()> {
        // [2, 3] + [1, 3]
        let a = t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = t(&[1, 3], &[10.0, 20.0, 30.0]);
        let mut out = Tensor::default();
        broadcast_forward(BinaryOp::Add, &a, &b, &mut out)?;
        assert_eq!(out.data(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        let gy = Tensor::from_vec(&[2, 3], vec![1.0; 6])?;
        let mut gb = Tensor::zeros(&[1, 3])?;
        broadcast_backward(BinaryOp::Add, 1, &a, &b, &gy, &mut gb)?;
        assert_eq!(gb.data(), &[2.0, 2.0, 2.0]);

        // [2, 1] * [3] → [2, 3]
        let c = t(&[2, 1], &[2.0, 3.0]);
        let d = t(&[3], &[1.0, 2.0, 3.0]);
        broadcast_forward(BinaryOp::Mul, &c, &d, &mut out)?;
        assert_eq!(out.dims(), &[2, 3]);
        assert_eq!(out.data(), &[2.0, 4.0, 6.0, 3.0, 6.0, 9.0]);
        let mut gc = Tensor::zeros(&[2, 1])?;
        broadcast_backward(BinaryOp::Mul, 0, &c, &d, &gy, &mut gc)?;
        assert_eq!(gc.data(), &[6.0, 6.0]);
        Ok(())
    }
}
