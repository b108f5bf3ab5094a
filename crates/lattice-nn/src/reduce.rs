// Reductions: sum and mean over one axis or over everything
//
// A tensor reduced over `axis` is viewed as (outer, len, inner):
//
//   dims [2, 3, 4], axis 1  →  outer 2, len 3, inner 4
//   out[o, i] = Σ_a x[o, a, i]
//
// With `keep_dim` the reduced axis stays with size 1; without it the axis
// is removed. Reducing everything yields a single-element [1] tensor.
//
// Backward spreads each output gradient back over the reduced positions,
// scaled by 1/len for the mean.

use lattice_core::{Error, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reduction {
    Sum,
    Mean,
}

/// Output dims of a reduction.
pub fn reduced_dims(dims: &[usize], axis: Option<usize>, keep_dim: bool) -> Result<Vec<usize>> {
    match axis {
        None => Ok(vec![1]),
        Some(a) if a >= dims.len() => Err(Error::msg(format!(
            "reduce axis {a} out of range for dims {dims:?}"
        ))),
        Some(a) => {
            let mut out = dims.to_vec();
            if keep_dim {
                out[a] = 1;
            } else {
                out.remove(a);
            }
            Ok(out)
        }
    }
}

fn split_axis(dims: &[usize], axis: Option<usize>) -> (usize, usize, usize) {
    match axis {
        None => (1, dims.iter().product(), 1),
        Some(a) => (
            dims[..a].iter().product(),
            dims[a],
            dims[a + 1..].iter().product(),
        ),
    }
}

pub fn reduce_forward(
    red: Reduction,
    axis: Option<usize>,
    keep_dim: bool,
    x: &Tensor,
    out: &mut Tensor,
) -> Result<()> {
    let dims = reduced_dims(x.dims(), axis, keep_dim)?;
    let (outer, len, inner) = split_axis(x.dims(), axis);
    out.resize(&dims)?;
    out.zero();
    let scale = match red {
        Reduction::Sum => 1.0,
        Reduction::Mean if len > 0 => 1.0 / len as f32,
        Reduction::Mean => 0.0,
    };
    let (xd, z) = (x.data(), out.data_mut());
    for o in 0..outer {
        for a in 0..len {
            let src = &xd[(o * len + a) * inner..(o * len + a + 1) * inner];
            let dst = &mut z[o * inner..(o + 1) * inner];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
    }
    if scale != 1.0 {
        z.iter_mut().for_each(|v| *v *= scale);
    }
    Ok(())
}

pub fn reduce_backward(
    red: Reduction,
    axis: Option<usize>,
    x: &Tensor,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    let (outer, len, inner) = split_axis(x.dims(), axis);
    if gy.len() != outer * inner || gx.len() != x.len() {
        return Err(Error::msg(format!(
            "reduce gradient size mismatch: gy {}, gx {}, x {:?}",
            gy.len(),
            gx.len(),
            x.dims()
        )));
    }
    let scale = match red {
        Reduction::Sum => 1.0,
        Reduction::Mean => 1.0 / len.max(1) as f32,
    };
    let (g, dx) = (gy.data(), gx.data_mut());
    for o in 0..outer {
        let src = &g[o * inner..(o + 1) * inner];
        for a in 0..len {
            let dst = &mut dx[(o * len + a) * inner..(o * len + a + 1) * inner];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += s * scale;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduced_dims() -> Result<()> {
        assert_eq!(reduced_dims(&[2, 3], None, false)?, vec![1]);
        assert_eq!(reduced_dims(&[2, 3], Some(1), true)?, vec![2, 1]);
        assert_eq!(reduced_dims(&[2, 3], Some(0), false)?, vec![3]);
        assert!(reduced_dims(&[2, 3], Some(2), false).is_err());
        Ok(())
    }

    #[test]
    fn test_reduce_sum_axis() -> Result<()> {
        let x = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let mut out = Tensor::default();
        reduce_forward(Reduction::Sum, Some(1), false, &x, &mut out)?;
        assert_eq!(out.dims(), &[2]);
        assert_eq!(out.data(), &[6.0, 15.0]);
        reduce_forward(Reduction::Sum, Some(0), true, &x, &mut out)?;
        assert_eq!(out.dims(), &[1, 3]);
        assert_eq!(out.data(), &[5.0, 7.0, 9.0]);
        Ok(())
    }

    #[test]
    fn test_reduce_mean_all() -> Result<()> {
        let x = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 6.0])?;
        let mut out = Tensor::default();
        reduce_forward(Reduction::Mean, None, false, &x, &mut out)?;
        assert_eq!(out.dims(), &[1]);
        assert_eq!(out.data(), &[3.0]);
        let gy = Tensor::scalar(1.0);
        let mut gx = Tensor::zeros(&[2, 2])?;
        reduce_backward(Reduction::Mean, None, &x, &gy, &mut gx)?;
        assert_eq!(gx.data(), &[0.25; 4]);
        Ok(())
    }
}
