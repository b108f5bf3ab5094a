// Loss kernels
//
// Losses here are PER-ELEMENT: the output has the shape of the prediction,
// and models reduce it explicitly (usually with ReduceMean), optionally
// weighting examples with a Mul first:
//
//   L  = SigmoidBceLoss(X, Y)       one loss per example
//   WL = Mul(L, W)                  per-example weights
//   M  = ReduceMean(WL)             scalar objective
//
// KEY LOSSES:
//
// 1. Sigmoid BCE: binary cross-entropy on logits, computed as
//    max(x, 0) - x·y + ln(1 + e^-|x|), which never overflows.
//    ∂/∂x = σ(x) - y        ∂/∂y = -x
//
// 2. Square error: (x - y)²
//    ∂/∂x = 2(x - y)        ∂/∂y = -2(x - y)
//
// 3. Absolute error: |x - y|
//    ∂/∂x = sign(x - y)     ∂/∂y = -sign(x - y)

use lattice_core::{Error, Result, Tensor};

use crate::activation::sigmoid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Loss {
    SigmoidBce,
    SquareError,
    AbsoluteError,
}

impl Loss {
    #[inline]
    fn value(self, x: f32, y: f32) -> f32 {
        match self {
            Loss::SigmoidBce => x.max(0.0) - x * y + (-x.abs()).exp().ln_1p(),
            Loss::SquareError => (x - y) * (x - y),
            Loss::AbsoluteError => (x - y).abs(),
        }
    }

    /// ∂loss/∂x (input 0) or ∂loss/∂y (input 1).
    #[inline]
    fn partial(self, input: usize, x: f32, y: f32) -> f32 {
        let dx = match self {
            Loss::SigmoidBce if input == 1 => return -x,
            Loss::SigmoidBce => sigmoid(x) - y,
            Loss::SquareError => 2.0 * (x - y),
            Loss::AbsoluteError => sign(x - y),
        };
        if input == 0 {
            dx
        } else {
            -dx
        }
    }
}

#[inline]
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn check_pair(loss: Loss, x: &Tensor, y: &Tensor) -> Result<()> {
    if x.dims() != y.dims() {
        return Err(Error::msg(format!(
            "{loss:?}: prediction dims {:?} differ from target dims {:?}",
            x.dims(),
            y.dims()
        )));
    }
    Ok(())
}

pub fn loss_forward(loss: Loss, x: &Tensor, y: &Tensor, out: &mut Tensor) -> Result<()> {
    check_pair(loss, x, y)?;
    out.resize(x.dims())?;
    for ((z, &p), &t) in out.data_mut().iter_mut().zip(x.data()).zip(y.data()) {
        *z = loss.value(p, t);
    }
    Ok(())
}

/// Accumulate the gradient of loss input `input` (0 = prediction, 1 = target).
pub fn loss_backward(
    loss: Loss,
    input: usize,
    x: &Tensor,
    y: &Tensor,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    check_pair(loss, x, y)?;
    if gy.len() != x.len() || gx.len() != x.len() {
        return Err(Error::msg(format!(
            "{loss:?}: gradient size mismatch: gy {}, gx {}, x {}",
            gy.len(),
            gx.len(),
            x.len()
        )));
    }
    let (xd, yd, g) = (x.data(), y.data(), gy.data());
    for (i, dx) in gx.data_mut().iter_mut().enumerate() {
        *dx += g[i] * loss.partial(input, xd[i], yd[i]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_sigmoid_bce_matches_definition() -> Result<()> {
        let x = Tensor::from_vec(&[3], vec![-2.0, 0.0, 3.0])?;
        let y = Tensor::from_vec(&[3], vec![0.0, 1.0, 1.0])?;
        let mut out = Tensor::default();
        loss_forward(Loss::SigmoidBce, &x, &y, &mut out)?;
        for i in 0..3 {
            let (p, t) = (sigmoid(x.data()[i]), y.data()[i]);
            let expected = -(t * p.ln() + (1.0 - t) * (1.0 - p).ln());
            assert!(close(out.data()[i], expected), "{i}: {}", out.data()[i]);
        }
        let gy = Tensor::from_vec(&[3], vec![1.0; 3])?;
        let mut gx = Tensor::zeros(&[3])?;
        loss_backward(Loss::SigmoidBce, 0, &x, &y, &gy, &mut gx)?;
        assert!(close(gx.data()[1], -0.5));
        Ok(())
    }

    #[test]
    fn test_sigmoid_bce_large_logits() -> Result<()> {
        let x = Tensor::from_vec(&[2], vec![100.0, -100.0])?;
        let y = Tensor::from_vec(&[2], vec![1.0, 0.0])?;
        let mut out = Tensor::default();
        loss_forward(Loss::SigmoidBce, &x, &y, &mut out)?;
        assert!(out.data().iter().all(|v| v.is_finite() && *v < 1e-6));
        Ok(())
    }

    #[test]
    fn test_square_and_absolute_error() -> Result<()> {
        let x = Tensor::from_vec(&[2], vec![3.0, 1.0])?;
        let y = Tensor::from_vec(&[2], vec![1.0, 2.0])?;
        let gy = Tensor::from_vec(&[2], vec![1.0, 1.0])?;
        let mut out = Tensor::default();

        loss_forward(Loss::SquareError, &x, &y, &mut out)?;
        assert_eq!(out.data(), &[4.0, 1.0]);
        let mut gx = Tensor::zeros(&[2])?;
        loss_backward(Loss::SquareError, 0, &x, &y, &gy, &mut gx)?;
        assert_eq!(gx.data(), &[4.0, -2.0]);

        loss_forward(Loss::AbsoluteError, &x, &y, &mut out)?;
        assert_eq!(out.data(), &[2.0, 1.0]);
        let mut gt = Tensor::zeros(&[2])?;
        loss_backward(Loss::AbsoluteError, 1, &x, &y, &gy, &mut gt)?;
        assert_eq!(gt.data(), &[-1.0, 1.0]);
        Ok(())
    }
}
