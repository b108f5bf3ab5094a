// Activation kernels
//
// Backward rules are written in terms of the forward OUTPUT y, which the
// engine keeps in the hidden map anyway:
//
//   sigmoid:  dy/dx = y·(1 - y)
//   tanh:     dy/dx = 1 - y²
//   relu:     dy/dx = 1 if y > 0 else 0

use lattice_core::{Error, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Sigmoid,
    Tanh,
    Relu,
}

/// Numerically stable logistic function.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Activation {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }

    #[inline]
    fn derivative(self, y: f32) -> f32 {
        match self {
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

pub fn activation_forward(act: Activation, x: &Tensor, out: &mut Tensor) -> Result<()> {
    out.resize(x.dims())?;
    for (y, &v) in out.data_mut().iter_mut().zip(x.data()) {
        *y = act.apply(v);
    }
    Ok(())
}

/// Accumulate `gy · f'(x)` into `gx`, using the forward output `y`.
pub fn activation_backward(act: Activation, y: &Tensor, gy: &Tensor, gx: &mut Tensor) -> Result<()> {
    if y.len() != gy.len() || y.len() != gx.len() {
        return Err(Error::msg(format!(
            "{act:?}: gradient size mismatch: y {}, gy {}, gx {}",
            y.len(),
            gy.len(),
            gx.len()
        )));
    }
    for ((dx, &v), &g) in gx.data_mut().iter_mut().zip(y.data()).zip(gy.data()) {
        *dx += g * act.derivative(v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_stable() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(-1000.0) >= 0.0);
        assert!((sigmoid(1000.0) - 1.0).abs() < 1e-7);
    }

    #[test]
    fn test_relu_forward_backward() -> Result<()> {
        let x = Tensor::from_vec(&[4], vec![-1.0, 0.0, 2.0, 3.0])?;
        let mut y = Tensor::default();
        activation_forward(Activation::Relu, &x, &mut y)?;
        assert_eq!(y.data(), &[0.0, 0.0, 2.0, 3.0]);
        let gy = Tensor::from_vec(&[4], vec![1.0; 4])?;
        let mut gx = Tensor::zeros(&[4])?;
        activation_backward(Activation::Relu, &y, &gy, &mut gx)?;
        assert_eq!(gx.data(), &[0.0, 0.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_tanh_gradient() -> Result<()> {
        let x = Tensor::from_vec(&[1], vec![0.5])?;
        let mut y = Tensor::default();
        activation_forward(Activation::Tanh, &x, &mut y)?;
        let gy = Tensor::scalar(1.0);
        let mut gx = Tensor::zeros(&[1])?;
        activation_backward(Activation::Tanh, &y, &gy, &mut gx)?;
        let expected = 1.0 - 0.5f32.tanh().powi(2);
        assert!((gx.data()[0] - expected).abs() < 1e-6);
        Ok(())
    }
}
