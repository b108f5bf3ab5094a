// init: Parameter initialization
//
// Variables carry an Initializer that fills their storage the first time a
// parameter map is populated. Random initializers draw from a caller-supplied
// RNG so a seeded StdRng reproduces the same parameters.
//
// AVAILABLE INITIALIZERS:
//
//   Zeros                     - all zeros
//   Ones                      - all ones
//   Constant(v)               - all elements = v
//   RandNormal { mean, std }  - N(mean, std)
//   RandUniform { low, high } - U(low, high)
//   XavierUniform             - U(-a, a), a = sqrt(6 / (fan_in + fan_out))
//   XavierNormal              - N(0, s),  s = sqrt(2 / (fan_in + fan_out))
//
// Sparse-row tables start empty whatever their initializer; rows appear as
// training touches them.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use lattice_core::{Error, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Initializer {
    #[default]
    Zeros,
    Ones,
    Constant(f32),
    RandNormal { mean: f32, std: f32 },
    RandUniform { low: f32, high: f32 },
    XavierUniform,
    XavierNormal,
}

/// Compute (fan_in, fan_out) from dims.
///
/// - For 1-D: fan_in = fan_out = dims[0]
/// - For 2-D (k, n) weights: fan_in = k, fan_out = n
/// - For 3-D+: the trailing dims form the receptive field
fn compute_fans(dims: &[usize]) -> (f64, f64) {
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[0] as f64, dims[1] as f64),
        _ => {
            let receptive_field: usize = dims[2..].iter().product();
            let fan_in = dims[0] as f64 * receptive_field as f64;
            let fan_out = dims[1] as f64 * receptive_field as f64;
            (fan_in, fan_out)
        }
    }
}

fn sample_into<R, D>(data: &mut [f32], dist: D, rng: &mut R)
where
    R: Rng + ?Sized,
    D: Distribution<f32>,
{
    for v in data.iter_mut() {
        *v = dist.sample(rng);
    }
}

fn normal(mean: f32, std: f32) -> Result<Normal<f32>> {
    Normal::new(mean, std)
        .map_err(|e| Error::msg(format!("invalid normal initializer N({mean}, {std}): {e}")))
}

fn uniform(low: f32, high: f32) -> Result<Uniform<f32>> {
    if low >= high || !low.is_finite() || !high.is_finite() {
        return Err(Error::msg(format!(
            "invalid uniform initializer U({low}, {high})"
        )));
    }
    Ok(Uniform::new(low, high))
}

impl Initializer {
    /// Check the parameters without drawing anything.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Initializer::RandNormal { mean, std } => normal(mean, std).map(|_| ()),
            Initializer::RandUniform { low, high } => uniform(low, high).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Overwrite every element of `t`.
    pub fn fill<R: Rng + ?Sized>(&self, t: &mut Tensor, rng: &mut R) -> Result<()> {
        let (fan_in, fan_out) = compute_fans(t.dims());
        let data = t.data_mut();
        match *self {
            Initializer::Zeros => data.fill(0.0),
            Initializer::Ones => data.fill(1.0),
            Initializer::Constant(v) => data.fill(v),
            Initializer::RandNormal { mean, std } => sample_into(data, normal(mean, std)?, rng),
            Initializer::RandUniform { low, high } => sample_into(data, uniform(low, high)?, rng),
            Initializer::XavierUniform => {
                let a = (6.0 / (fan_in + fan_out)).sqrt() as f32;
                sample_into(data, uniform(-a, a)?, rng);
            }
            Initializer::XavierNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt() as f32;
                sample_into(data, normal(0.0, std)?, rng);
            }
        }
        Ok(())
    }
}
