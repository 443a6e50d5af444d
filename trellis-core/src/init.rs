//! Weight initializers.
//!
//! Each initializer fills every `*weight` parameter of a module from a normal
//! distribution and zeroes every `*bias` parameter.

use crate::error::{RecipeError, Result};
use crate::module::{Module, Parameter};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Nonlinearity following the initialized layer, used to pick the gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Nonlinearity {
    Linear,
    Relu,
    LeakyRelu,
}

impl Nonlinearity {
    fn gain(self, a: f64) -> f64 {
        match self {
            Nonlinearity::Linear => 1.0,
            Nonlinearity::Relu => 2f64.sqrt(),
            Nonlinearity::LeakyRelu => (2.0 / (1.0 + a * a)).sqrt(),
        }
    }
}

/// Kaiming (He) normal init. A relu-family nonlinearity with a non-zero
/// slope `a` is treated as leaky relu.
pub fn kaiming<M, R>(m: &mut M, a: f64, nonlinearity: Nonlinearity, rng: &mut R) -> Result<()>
where
    M: Module + ?Sized,
    R: Rng + ?Sized,
{
    let nonlinearity = match nonlinearity {
        Nonlinearity::Relu | Nonlinearity::LeakyRelu if a == 0.0 => Nonlinearity::Relu,
        Nonlinearity::Relu | Nonlinearity::LeakyRelu => Nonlinearity::LeakyRelu,
        Nonlinearity::Linear => Nonlinearity::Linear,
    };
    init_weights(m, rng, |p| {
        let (fan_in, _) = fans(p)?;
        Ok(nonlinearity.gain(a) / (fan_in as f64).sqrt())
    })
}

/// Xavier (Glorot) normal init.
pub fn xavier<M, R>(m: &mut M, rng: &mut R) -> Result<()>
where
    M: Module + ?Sized,
    R: Rng + ?Sized,
{
    init_weights(m, rng, |p| {
        let (fan_in, fan_out) = fans(p)?;
        Ok((2.0 / (fan_in + fan_out) as f64).sqrt())
    })
}

/// Gaussian weights with standard deviation 0.02.
pub fn normal_002<M, R>(m: &mut M, rng: &mut R) -> Result<()>
where
    M: Module + ?Sized,
    R: Rng + ?Sized,
{
    init_weights(m, rng, |_| Ok(0.02))
}

fn init_weights<M, R>(
    m: &mut M,
    rng: &mut R,
    std_for: impl Fn(&Parameter) -> Result<f64>,
) -> Result<()>
where
    M: Module + ?Sized,
    R: Rng + ?Sized,
{
    for p in m.parameters_mut() {
        if p.name == "bias" || p.name.ends_with(".bias") {
            p.data.data_mut().fill(0.0);
        } else if p.name == "weight" || p.name.ends_with(".weight") {
            let std = std_for(&*p)?;
            let normal = Normal::new(0.0, std).map_err(|e| {
                RecipeError::model(format!("cannot sample '{}' with std {std}: {e}", p.name))
            })?;
            for x in p.data.data_mut() {
                *x = normal.sample(&mut *rng) as f32;
            }
        }
    }
    Ok(())
}

/// `(fan_in, fan_out)` of a weight laid out as `[out, in, *receptive]`.
fn fans(p: &Parameter) -> Result<(usize, usize)> {
    let shape = p.data.shape();
    if shape.len() < 2 {
        return Err(RecipeError::model(format!(
            "fan in/out needs at least 2 dims, '{}' has shape {shape:?}",
            p.name
        )));
    }
    let receptive: usize = shape[2..].iter().product();
    Ok((shape[1] * receptive, shape[0] * receptive))
}
