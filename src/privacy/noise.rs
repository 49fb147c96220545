//! Laplace and Gaussian noise generators.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Epsilon values at or below zero are clamped to this floor.
pub const MIN_EPSILON: f64 = 0.01;

/// Noise mechanism applied to outgoing counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    #[default]
    Laplace,
    Gaussian,
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Laplace => write!(f, "laplace"),
            Mechanism::Gaussian => write!(f, "gaussian"),
        }
    }
}

/// Parameters for [`add_privacy_noise`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    pub mechanism: Mechanism,
    pub epsilon: f64,
    /// Required for the Gaussian mechanism.
    pub delta: Option<f64>,
    pub sensitivity: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            mechanism: Mechanism::Laplace,
            epsilon: 1.0,
            delta: None,
            sensitivity: 1.0,
        }
    }
}

impl NoiseConfig {
    /// Fail with a configuration error if the mechanism cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.mechanism == Mechanism::Gaussian {
            match self.delta {
                None => {
                    return Err(Error::Config(
                        "gaussian mechanism requires a delta".to_string(),
                    ))
                }
                Some(d) if !(d > 0.0 && d < 1.0) => {
                    return Err(Error::Config(format!(
                        "gaussian delta must be in (0, 1), got {d}"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn clamp_epsilon(epsilon: f64) -> f64 {
    if epsilon.is_nan() || epsilon < MIN_EPSILON {
        MIN_EPSILON
    } else {
        epsilon
    }
}

/// Draw zero-mean Laplace noise with scale `1 / epsilon` (sensitivity 1).
pub fn laplace_noise(epsilon: f64) -> f64 {
    laplace_noise_with(&mut rand::thread_rng(), epsilon)
}

/// Same as [`laplace_noise`] with an explicit random source.
pub fn laplace_noise_with<R: Rng + ?Sized>(rng: &mut R, epsilon: f64) -> f64 {
    let epsilon = clamp_epsilon(epsilon);
    // X = -sgn(U) * ln(1 - 2|U|) / epsilon, U ~ Uniform(-0.5, 0.5).
    // U = -0.5 would give ln(0), so it is redrawn.
    let u = loop {
        let u: f64 = rng.gen_range(-0.5..0.5);
        if u.abs() < 0.5 {
            break u;
        }
    };
    -u.signum() * (1.0 - 2.0 * u.abs()).ln() / epsilon
}

/// Draw `N(0, sigma)` noise via the Box-Muller transform.
pub fn gaussian_noise(sigma: f64) -> f64 {
    gaussian_noise_with(&mut rand::thread_rng(), sigma)
}

pub fn gaussian_noise_with<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> f64 {
    // u1 in (0, 1] so ln(u1) is finite.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z * sigma
}

/// Standard deviation for the (epsilon, delta) Gaussian mechanism.
pub fn gaussian_sigma(epsilon: f64, delta: f64, sensitivity: f64) -> f64 {
    (2.0 * (1.25 / delta).ln()).sqrt() * sensitivity / clamp_epsilon(epsilon)
}

/// Perturb `value` with the configured mechanism.
pub fn add_privacy_noise(value: f64, config: &NoiseConfig) -> Result<f64> {
    add_privacy_noise_with(&mut rand::thread_rng(), value, config)
}

pub fn add_privacy_noise_with<R: Rng + ?Sized>(
    rng: &mut R,
    value: f64,
    config: &NoiseConfig,
) -> Result<f64> {
    config.validate()?;
    let noise = match config.mechanism {
        Mechanism::Laplace => config.sensitivity * laplace_noise_with(rng, config.epsilon),
        Mechanism::Gaussian => {
            // validate() guarantees delta is present
            let delta = config.delta.unwrap_or_default();
            gaussian_noise_with(rng, gaussian_sigma(config.epsilon, delta, config.sensitivity))
        }
    };
    Ok(value + noise)
}
