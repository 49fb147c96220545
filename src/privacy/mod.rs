//! Differential-privacy primitives: noise generation and budget accounting.
//!
//! The mechanisms here are an additive-noise approximation suitable for
//! perturbing client-side counts. They are not a formally audited DP library.

pub mod accountant;
pub mod noise;

pub use self::accountant::{Budget, LedgerEntry, PrivacyAccountant};
pub use self::noise::{
    add_privacy_noise, gaussian_noise, gaussian_sigma, laplace_noise, Mechanism, NoiseConfig,
};
