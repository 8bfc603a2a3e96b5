//! Gaussian messages exchanged between the two VAMP estimators.
//!
//! A message is a mean vector with a single coordinate-averaged variance. Every
//! estimator turns an incoming message into a posterior summary of the same shape;
//! the *extrinsic* message sent onward is that posterior with the incoming
//! information divided out, so the same evidence is never counted twice.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// A Gaussian belief `N(mean, variance * I)` about the augmented coefficient vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub mean: Array1<f64>,
    pub variance: f64,
}

impl Message {
    pub fn new(mean: Array1<f64>, variance: f64) -> Self {
        Self { mean, variance }
    }

    /// A message with the same mean in every coordinate.
    pub fn constant(len: usize, mean: f64, variance: f64) -> Self {
        Self {
            mean: Array1::from_elem(len, mean),
            variance,
        }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.variance.is_finite() && self.mean.iter().all(|v| v.is_finite())
    }
}

/// Clipping range applied to the variance of every extrinsic message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for VarianceBounds {
    fn default() -> Self {
        Self {
            min: 1e-10,
            max: 1e5,
        }
    }
}

impl VarianceBounds {
    /// Clamps `value` into the range. NaN is passed through untouched so it
    /// surfaces downstream instead of being silently replaced.
    fn clip(&self, value: f64) -> f64 {
        if value.is_nan() {
            value
        } else {
            value.clamp(self.min, self.max)
        }
    }
}

/// Divides the incoming message out of a posterior summary.
///
/// With posterior precision `1/v` and incoming precision `1/r_var`, the extrinsic
/// precision is `1/v - 1/r_var`, and the extrinsic mean is the matching
/// precision-weighted difference of means. When the posterior is no more certain
/// than the incoming message the extrinsic precision is non-positive; the variance
/// is then pinned at `bounds.max`.
pub fn extrinsic(posterior: &Message, incoming: &Message, bounds: &VarianceBounds) -> Message {
    let post_var = bounds.clip(posterior.variance);
    let gamma = 1.0 / post_var - 1.0 / incoming.variance;

    let raw_var = if gamma > 1.0 / bounds.max {
        1.0 / gamma
    } else {
        if gamma.is_finite() {
            log::debug!(
                "Extrinsic precision {gamma:.3e} is below 1/{:.1e}; pinning message variance",
                bounds.max
            );
        }
        bounds.max
    };
    let variance = bounds.clip(if gamma.is_nan() { f64::NAN } else { raw_var });

    let posterior_weight = variance / post_var;
    let incoming_weight = variance / incoming.variance;
    let mean = &posterior.mean * posterior_weight - &incoming.mean * incoming_weight;

    Message { mean, variance }
}
