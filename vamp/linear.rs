//! # Linear/AWGN Output Estimator
//!
//! Carries the likelihood `y = X b + w`, `w ~ N(0, noise_variance I)`. Given a
//! Gaussian message `N(r, r_var I)` on `b`, it returns the exact posterior mean and
//! coordinate-averaged posterior variance of `b`.
//!
//! The augmented design is factored once as `X = U diag(s) V^T`. In that basis the
//! posterior decouples per singular direction `j`:
//!
//! - `d_j = s_j^2 r_var + noise_variance`
//! - mean: `b_hat = r + V diag(s_j r_var / d_j) U^T (y - X r)`
//! - variance along direction `j`: `r_var noise_variance / d_j`
//! - variance in the null space of `X`: `r_var`
//!
//! The EM step sets the noise variance to the expected residual energy per sample,
//! `(|y - X b_hat|^2 + sum_j s_j^2 var_j) / n`.

use crate::estimator::{Estimator, EstimatorError};
use crate::message::Message;
use crate::solver::VampError;
use ndarray::{Array1, Array2, Zip, s};
use ndarray_linalg::SVD;

/// Sufficient statistics of one linear posterior, consumed by the EM step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearStats {
    /// `|y - X b_hat|^2` at the posterior mean.
    pub residual_energy: f64,
    /// `sum_j s_j^2 var_j`, the posterior uncertainty seen through the design.
    pub trace_correction: f64,
}

/// The linear observation model with unknown noise variance.
#[derive(Debug, Clone)]
pub struct LinearEstimator {
    x: Array2<f64>,
    y: Array1<f64>,
    /// Left singular vectors, `[n, m]` with `m = min(n, p)`.
    u: Array2<f64>,
    /// Singular values with numerically-zero entries set to exactly zero.
    singular: Array1<f64>,
    /// Right singular vectors, transposed, `[m, p]`.
    vt: Array2<f64>,
    rank: usize,
    noise_variance: f64,
    tune: bool,
}

impl LinearEstimator {
    /// Factors the design. The design and response are treated as read-only from here on.
    pub fn new(
        x: Array2<f64>,
        y: Array1<f64>,
        noise_variance: f64,
        tune: bool,
    ) -> Result<Self, VampError> {
        let (n, p) = x.dim();
        if y.len() != n {
            return Err(VampError::ShapeMismatch { rows: n, len: y.len() });
        }

        let (u, singular, vt) = match x.svd(true, true)? {
            (Some(u), singular, Some(vt)) => (u, singular, vt),
            _ => return Err(VampError::MissingSingularVectors),
        };
        let m = singular.len();
        let u = u.slice(s![.., ..m]).to_owned();
        let vt = vt.slice(s![..m, ..]).to_owned();

        let largest = singular.iter().copied().fold(0.0, f64::max);
        let tolerance = largest * n.max(p) as f64 * f64::EPSILON;
        let singular = singular.mapv(|v| if v > tolerance { v } else { 0.0 });
        let rank = singular.iter().filter(|&&v| v > 0.0).count();

        if rank < m {
            log::warn!(
                "Augmented design is rank deficient: numerical rank {rank} of {m} (tolerance {tolerance:.3e})"
            );
        }

        Ok(Self {
            x,
            y,
            u,
            singular,
            vt,
            rank,
            noise_variance,
            tune,
        })
    }

    pub fn noise_variance(&self) -> f64 {
        self.noise_variance
    }

    /// Numerical rank of the augmented design.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular
    }
}

impl Estimator for LinearEstimator {
    type Stats = LinearStats;

    fn name(&self) -> &'static str {
        "Linear+AWGN"
    }

    fn estimate(&self, incoming: &Message) -> Result<(Message, LinearStats), EstimatorError> {
        let r_var = incoming.variance;
        if !(r_var.is_finite() && r_var > 0.0) {
            return Err(EstimatorError::InvalidIncomingVariance(r_var));
        }
        let w_var = self.noise_variance;
        if !(w_var.is_finite() && w_var >= 0.0) {
            return Err(EstimatorError::InvalidNoiseVariance(w_var));
        }

        let p = self.x.ncols();
        let m = self.singular.len();
        let d = self.singular.mapv(|sv| sv * sv * r_var + w_var);
        if d.iter().any(|&dj| !(dj > 0.0)) {
            return Err(EstimatorError::SingularPosterior {
                rank: self.rank,
                cols: p,
                noise_variance: w_var,
            });
        }

        let residual = &self.y - &self.x.dot(&incoming.mean);
        let projected = self.u.t().dot(&residual);
        let scaled = Zip::from(&projected)
            .and(&self.singular)
            .and(&d)
            .map_collect(|&proj, &sv, &dj| proj * sv * r_var / dj);
        let mean = &incoming.mean + &self.vt.t().dot(&scaled);

        let direction_var = d.mapv(|dj| r_var * w_var / dj);
        let variance = (direction_var.sum() + (p - m) as f64 * r_var) / p as f64;

        // A non-finite mean is carried forward and surfaces in the fit status.
        if !variance.is_finite() {
            return Err(EstimatorError::NonFinitePosterior("linear"));
        }
        let posterior = Message::new(mean, variance);

        let fitted_residual = &self.y - &self.x.dot(&posterior.mean);
        let residual_energy = fitted_residual.dot(&fitted_residual);
        let trace_correction = Zip::from(&self.singular)
            .and(&direction_var)
            .fold(0.0, |acc, &sv, &v| acc + sv * sv * v);

        Ok((
            posterior,
            LinearStats {
                residual_energy,
                trace_correction,
            },
        ))
    }

    fn em_update(&mut self, stats: &LinearStats) {
        if !self.tune {
            return;
        }
        let n = self.y.len() as f64;
        let updated = (stats.residual_energy + stats.trace_correction) / n;
        if updated.is_finite() && updated >= 0.0 {
            self.noise_variance = updated;
        } else {
            log::warn!("Skipping noise variance EM update: candidate value {updated} is invalid");
        }
    }
}
