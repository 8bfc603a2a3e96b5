//! # Gaussian-Mixture Input Estimator
//!
//! Carries the coefficient prior `sum_k w_k N(m_k, v_k)` and implements the
//! "denoising" half of VAMP: given a Gaussian message `N(r_i, r_var)` for every
//! coefficient, it returns the exact posterior mean and (coordinate-averaged)
//! variance under the mixture.
//!
//! For component `k` and coordinate `i`:
//!
//! - responsibility `p_ik ∝ w_k N(r_i; m_k, v_k + r_var)`
//! - component posterior mean `(r_i v_k + m_k r_var) / (v_k + r_var)`
//! - component posterior variance `v_k r_var / (v_k + r_var)`
//!
//! The EM step re-estimates the weights from the average responsibilities and every
//! non-fixed mean and variance from the responsibility-weighted posterior moments.
//! A variance floor is applied after initialization and after every update.

use crate::config::VampConfig;
use crate::estimator::{Estimator, EstimatorError, PriorEstimator};
use crate::message::Message;
use crate::prepare::AugmentedProblem;
use crate::solver::VampError;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Components fall back to this count when no initial arrays are supplied.
pub const DEFAULT_NUM_COMPONENTS: usize = 2;

/// Cap on the total starting weight of the non-null components.
const MAX_NON_NULL_WEIGHT: f64 = 0.95;

/// Lower bound on the starting variance of the widest component.
const MIN_WIDEST_VARIANCE: f64 = 0.1;

/// Starting variance of the null component relative to the widest one.
const NULL_VARIANCE_RATIO: f64 = 1e-4;

/// A component whose total responsibility is below this keeps its mean and variance.
const MIN_COMPONENT_MASS: f64 = 1e-300;

/// Weight, mean and variance of every mixture component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureParams {
    pub weights: Array1<f64>,
    pub means: Array1<f64>,
    pub variances: Array1<f64>,
}

impl MixtureParams {
    pub fn num_components(&self) -> usize {
        self.weights.len()
    }

    /// Mean and variance of the mixture as a whole.
    pub fn moments(&self) -> (f64, f64) {
        let mean = self.weights.dot(&self.means);
        let second = Zip::from(&self.weights)
            .and(&self.means)
            .and(&self.variances)
            .fold(0.0, |acc, &w, &m, &v| acc + w * (v + m * m));
        (mean, second - mean * mean)
    }
}

/// Sufficient statistics of one denoising pass, consumed by the EM step.
#[derive(Debug, Clone)]
pub struct MixtureStats {
    /// Posterior component probabilities, shape `[coefficients, components]`.
    pub responsibilities: Array2<f64>,
    /// Per-component posterior means, shape `[coefficients, components]`.
    pub component_means: Array2<f64>,
    /// Per-component posterior variances (shared by all coordinates).
    pub component_variances: Array1<f64>,
}

/// The Gaussian-mixture prior on the augmented coefficients.
#[derive(Debug, Clone)]
pub struct MixtureEstimator {
    params: MixtureParams,
    mean_fixed: Vec<bool>,
    variance_fixed: Vec<bool>,
    variance_floor: f64,
    tune: bool,
}

impl MixtureEstimator {
    /// Builds an estimator from explicit parameters. The variance floor is applied
    /// immediately.
    pub fn new(
        mut params: MixtureParams,
        mean_fixed: Vec<bool>,
        variance_fixed: Vec<bool>,
        variance_floor: f64,
        tune: bool,
    ) -> Self {
        params.variances.mapv_inplace(|v| v.max(variance_floor));
        Self {
            params,
            mean_fixed,
            variance_fixed,
            variance_floor,
            tune,
        }
    }

    /// Builds the estimator for a fit, applying the initialization policy to every
    /// parameter array the configuration leaves unspecified.
    pub fn from_config(
        config: &VampConfig,
        problem: &AugmentedProblem,
        noise_variance: f64,
    ) -> Result<Self, VampError> {
        let params = initialize_params(config, problem, noise_variance)?;
        let k = params.num_components();
        let mean_fixed = config.mean_fixed.clone().unwrap_or_else(|| vec![false; k]);
        let variance_fixed = config
            .variance_fixed
            .clone()
            .unwrap_or_else(|| vec![false; k]);
        if mean_fixed.len() != k || variance_fixed.len() != k {
            return Err(VampError::InvalidConfig(format!(
                "fixed masks must have one entry per component ({k}); got {} mean and {} variance flags",
                mean_fixed.len(),
                variance_fixed.len()
            )));
        }
        Ok(Self::new(
            params,
            mean_fixed,
            variance_fixed,
            config.variance_floor,
            config.tune_mixture,
        ))
    }

    pub fn params(&self) -> &MixtureParams {
        &self.params
    }

    pub fn into_params(self) -> MixtureParams {
        self.params
    }

    /// Closed-form posterior under the mixture for every coordinate of `r`.
    ///
    /// Coordinates are processed in parallel; each one is computed independently and
    /// reductions happen afterwards in a fixed order, so the result does not depend
    /// on scheduling.
    pub fn denoise(&self, r: ArrayView1<f64>, r_var: f64) -> (Message, MixtureStats) {
        let n = r.len();
        let k = self.params.num_components();
        let weights = &self.params.weights;
        let means = &self.params.means;
        let variances = &self.params.variances;

        let total_var: Array1<f64> = variances.mapv(|v| v + r_var);
        let component_variances: Array1<f64> = variances.mapv(|v| v * r_var / (v + r_var));
        let log_norm: Array1<f64> = Zip::from(weights)
            .and(&total_var)
            .map_collect(|&w, &s| w.ln() - 0.5 * (2.0 * PI * s).ln());

        let mut responsibilities = Array2::<f64>::zeros((n, k));
        let mut component_means = Array2::<f64>::zeros((n, k));
        let mut post_mean = Array1::<f64>::zeros(n);
        let mut post_var = Array1::<f64>::zeros(n);

        Zip::from(responsibilities.rows_mut())
            .and(component_means.rows_mut())
            .and(&r)
            .and(&mut post_mean)
            .and(&mut post_var)
            .par_for_each(|mut resp, mut cmean, &ri, zhat, zvar| {
                let mut max_log = f64::NEG_INFINITY;
                for j in 0..k {
                    let diff = ri - means[j];
                    let log_lik = log_norm[j] - 0.5 * diff * diff / total_var[j];
                    resp[j] = log_lik;
                    if log_lik > max_log {
                        max_log = log_lik;
                    }
                    cmean[j] = (ri * variances[j] + means[j] * r_var) / total_var[j];
                }

                let mut norm = 0.0;
                for j in 0..k {
                    resp[j] = (resp[j] - max_log).exp();
                    norm += resp[j];
                }

                let mut first = 0.0;
                let mut second = 0.0;
                for j in 0..k {
                    resp[j] /= norm;
                    first += resp[j] * cmean[j];
                    second += resp[j] * (component_variances[j] + cmean[j] * cmean[j]);
                }
                *zhat = first;
                let var = second - first * first;
                // Cancellation can leave a tiny negative value.
                *zvar = if var < 0.0 { 0.0 } else { var };
            });

        let variance = post_var.mean().unwrap_or(0.0);
        (
            Message::new(post_mean, variance),
            MixtureStats {
                responsibilities,
                component_means,
                component_variances,
            },
        )
    }
}

impl Estimator for MixtureEstimator {
    type Stats = MixtureStats;

    fn name(&self) -> &'static str {
        "GMM input"
    }

    fn estimate(&self, incoming: &Message) -> Result<(Message, MixtureStats), EstimatorError> {
        if !(incoming.variance.is_finite() && incoming.variance > 0.0) {
            return Err(EstimatorError::InvalidIncomingVariance(incoming.variance));
        }
        Ok(self.denoise(incoming.mean.view(), incoming.variance))
    }

    fn em_update(&mut self, stats: &MixtureStats) {
        if !self.tune {
            return;
        }
        let resp = &stats.responsibilities;
        let mass = resp.sum_axis(Axis(0));
        let total = mass.sum();
        if !(total.is_finite() && total > 0.0) {
            log::warn!("Skipping mixture EM update: responsibilities are not finite");
            return;
        }

        self.params.weights = &mass / total;

        let params = &self.params;
        let updates: Vec<(f64, f64)> = resp
            .axis_iter(Axis(1))
            .into_par_iter()
            .zip(stats.component_means.axis_iter(Axis(1)))
            .enumerate()
            .map(|(j, (r_col, m_col))| {
                if mass[j] < MIN_COMPONENT_MASS {
                    return (params.means[j], params.variances[j]);
                }
                let mean = if self.mean_fixed[j] {
                    params.means[j]
                } else {
                    r_col.dot(&m_col) / mass[j]
                };
                let variance = if self.variance_fixed[j] {
                    params.variances[j]
                } else {
                    let spread = Zip::from(&r_col)
                        .and(&m_col)
                        .fold(0.0, |acc, &p, &m| acc + p * (m - mean) * (m - mean));
                    (spread / mass[j] + stats.component_variances[j]).max(self.variance_floor)
                };
                (mean, variance)
            })
            .collect();

        for (j, (mean, variance)) in updates.into_iter().enumerate() {
            self.params.means[j] = mean;
            self.params.variances[j] = variance;
        }
    }
}

impl PriorEstimator for MixtureEstimator {
    fn prior_message(&self, len: usize) -> Message {
        let (mean, var) = self.params.moments();
        Message::constant(len, mean, var.max(self.variance_floor))
    }
}

/// Resolves the initial mixture from the configuration, filling in whatever the
/// caller left out.
///
/// - weights: non-null mass `min(n / (2 p), 0.95)` split evenly over components
///   `1..K`; the null component takes the rest.
/// - means: zero.
/// - variances: the widest component gets `noise / (mean(X^2) p mass)` (at least 0.1),
///   component `k` gets `k / (K - 1)` of that, and the null component `1e-4` of it.
///
/// `p` here counts the intercept column.
pub fn initialize_params(
    config: &VampConfig,
    problem: &AugmentedProblem,
    noise_variance: f64,
) -> Result<MixtureParams, VampError> {
    let k = config.resolved_num_components()?;
    let n = problem.num_samples() as f64;
    let p = problem.num_coefficients() as f64;

    let weights = match &config.weights {
        Some(w) => Array1::from(w.clone()),
        None if k == 1 => Array1::ones(1),
        None => {
            let non_null = (n / p / 2.0).min(MAX_NON_NULL_WEIGHT);
            let mut w = Array1::from_elem(k, non_null / (k - 1) as f64);
            w[0] = 1.0 - w.iter().skip(1).sum::<f64>();
            w
        }
    };

    let means = match &config.means {
        Some(m) => Array1::from(m.clone()),
        None => Array1::zeros(k),
    };

    let variances = match &config.variances {
        Some(v) => Array1::from(v.clone()),
        None => {
            let mass = if k == 1 {
                1.0
            } else {
                weights.iter().skip(1).sum::<f64>()
            };
            let denom = problem.design_energy() * p * mass;
            let widest = if denom > 0.0 {
                (noise_variance / denom).max(MIN_WIDEST_VARIANCE)
            } else {
                MIN_WIDEST_VARIANCE
            };
            if k == 1 {
                Array1::from_elem(1, widest)
            } else {
                let mut v = Array1::from_shape_fn(k, |j| widest * j as f64 / (k - 1) as f64);
                v[0] = widest * NULL_VARIANCE_RATIO;
                v
            }
        }
    };

    let variances = variances.mapv(|v| v.max(config.variance_floor));

    log::debug!(
        "Initial mixture: weights {:?}, means {:?}, variances {:?}",
        weights.to_vec(),
        means.to_vec(),
        variances.to_vec()
    );

    Ok(MixtureParams {
        weights,
        means,
        variances,
    })
}
