// vamp/solver.rs

//! # EM-VAMP Solver
//!
//! Drives Vector Approximate Message Passing between a prior-side (input) estimator
//! and a likelihood-side (output) estimator for a fixed number of rounds, with an
//! EM update of each estimator's parameters inside every round.
//!
//! One round, starting from the message `m_out` addressed to the output side:
//!
//! 1.  The output estimator forms its posterior from `m_out` and re-estimates the
//!     noise variance. Dividing `m_out` back out gives the extrinsic message `m_in`.
//! 2.  The input estimator denoises `m_in` under the mixture prior and re-estimates
//!     the mixture.
//! 3.  The denoised posterior mean is recorded as this round's estimate, and the
//!     extrinsic part of that posterior becomes the next round's `m_out`.
//!
//! The first `m_out` is the prior summary of the mixture. There is no early stop;
//! every round's estimate is returned.

use crate::config::VampConfig;
use crate::estimator::{Estimator, EstimatorError, PriorEstimator};
use crate::history::{IterateHistory, Trajectory, finalize};
use crate::linear::LinearEstimator;
use crate::message::{Message, VarianceBounds, extrinsic};
use crate::mixture::{MixtureEstimator, MixtureParams};
use crate::prepare::{AugmentedProblem, prepare};
use ndarray::{Array1, ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A comprehensive error type for an EM-VAMP fit.
#[derive(Error, Debug)]
pub enum VampError {
    #[error("The design matrix must have at least one row and one column; got {rows}x{cols}.")]
    EmptyDesign { rows: usize, cols: usize },

    #[error("The design matrix has {rows} rows but the response vector has {len} entries.")]
    ShapeMismatch { rows: usize, len: usize },

    #[error("Non-finite values (NaN or Infinity) were found in the {0}.")]
    NonFiniteInput(&'static str),

    #[error(
        "Initial mixture arrays have different lengths (weights: {weights:?}, means: {means:?}, variances: {variances:?})."
    )]
    MixtureLengthMismatch {
        weights: Option<usize>,
        means: Option<usize>,
        variances: Option<usize>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Singular value decomposition of the augmented design failed: {0}")]
    Decomposition(#[from] LinalgError),

    #[error("Singular value decomposition did not return singular vectors.")]
    MissingSingularVectors,

    #[error(
        "Numerical instability at iteration {iteration}: {source} ({} completed iterations kept).",
        .partial.len()
    )]
    NumericalInstability {
        iteration: usize,
        #[source]
        source: EstimatorError,
        partial: Box<Trajectory>,
    },
}

impl VampError {
    /// True for errors raised before any iteration ran.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, VampError::NumericalInstability { .. })
    }

    /// The iterations completed before a mid-run failure.
    pub fn partial_trajectory(&self) -> Option<&Trajectory> {
        match self {
            VampError::NumericalInstability { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Health of a completed fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// The final iterate is finite.
    Finite,
    /// The final iterate contains NaN or infinite values. The trajectory is still
    /// returned for diagnosis; re-running with a frozen noise variance is a known
    /// remedy but is left to the caller.
    NonFinite,
}

impl FitStatus {
    /// Status of a completed path, judged on its last iterate.
    pub fn of_trajectory(trajectory: &Trajectory) -> Self {
        match trajectory.len().checked_sub(1) {
            Some(last) if trajectory.is_finite_at(last) => FitStatus::Finite,
            _ => FitStatus::NonFinite,
        }
    }
}

/// Estimator parameters after every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTrace {
    pub initial_noise_variance: f64,
    pub initial_mixture: MixtureParams,
    /// Noise variance after the EM step of each round.
    pub noise_variances: Vec<f64>,
    /// Mixture parameters after the EM step of each round.
    pub mixtures: Vec<MixtureParams>,
}

/// Everything an EM-VAMP run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VampFit {
    /// Final intercept, response mean included.
    pub intercept: f64,
    /// Final slopes, one per predictor.
    pub coefficients: Array1<f64>,
    /// Estimate at every iteration; exactly `max_iter` entries.
    pub trajectory: Trajectory,
    /// Final mixture prior.
    pub mixture: MixtureParams,
    /// Final noise variance.
    pub noise_variance: f64,
    pub trace: ParameterTrace,
    pub status: FitStatus,
}

impl VampFit {
    /// Predictions of the final iterate for new rows.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, VampError> {
        if x.ncols() != self.coefficients.len() {
            return Err(VampError::InvalidConfig(format!(
                "prediction design has {} columns but the fit has {} slopes",
                x.ncols(),
                self.coefficients.len()
            )));
        }
        Ok(x.dot(&self.coefficients) + self.intercept)
    }
}

/// Where the orchestrator is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Initializing,
    Iterating { iteration: usize },
    /// All `max_iter` rounds ran.
    Exhausted,
    /// An estimator could not form its posterior; the run is over.
    Failed { iteration: usize },
}

/// A round that could not be completed.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundFailure {
    pub iteration: usize,
    pub source: EstimatorError,
}

/// The message-passing orchestrator, generic over its two estimators.
pub struct VampSolver<I, O> {
    input: I,
    output: O,
    bounds: VarianceBounds,
    max_iter: usize,
    state: SolverState,
    history: IterateHistory,
}

impl<I, O> VampSolver<I, O>
where
    I: PriorEstimator,
    O: Estimator,
{
    pub fn new(
        input: I,
        output: O,
        bounds: VarianceBounds,
        max_iter: usize,
        num_coefficients: usize,
    ) -> Self {
        Self {
            input,
            output,
            bounds,
            max_iter,
            state: SolverState::Initializing,
            history: IterateHistory::with_capacity(max_iter, num_coefficients),
        }
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn history(&self) -> &IterateHistory {
        &self.history
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn into_parts(self) -> (I, O, IterateHistory) {
        (self.input, self.output, self.history)
    }

    /// Runs every round. `observe` is called after each completed round with the
    /// round index and both estimators.
    pub fn run<F>(&mut self, mut observe: F) -> Result<(), RoundFailure>
    where
        F: FnMut(usize, &I, &O),
    {
        let mut message = self.input.prior_message(self.history.num_coefficients());
        for iteration in 0..self.max_iter {
            self.state = SolverState::Iterating { iteration };
            message = match self.round(iteration, &message) {
                Ok(next) => next,
                Err(source) => {
                    self.state = SolverState::Failed { iteration };
                    return Err(RoundFailure { iteration, source });
                }
            };
            observe(iteration, &self.input, &self.output);
        }
        self.state = SolverState::Exhausted;
        Ok(())
    }

    /// One output-then-input round. Returns the message for the next round.
    fn round(&mut self, iteration: usize, to_output: &Message) -> Result<Message, EstimatorError> {
        let (post_out, out_stats) = self.output.estimate(to_output)?;
        self.output.em_update(&out_stats);
        let to_input = extrinsic(&post_out, to_output, &self.bounds);

        let (post_in, in_stats) = self.input.estimate(&to_input)?;
        self.input.em_update(&in_stats);
        self.history.record(post_in.mean.view());

        let next = extrinsic(&post_in, &to_input, &self.bounds);
        log::debug!(
            "[Iter #{iteration}] {} var {:.4e} -> {} var {:.4e} -> next var {:.4e}",
            self.output.name(),
            post_out.variance,
            self.input.name(),
            post_in.variance,
            next.variance
        );
        Ok(next)
    }
}

/// Fits `y ~ X` by EM-VAMP with a Gaussian-mixture prior on the coefficients.
///
/// The response is centered and an intercept column is prepended before fitting;
/// every entry of the returned trajectory is mapped back to the original scale.
pub fn fit_em_vamp(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &VampConfig,
) -> Result<VampFit, VampError> {
    config.validate()?;
    let problem = prepare(x, y)?;
    let noise_variance = problem.response_energy();
    let input = MixtureEstimator::from_config(config, &problem, noise_variance)?;

    let y_mean = problem.y_mean;
    let num_coefficients = problem.num_coefficients();
    log::info!(
        "Starting EM-VAMP: {} samples, {} predictors, {} mixture components, {} iterations.",
        problem.num_samples(),
        num_coefficients - 1,
        input.params().num_components(),
        config.max_iter
    );

    let AugmentedProblem { x, y, .. } = problem;
    let output = LinearEstimator::new(x, y, noise_variance, config.tune_noise_variance)?;

    let mut trace = ParameterTrace {
        initial_noise_variance: noise_variance,
        initial_mixture: input.params().clone(),
        noise_variances: Vec::with_capacity(config.max_iter),
        mixtures: Vec::with_capacity(config.max_iter),
    };

    let mut solver = VampSolver::new(
        input,
        output,
        config.message_variance,
        config.max_iter,
        num_coefficients,
    );
    let outcome = solver.run(|_, input, output| {
        trace.noise_variances.push(output.noise_variance());
        trace.mixtures.push(input.params().clone());
    });

    if let Err(RoundFailure { iteration, source }) = outcome {
        let (partial, _, _) = finalize(solver.history(), y_mean);
        log::error!("EM-VAMP stopped at iteration {iteration}: {source}");
        return Err(VampError::NumericalInstability {
            iteration,
            source,
            partial: Box::new(partial),
        });
    }

    let (input, output, history) = solver.into_parts();
    let (trajectory, intercept, coefficients) = finalize(&history, y_mean);

    let status = FitStatus::of_trajectory(&trajectory);
    if status == FitStatus::NonFinite {
        log::warn!(
            "Final EM-VAMP iterate contains non-finite values; consider re-running with the noise variance frozen."
        );
    }

    log::info!(
        "EM-VAMP finished {} iterations. Noise variance: {:.6e}, mixture weights: {:?}",
        trajectory.len(),
        output.noise_variance(),
        input.params().weights.to_vec()
    );

    Ok(VampFit {
        intercept,
        coefficients,
        trajectory,
        mixture: input.into_params(),
        noise_variance: output.noise_variance(),
        trace,
        status,
    })
}
