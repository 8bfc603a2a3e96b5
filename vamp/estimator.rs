//! The estimator roles in VAMP.
//!
//! The solver only ever talks to two estimators through these traits: an input
//! estimator that carries the coefficient prior, and an output estimator that
//! carries the likelihood. New priors or likelihoods plug in by implementing them.

use crate::message::Message;
use thiserror::Error;

/// Failure to form a posterior summary from an incoming message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    #[error("Incoming message variance {0:e} is not a positive finite number.")]
    InvalidIncomingVariance(f64),

    #[error("Noise variance {0:e} is not a non-negative finite number.")]
    InvalidNoiseVariance(f64),

    #[error(
        "Posterior covariance cannot be formed: the augmented design has numerical rank {rank} of {cols} and the noise variance is {noise_variance:e}."
    )]
    SingularPosterior {
        rank: usize,
        cols: usize,
        noise_variance: f64,
    },

    #[error("The {0} posterior contains non-finite values.")]
    NonFinitePosterior(&'static str),
}

/// One side of the message exchange.
///
/// `estimate` is pure with respect to the estimator's parameters: it returns the
/// posterior summary together with whatever sufficient statistics the EM step needs,
/// and `em_update` consumes those statistics.
pub trait Estimator {
    /// Sufficient statistics produced by `estimate` for the EM step.
    type Stats;

    /// Short label used in log output.
    fn name(&self) -> &'static str;

    /// Posterior summary of the coefficients given an incoming message.
    fn estimate(&self, incoming: &Message) -> Result<(Message, Self::Stats), EstimatorError>;

    /// Re-estimates the estimator's own parameters. A no-op when tuning is disabled.
    fn em_update(&mut self, stats: &Self::Stats);
}

/// An estimator that also carries a proper prior and can seed the first iteration.
pub trait PriorEstimator: Estimator {
    /// The prior summary broadcast over `len` coordinates.
    fn prior_message(&self, len: usize) -> Message;
}
