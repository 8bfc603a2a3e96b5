//! Post-fit checks for callers that decide whether to re-run a fit.
//!
//! EM tuning of the noise variance occasionally drives VAMP off to infinity. The
//! solver never retries on its own; these helpers give a driver a cheap signal for
//! when a re-run with the noise variance frozen is worth trying.

use crate::solver::{FitStatus, VampError, VampFit};
use ndarray::{ArrayView1, ArrayView2};

/// Training RMSE at or above this marks a fit as divergent.
pub const DIVERGENT_RMSE: f64 = 1e3;

/// Root mean squared error of the final iterate on `(x, y)`.
pub fn training_rmse(
    fit: &VampFit,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<f64, VampError> {
    if x.nrows() != y.len() {
        return Err(VampError::ShapeMismatch {
            rows: x.nrows(),
            len: y.len(),
        });
    }
    let residual = &y - &fit.predict(x)?;
    Ok(residual.mapv(|r| r * r).mean().unwrap_or(0.0).sqrt())
}

/// Whether the fit shows the usual signs of a diverged run: a non-finite final
/// iterate, or a training error so large it cannot be a real fit.
///
/// Passing this check does not prove convergence.
pub fn looks_divergent(
    fit: &VampFit,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<bool, VampError> {
    if fit.status == FitStatus::NonFinite {
        return Ok(true);
    }
    let rmse = training_rmse(fit, x, y)?;
    Ok(!rmse.is_finite() || rmse >= DIVERGENT_RMSE)
}
