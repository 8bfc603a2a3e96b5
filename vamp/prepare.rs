//! # Design Preprocessing
//!
//! Turns a raw regression problem `(X, y)` into the centered, intercept-augmented
//! problem the message-passing solver works on, and maps solver estimates back.
//!
//! - The response is mean-centered: `y' = y - mean(y)`.
//! - The design gains a leading all-ones column: `X' = [1 | X]`.
//! - `restore` reverses both steps for a single coefficient estimate.

use crate::solver::VampError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// The centered, intercept-augmented regression problem owned by one fit call.
#[derive(Debug, Clone)]
pub struct AugmentedProblem {
    /// `[1 | X]`, shape `[n, p + 1]`.
    pub x: Array2<f64>,
    /// Mean-centered response, length `n`.
    pub y: Array1<f64>,
    /// Mean of the original response, re-added to the intercept on restore.
    pub y_mean: f64,
}

impl AugmentedProblem {
    pub fn num_samples(&self) -> usize {
        self.x.nrows()
    }

    /// Number of augmented coefficients (intercept plus slopes).
    pub fn num_coefficients(&self) -> usize {
        self.x.ncols()
    }

    /// Mean energy of the centered response, the starting noise variance.
    pub fn response_energy(&self) -> f64 {
        self.y.mapv(|v| v * v).mean().unwrap_or(0.0)
    }

    /// Mean squared entry of the augmented design.
    pub fn design_energy(&self) -> f64 {
        self.x.mapv(|v| v * v).mean().unwrap_or(0.0)
    }
}

/// Validates `(X, y)` and builds the augmented problem.
pub fn prepare(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<AugmentedProblem, VampError> {
    let (n, p) = x.dim();
    if n == 0 || p == 0 {
        return Err(VampError::EmptyDesign { rows: n, cols: p });
    }
    if y.len() != n {
        return Err(VampError::ShapeMismatch {
            rows: n,
            len: y.len(),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(VampError::NonFiniteInput("design matrix"));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(VampError::NonFiniteInput("response vector"));
    }

    let y_mean = y.sum() / n as f64;
    let y_centered = y.mapv(|v| v - y_mean);

    let mut x_aug = Array2::<f64>::ones((n, p + 1));
    x_aug.slice_mut(s![.., 1..]).assign(&x);

    log::debug!("Augmented design: {n} samples, {} coefficients, response mean {y_mean:.6}", p + 1);

    Ok(AugmentedProblem {
        x: x_aug,
        y: y_centered,
        y_mean,
    })
}

/// Splits an augmented estimate into `(intercept, slopes)`, re-adding the response mean.
pub fn restore(y_mean: f64, estimate: ArrayView1<f64>) -> (f64, Array1<f64>) {
    match estimate.len() {
        0 => (y_mean, Array1::zeros(0)),
        _ => (estimate[0] + y_mean, estimate.slice(s![1..]).to_owned()),
    }
}
