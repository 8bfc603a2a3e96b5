//! Per-iteration record of the coefficient estimate.
//!
//! The solver writes one augmented estimate per round into a buffer sized for
//! `max_iter` rounds up front. At the end every entry is mapped back to the original
//! scale (intercept with the response mean re-added, plus slopes), so callers can
//! evaluate the fit as a function of iteration count.

use crate::prepare::restore;
use crate::solver::VampError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};

/// Augmented estimates in iteration order, pre-sized to the iteration budget.
#[derive(Debug, Clone)]
pub struct IterateHistory {
    estimates: Array2<f64>,
    len: usize,
}

impl IterateHistory {
    pub fn with_capacity(max_iter: usize, num_coefficients: usize) -> Self {
        Self {
            estimates: Array2::zeros((max_iter, num_coefficients)),
            len: 0,
        }
    }

    /// Appends the estimate of the next iteration.
    pub fn record(&mut self, estimate: ArrayView1<f64>) {
        assert!(
            self.len < self.estimates.nrows(),
            "iterate history is full ({} entries)",
            self.estimates.nrows()
        );
        self.estimates.row_mut(self.len).assign(&estimate);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.estimates.nrows()
    }

    pub fn num_coefficients(&self) -> usize {
        self.estimates.ncols()
    }

    pub fn last(&self) -> Option<ArrayView1<'_, f64>> {
        self.len.checked_sub(1).map(|i| self.estimates.row(i))
    }

    /// The recorded rows, in iteration order.
    pub fn as_view(&self) -> ArrayView2<'_, f64> {
        self.estimates.slice(s![..self.len, ..])
    }
}

/// The un-centered coefficient path, one row per iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Intercept at each iteration, response mean included.
    pub intercepts: Array1<f64>,
    /// Slopes at each iteration, shape `[iterations, p]`.
    pub coefficients: Array2<f64>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.intercepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intercepts.is_empty()
    }

    /// `(intercept, slopes)` at iteration `iter`.
    pub fn at(&self, iter: usize) -> (f64, ArrayView1<'_, f64>) {
        (self.intercepts[iter], self.coefficients.row(iter))
    }

    /// Whether every value recorded at iteration `iter` is finite.
    pub fn is_finite_at(&self, iter: usize) -> bool {
        self.intercepts[iter].is_finite() && self.coefficients.row(iter).iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between consecutive iterates (intercept included);
    /// entry `i` compares iterations `i` and `i + 1`.
    pub fn step_sizes(&self) -> Array1<f64> {
        (1..self.len())
            .map(|i| {
                let d0 = self.intercepts[i] - self.intercepts[i - 1];
                let slopes = &self.coefficients.row(i) - &self.coefficients.row(i - 1);
                (d0 * d0 + slopes.dot(&slopes)).sqrt()
            })
            .collect()
    }

    /// First iteration whose distance to its predecessor is below `tolerance`.
    ///
    /// The solver always runs its full budget; this only helps read the path.
    pub fn first_settled(&self, tolerance: f64) -> Option<usize> {
        self.step_sizes()
            .iter()
            .position(|&step| step < tolerance)
            .map(|i| i + 1)
    }

    /// Predictions for new rows at every iteration, shape `[iterations, rows]`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, VampError> {
        if x.ncols() != self.coefficients.ncols() {
            return Err(VampError::InvalidConfig(format!(
                "prediction design has {} columns but the fit has {} slopes",
                x.ncols(),
                self.coefficients.ncols()
            )));
        }
        let mut out = self.coefficients.dot(&x.t());
        for (mut row, &b0) in out.axis_iter_mut(Axis(0)).zip(self.intercepts.iter()) {
            row += b0;
        }
        Ok(out)
    }
}

/// Maps every recorded estimate back to the original scale and returns the path
/// together with the final `(intercept, slopes)`.
pub fn finalize(history: &IterateHistory, y_mean: f64) -> (Trajectory, f64, Array1<f64>) {
    let rows = history.as_view();
    let p = history.num_coefficients().saturating_sub(1);

    let mut intercepts = Array1::zeros(rows.nrows());
    let mut coefficients = Array2::zeros((rows.nrows(), p));
    for (i, row) in rows.axis_iter(Axis(0)).enumerate() {
        let (b0, slopes) = restore(y_mean, row);
        intercepts[i] = b0;
        coefficients.row_mut(i).assign(&slopes);
    }

    let (final_intercept, final_coefficients) = match history.last() {
        Some(row) => restore(y_mean, row),
        None => (y_mean, Array1::zeros(p)),
    };

    (
        Trajectory {
            intercepts,
            coefficients,
        },
        final_intercept,
        final_coefficients,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample_history() -> IterateHistory {
        let mut history = IterateHistory::with_capacity(3, 3);
        history.record(array![0.5, 1.0, -1.0].view());
        history.record(array![0.25, 2.0, 0.0].view());
        history.record(array![0.25, 2.0, 0.0].view());
        history
    }

    #[test]
    fn test_finalize_restores_every_entry() {
        let history = sample_history();
        let (trajectory, b0, slopes) = finalize(&history, 10.0);

        assert_eq!(trajectory.len(), 3);
        assert_eq!(trajectory.intercepts, array![10.5, 10.25, 10.25]);
        assert_eq!(trajectory.coefficients.row(0), array![1.0, -1.0]);
        assert_eq!(b0, 10.25);
        assert_eq!(slopes, array![2.0, 0.0]);
    }

    #[test]
    fn test_partial_history_keeps_only_recorded_rows() {
        let mut history = IterateHistory::with_capacity(5, 2);
        history.record(array![1.0, 1.0].view());
        assert_eq!(history.len(), 1);
        assert_eq!(history.capacity(), 5);

        let (trajectory, b0, slopes) = finalize(&history, 0.0);
        assert_eq!(trajectory.len(), 1);
        assert_eq!(b0, 1.0);
        assert_eq!(slopes, array![1.0]);
    }

    #[test]
    fn test_empty_history_finalizes_to_null_fit() {
        let history = IterateHistory::with_capacity(4, 3);
        let (trajectory, b0, slopes) = finalize(&history, 2.5);
        assert!(trajectory.is_empty());
        assert_eq!(b0, 2.5);
        assert_eq!(slopes, Array1::<f64>::zeros(2));
    }

    #[test]
    #[should_panic(expected = "iterate history is full")]
    fn test_record_past_capacity_panics() {
        let mut history = IterateHistory::with_capacity(1, 1);
        history.record(array![0.0].view());
        history.record(array![0.0].view());
    }

    #[test]
    fn test_step_sizes_and_first_settled() {
        let (trajectory, _, _) = finalize(&sample_history(), 0.0);
        let steps = trajectory.step_sizes();
        assert_eq!(steps.len(), 2);
        // (-0.25, 1, 1)
        assert_abs_diff_eq!(steps[0], (0.0625f64 + 2.0).sqrt(), epsilon = 1e-12);
        assert_eq!(steps[1], 0.0);
        assert_eq!(trajectory.first_settled(1e-8), Some(2));
        assert_eq!(trajectory.first_settled(0.0), None);
    }

    #[test]
    fn test_predict_per_iteration() {
        let (trajectory, _, _) = finalize(&sample_history(), 1.0);
        let x_new = array![[1.0, 0.0], [0.0, 1.0], [2.0, 2.0]];
        let predictions = trajectory.predict(x_new.view()).unwrap();
        assert_eq!(predictions.dim(), (3, 3));
        // iteration 0: intercept 1.5, slopes (1, -1)
        assert_eq!(predictions.row(0), array![2.5, 0.5, 1.5]);
        // iteration 1: intercept 1.25, slopes (2, 0)
        assert_eq!(predictions.row(1), array![3.25, 1.25, 5.25]);

        assert!(trajectory.predict(array![[1.0]].view()).is_err());
    }
}
