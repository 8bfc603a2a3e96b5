use approx::assert_abs_diff_eq;
use emvamp::estimator::EstimatorError;
use emvamp::solver::ParameterTrace;
use emvamp::{FitStatus, VampConfig, VampError, fit_em_vamp};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

fn gaussian_design(n: usize, p: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((n, p), |_| rng.sample(StandardNormal))
}

/// Sparse signal: every `stride`-th coefficient is `value`, the rest zero.
fn sparse_problem(
    n: usize,
    p: usize,
    stride: usize,
    value: f64,
    noise_sd: f64,
    seed: u64,
) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = gaussian_design(n, p, &mut rng);
    let beta = Array1::from_shape_fn(p, |j| if j % stride == 0 { value } else { 0.0 });
    let noise = Array1::from_shape_fn(n, |_| noise_sd * rng.sample::<f64, _>(StandardNormal));
    let y = x.dot(&beta) + noise + 2.0;
    (x, y, beta)
}

fn assert_mixture_invariants(trace: &ParameterTrace, floor: f64) {
    for params in std::iter::once(&trace.initial_mixture).chain(trace.mixtures.iter()) {
        assert_abs_diff_eq!(params.weights.sum(), 1.0, epsilon = 1e-9);
        assert!(params.variances.iter().all(|&v| v >= floor));
    }
}

#[test]
fn trajectory_has_one_entry_per_iteration() {
    let (x, y, _) = sparse_problem(60, 15, 5, 1.0, 0.5, 1);
    for max_iter in [1, 7, 30] {
        let config = VampConfig {
            max_iter,
            ..VampConfig::default()
        };
        let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();
        assert_eq!(fit.trajectory.len(), max_iter);
        assert_eq!(fit.trajectory.intercepts.len(), max_iter);
        assert_eq!(fit.trajectory.coefficients.dim(), (max_iter, 15));
        assert_eq!(fit.trace.noise_variances.len(), max_iter);
        assert_eq!(fit.trace.mixtures.len(), max_iter);

        let (b0, slopes) = fit.trajectory.at(max_iter - 1);
        assert_eq!(b0, fit.intercept);
        assert_eq!(slopes, fit.coefficients);
    }
}

#[test]
fn hand_derived_fixed_point_is_reproduced_exactly() {
    // X' = [[1, 1], [1, -1]] has orthogonal columns, y' = (2, -2), noise variance 4.
    // Prior N(0, 1): the output posterior is N((0, 2/3), 2/3), the extrinsic message
    // N((0, 2), 2), the denoised posterior N((0, 2/3), 2/3), and the message back to
    // the output side is N(0, 1) again, so every round repeats.
    let x = array![[1.0], [-1.0]];
    let y = array![3.0, -1.0];
    let config = VampConfig {
        max_iter: 3,
        weights: Some(vec![1.0]),
        means: Some(vec![0.0]),
        variances: Some(vec![1.0]),
        tune_mixture: false,
        tune_noise_variance: false,
        ..VampConfig::default()
    };
    let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();

    assert_eq!(fit.status, FitStatus::Finite);
    assert_eq!(fit.noise_variance, 4.0);
    for iter in 0..3 {
        let (b0, slopes) = fit.trajectory.at(iter);
        assert_abs_diff_eq!(b0, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(slopes[0], 2.0 / 3.0, epsilon = 1e-12);
    }
    assert_eq!(fit.trajectory.first_settled(1e-10), Some(1));
}

#[test]
fn pure_noise_first_iterate_is_small() {
    let mut rng = StdRng::seed_from_u64(2024);
    let x = gaussian_design(50, 20, &mut rng);
    let y = Array1::from_shape_fn(50, |_| rng.sample::<f64, _>(StandardNormal));
    let config = VampConfig {
        max_iter: 1,
        weights: Some(vec![0.9, 0.1]),
        means: Some(vec![0.0, 0.0]),
        variances: Some(vec![1e-4, 1.0]),
        ..VampConfig::default()
    };
    let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();

    assert_eq!(fit.trajectory.len(), 1);
    assert_eq!(fit.trajectory.coefficients.ncols(), 20);
    assert!(fit.trajectory.coefficients.iter().all(|b| b.abs() < 1.0));
}

#[test]
fn recovers_sparse_signal() {
    let (x, y, beta) = sparse_problem(200, 40, 8, 3.0, 0.5, 7);
    let fit = fit_em_vamp(x.view(), y.view(), &VampConfig::default()).unwrap();

    assert_eq!(fit.status, FitStatus::Finite);
    let err = &fit.coefficients - &beta;
    let rmse = (err.dot(&err) / beta.len() as f64).sqrt();
    assert!(rmse < 0.2, "coefficient RMSE {rmse}");
    assert_abs_diff_eq!(fit.intercept, 2.0, epsilon = 0.3);
    // The learned noise variance should land near the true 0.25.
    assert!(fit.noise_variance > 0.1 && fit.noise_variance < 0.5);
}

#[test]
fn em_keeps_weights_normalized_and_variances_floored() {
    let (x, y, _) = sparse_problem(80, 30, 6, 2.0, 1.0, 3);
    for k in 1..=4 {
        let config = VampConfig {
            max_iter: 25,
            num_components: Some(k),
            ..VampConfig::default()
        };
        let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();
        assert_eq!(fit.mixture.num_components(), k);
        assert_mixture_invariants(&fit.trace, config.variance_floor);
    }
}

#[test]
fn fixed_means_and_variances_are_bit_identical() {
    let (x, y, _) = sparse_problem(80, 30, 6, 2.0, 1.0, 4);
    let config = VampConfig {
        max_iter: 20,
        ..VampConfig::ash_grid(10)
    };
    let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();

    let initial = &fit.trace.initial_mixture;
    for params in &fit.trace.mixtures {
        assert_eq!(params.means, initial.means);
        assert_eq!(params.variances, initial.variances);
    }
    assert_mixture_invariants(&fit.trace, config.variance_floor);
    // Only the weights were free, and they moved.
    assert!(fit.mixture.weights != initial.weights);
}

#[test]
fn frozen_mixture_never_changes() {
    let (x, y, _) = sparse_problem(50, 20, 4, 1.5, 0.7, 5);
    let config = VampConfig {
        max_iter: 15,
        tune_mixture: false,
        ..VampConfig::default()
    };
    let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();
    for params in &fit.trace.mixtures {
        assert_eq!(params, &fit.trace.initial_mixture);
    }
}

#[test]
fn frozen_noise_variance_never_changes() {
    let (x, y, _) = sparse_problem(50, 20, 4, 1.5, 0.7, 6);
    let config = VampConfig {
        max_iter: 15,
        tune_noise_variance: false,
        ..VampConfig::default()
    };
    let fit = fit_em_vamp(x.view(), y.view(), &config).unwrap();

    let initial = fit.trace.initial_noise_variance;
    assert_eq!(fit.trace.noise_variances[0], initial);
    assert_eq!(*fit.trace.noise_variances.last().unwrap(), initial);
    assert_eq!(fit.noise_variance, initial);

    let centered = &y - y.mean().unwrap();
    assert_abs_diff_eq!(initial, centered.dot(&centered) / 50.0, epsilon = 1e-12);
}

#[test]
fn repeated_runs_are_bit_identical() {
    let (x, y, _) = sparse_problem(120, 60, 10, 2.0, 0.5, 8);
    let config = VampConfig {
        max_iter: 40,
        ..VampConfig::default()
    };
    let first = fit_em_vamp(x.view(), y.view(), &config).unwrap();
    let second = fit_em_vamp(x.view(), y.view(), &config).unwrap();
    assert_eq!(first.trajectory, second.trajectory);
    assert_eq!(first.trace, second.trace);
}

#[test]
fn independent_runs_can_execute_concurrently() {
    let problems: Vec<_> = (0..4)
        .map(|seed| sparse_problem(60, 25, 5, 1.0, 0.5, 100 + seed))
        .collect();
    let config = VampConfig {
        max_iter: 20,
        ..VampConfig::default()
    };

    let sequential: Vec<_> = problems
        .iter()
        .map(|(x, y, _)| fit_em_vamp(x.view(), y.view(), &config).unwrap().trajectory)
        .collect();

    let concurrent: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = problems
            .iter()
            .map(|(x, y, _)| {
                let config = &config;
                scope.spawn(move || fit_em_vamp(x.view(), y.view(), config).unwrap().trajectory)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(sequential, concurrent);
}

#[test]
fn wide_problem_runs() {
    let (x, y, _) = sparse_problem(30, 120, 20, 2.0, 0.3, 9);
    let fit = fit_em_vamp(x.view(), y.view(), &VampConfig::default()).unwrap();
    assert_eq!(fit.trajectory.len(), 100);
    assert_eq!(fit.coefficients.len(), 120);
}

#[test]
fn rank_deficient_noiseless_design_fails_with_partial_trajectory() {
    // Two identical predictors and a constant response: the noise variance starts at
    // zero and the augmented design has rank 2 of 3.
    let x = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]];
    let y = array![5.0, 5.0, 5.0, 5.0];
    let config = VampConfig {
        max_iter: 10,
        tune_noise_variance: false,
        ..VampConfig::default()
    };
    let err = fit_em_vamp(x.view(), y.view(), &config).unwrap_err();

    match &err {
        VampError::NumericalInstability {
            iteration,
            source,
            partial,
        } => {
            assert_eq!(*iteration, 0);
            assert!(matches!(source, EstimatorError::SingularPosterior { rank: 2, cols: 3, .. }));
            assert!(partial.is_empty());
        }
        other => panic!("expected NumericalInstability, got {other:?}"),
    }
    assert!(!err.is_configuration_error());
    assert!(err.partial_trajectory().is_some());
}

#[test]
fn configuration_errors_are_raised_before_fitting() {
    let x = Array2::<f64>::zeros((5, 2));
    let y = Array1::<f64>::zeros(4);
    assert!(matches!(
        fit_em_vamp(x.view(), y.view(), &VampConfig::default()),
        Err(VampError::ShapeMismatch { rows: 5, len: 4 })
    ));

    let y = Array1::<f64>::zeros(5);
    let config = VampConfig {
        weights: Some(vec![0.5, 0.5]),
        means: Some(vec![0.0]),
        ..VampConfig::default()
    };
    assert!(matches!(
        fit_em_vamp(x.view(), y.view(), &config),
        Err(VampError::MixtureLengthMismatch { .. })
    ));
}
