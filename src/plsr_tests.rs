use crate::config::SegmentType;
use crate::plsr::{cross_validate, cv_segments, fit_with_validation, PlsModel};
use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::Solve;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Normal, Uniform};

/// Reflectance-like predictors in [0, 1) and a response driven by a few of them.
fn generate_regression_data(n_samples: usize, n_features: usize, noise_sd: f64, seed: u64) -> (Array2<f64>, Array1<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let x = Array2::random_using((n_samples, n_features), Uniform::new(0.0, 1.0), &mut rng);
    let mut beta = Array1::<f64>::zeros(n_features);
    beta[0] = 25.0;
    beta[n_features / 2] = -12.0;
    beta[n_features - 1] = 8.0;
    let noise = Array1::random_using(n_samples, Normal::new(0.0, noise_sd).unwrap(), &mut rng);
    let y = x.dot(&beta) + 60.0 + noise;
    (x, y)
}

fn ordinary_least_squares(x: &Array2<f64>, y: &Array1<f64>) -> Array1<f64> {
    let x_mean = x.mean_axis(Axis(0)).unwrap();
    let y_mean = y.mean().unwrap();
    let xc = x - &x_mean;
    let yc = y - y_mean;
    let xtx = xc.t().dot(&xc);
    let xty = xc.t().dot(&yc);
    xtx.solve_into(xty).unwrap()
}

#[test]
fn full_rank_model_matches_least_squares() {
    let (x, y) = generate_regression_data(40, 5, 0.5, 1);
    let model = PlsModel::fit(x.view(), y.view(), 5).unwrap();
    assert_eq!(model.n_components(), 5);
    let ols = ordinary_least_squares(&x, &y);
    let pls = model.coefficients(5).unwrap();
    for (a, b) in pls.iter().zip(ols.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
}

#[test]
fn weights_are_orthonormal_and_scores_orthogonal() {
    let (x, y) = generate_regression_data(30, 12, 1.0, 2);
    let model = PlsModel::fit(x.view(), y.view(), 6).unwrap();
    let wtw = model.weights().t().dot(model.weights());
    let ttt = model.scores().t().dot(model.scores());
    for i in 0..model.n_components() {
        assert_abs_diff_eq!(wtw[[i, i]], 1.0, epsilon = 1e-10);
        for j in 0..model.n_components() {
            if i != j {
                assert_abs_diff_eq!(wtw[[i, j]], 0.0, epsilon = 1e-8);
                assert_abs_diff_eq!(ttt[[i, j]] / (ttt[[i, i]] * ttt[[j, j]]).sqrt(), 0.0, epsilon = 1e-8);
            }
        }
    }
}

#[test]
fn predictions_on_training_data_equal_fitted_values() {
    let (x, y) = generate_regression_data(25, 10, 1.0, 3);
    let model = PlsModel::fit(x.view(), y.view(), 4).unwrap();
    for k in 1..=model.n_components() {
        let predicted = model.predict(x.view(), k).unwrap();
        let fitted = model.fitted(k).unwrap();
        for (p, f) in predicted.iter().zip(fitted.iter()) {
            assert_abs_diff_eq!(*p, *f, epsilon = 1e-8);
        }
        // Intercept form gives the same predictions.
        let b = model.coefficients(k).unwrap();
        let via_intercept = x.dot(&b) + model.intercept(k).unwrap();
        for (p, q) in predicted.iter().zip(via_intercept.iter()) {
            assert_abs_diff_eq!(*p, *q, epsilon = 1e-8);
        }
    }
    let all = model.predict_all(x.view()).unwrap();
    assert_eq!(all.dim(), (25, model.n_components()));
}

#[test]
fn vip_squares_average_to_one() {
    let (x, y) = generate_regression_data(35, 20, 1.0, 4);
    let model = PlsModel::fit(x.view(), y.view(), 5).unwrap();
    for k in 1..=5 {
        let vip = model.vip(k).unwrap();
        assert_eq!(vip.len(), 20);
        let mean_sq = vip.mapv(|v| v * v).mean().unwrap();
        assert_abs_diff_eq!(mean_sq, 1.0, epsilon = 1e-10);
    }
    // The driving wavelengths stand out in the one-component model.
    let vip1 = model.vip(1).unwrap();
    assert!(vip1[0] > 1.0, "VIP of the strongest predictor = {}", vip1[0]);
}

#[test]
fn calibration_error_does_not_increase_with_components() {
    let (x, y) = generate_regression_data(40, 15, 2.0, 5);
    let model = PlsModel::fit(x.view(), y.view(), 8).unwrap();
    let mut previous = f64::INFINITY;
    for k in 1..=model.n_components() {
        let fitted = model.fitted(k).unwrap();
        let sse: f64 = fitted.iter().zip(y.iter()).map(|(f, o)| (f - o).powi(2)).sum();
        assert!(sse <= previous + 1e-8, "SSE rose at {} components", k);
        previous = sse;
    }
}

#[test]
fn component_count_is_reduced_for_small_samples() {
    let (x, y) = generate_regression_data(5, 30, 1.0, 6);
    let model = PlsModel::fit(x.view(), y.view(), 10).unwrap();
    assert!(model.n_components() <= 4);
    assert!(model.coefficients(model.n_components() + 1).is_err());
    assert!(model.coefficients(0).is_err());
}

#[test]
fn constant_response_cannot_be_fitted() {
    let (x, _) = generate_regression_data(10, 4, 1.0, 7);
    let y = Array1::from_elem(10, 3.0);
    assert!(PlsModel::fit(x.view(), y.view(), 2).is_err());
}

#[test]
fn non_finite_input_is_rejected() {
    let (mut x, y) = generate_regression_data(10, 4, 1.0, 8);
    x[[2, 1]] = f64::NAN;
    assert!(PlsModel::fit(x.view(), y.view(), 2).is_err());
}

#[test]
fn cross_validation_predictions_come_from_held_out_models() {
    let (x, y) = generate_regression_data(24, 10, 1.0, 9);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let segments = cv_segments(24, 4, SegmentType::Interleaved, &mut rng).unwrap();
    let cv = cross_validate(x.view(), y.view(), 3, &segments).unwrap();
    assert_eq!(cv.n_components(), 3);

    // Rebuild the first fold by hand.
    let held_out = &segments[0];
    let train: Vec<usize> = (0..24).filter(|i| !held_out.contains(i)).collect();
    let model = PlsModel::fit(
        x.select(Axis(0), &train).view(),
        y.select(Axis(0), &train).view(),
        3,
    )
    .unwrap();
    let expected = model.predict(x.select(Axis(0), held_out).view(), 2).unwrap();
    for (row, &sample) in held_out.iter().enumerate() {
        assert_abs_diff_eq!(cv.predictions[[sample, 1]], expected[row], epsilon = 1e-10);
    }

    for k in 0..cv.n_components() {
        let press: f64 = cv
            .predictions
            .column(k)
            .iter()
            .zip(y.iter())
            .map(|(p, o)| (o - p).powi(2))
            .sum();
        assert_abs_diff_eq!(cv.press[k], press, epsilon = 1e-8);
    }
    // The signal is strong enough that one component beats the mean.
    assert!(cv.press[0] < cv.press0);
    assert!(cv.r2(y.view())[0] > 0.0);
}

#[test]
fn cross_validation_is_capped_by_fold_size() {
    let (x, y) = generate_regression_data(12, 50, 1.0, 10);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let segments = cv_segments(12, 3, SegmentType::Consecutive, &mut rng).unwrap();
    let cv = cross_validate(x.view(), y.view(), 20, &segments).unwrap();
    // 12 samples, folds of 4: at most 12 - 4 - 1 = 7 components.
    assert!(cv.n_components() <= 7);
    assert!(cv.press.iter().all(|p| p.is_finite() && *p >= 0.0));
}

#[test]
fn validated_model_matches_its_cross_validation() {
    let (x, y) = generate_regression_data(30, 8, 1.0, 11);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let segments = cv_segments(30, 5, SegmentType::Random, &mut rng).unwrap();
    let validated = fit_with_validation(x.view(), y.view(), 6, &segments).unwrap();
    assert_eq!(validated.model.n_components(), validated.validation.n_components());
    assert_eq!(validated.validation.segments, segments);
}
