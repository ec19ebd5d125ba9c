// Small statistics helpers shared by selection, fitting and reporting.

use crate::error::{PlsrError, PlsrResult};
use float_cmp::approx_eq;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Outcome of a Welch two-sample t-test.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TTest {
    pub statistic: f64,
    pub degrees_of_freedom: f64,
    /// Two-sided p-value, always within [0, 1].
    pub p_value: f64,
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Unbiased sample variance (n - 1 denominator).
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64)
}

/// Welch's unequal-variance two-sample t-test, two-sided.
///
/// When both samples have zero variance the statistic is undefined; the
/// p-value is then 1 if the means coincide and 0 otherwise.
///
/// # Errors
/// Returns `PlsrError::Stats` if either sample has fewer than 2 values or
/// contains non-finite values.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> PlsrResult<TTest> {
    if a.len() < 2 || b.len() < 2 {
        return Err(PlsrError::Stats(format!(
            "t-test needs at least 2 observations per group, got {} and {}",
            a.len(),
            b.len()
        )));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(PlsrError::Stats("t-test input contains non-finite values".into()));
    }

    let (n_a, n_b) = (a.len() as f64, b.len() as f64);
    let (mean_a, mean_b) = (mean(a).unwrap_or(0.0), mean(b).unwrap_or(0.0));
    let (var_a, var_b) = (
        sample_variance(a).unwrap_or(0.0),
        sample_variance(b).unwrap_or(0.0),
    );
    let se_a = var_a / n_a;
    let se_b = var_b / n_b;
    let stderr = (se_a + se_b).sqrt();
    let diff = mean_a - mean_b;

    let scale = mean_a.abs().max(mean_b.abs()).max(1.0);
    if stderr <= 10.0 * f64::EPSILON * scale {
        let same = approx_eq!(f64, mean_a, mean_b, ulps = 4, epsilon = 10.0 * f64::EPSILON * scale);
        return Ok(TTest {
            statistic: if same { 0.0 } else { diff.signum() * f64::INFINITY },
            degrees_of_freedom: n_a + n_b - 2.0,
            p_value: if same { 1.0 } else { 0.0 },
        });
    }

    let statistic = diff / stderr;
    let df = (se_a + se_b).powi(2) / (se_a.powi(2) / (n_a - 1.0) + se_b.powi(2) / (n_b - 1.0));
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| PlsrError::Stats(format!("invalid t distribution (df = {}): {}", df, e)))?;
    let p_value = (2.0 * dist.cdf(-statistic.abs())).clamp(0.0, 1.0);

    Ok(TTest {
        statistic,
        degrees_of_freedom: df,
        p_value,
    })
}

/// Sample quantile using linear interpolation between order statistics
/// (the common "type 7" definition). `sorted` must be ascending.
pub fn quantile_sorted(sorted: &[f64], prob: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&prob) {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * prob;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

/// Coefficient of determination `1 - SSE / SST`.
pub fn r_squared(observed: &[f64], predicted: &[f64]) -> Option<f64> {
    if observed.len() != predicted.len() || observed.len() < 2 {
        return None;
    }
    let m = mean(observed)?;
    let ss_tot: f64 = observed.iter().map(|v| (v - m).powi(2)).sum();
    if ss_tot <= 0.0 {
        return None;
    }
    let sse: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(o, p)| (o - p).powi(2))
        .sum();
    Some(1.0 - sse / ss_tot)
}

/// Root mean squared error.
pub fn rmse(observed: &[f64], predicted: &[f64]) -> Option<f64> {
    if observed.len() != predicted.len() || observed.is_empty() {
        return None;
    }
    let sse: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(o, p)| (o - p).powi(2))
        .sum();
    Some((sse / observed.len() as f64).sqrt())
}
