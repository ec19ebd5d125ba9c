// Partial least squares regression for a single response (PLS1).

use crate::config::SegmentType;
use crate::error::{PlsrError, PlsrResult};
use crate::linalg_backends::{BackendTriangularSolve, LinAlgBackendProvider};
use log::{debug, trace, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Threshold below which a weight vector or score vector is treated as zero.
const DEGENERACY_TOLERANCE: f64 = 1e-12;

/// A fitted PLS1 model, centred on the training means and not scaled.
///
/// The NIPALS algorithm extracts one latent component at a time:
/// `w = X'y / |X'y|`, `t = Xw`, `p = X't / t't`, `q = y't / t't`, followed by
/// deflation of both `X` and `y`. Coefficients for a model truncated to `k`
/// components are `B_k = W_k (P_k' W_k)^{-1} q_k`; `P'W` is upper triangular
/// with a unit diagonal, so each `B_k` costs one triangular solve.
///
/// The model keeps everything needed to answer questions about any
/// component count from 1 up to `n_components()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlsModel {
    /// Column means of the training predictors. Shape: (n_features)
    x_mean: Array1<f64>,
    /// Mean of the training response.
    y_mean: f64,
    /// Unit-norm weight vectors. Shape: (n_features, n_components)
    weights: Array2<f64>,
    /// Response loadings. Shape: (n_components)
    y_loadings: Array1<f64>,
    /// Training scores. Shape: (n_samples, n_components)
    scores: Array2<f64>,
    /// Column `k - 1` holds the regression coefficients of the `k`-component model.
    /// Shape: (n_features, n_components)
    coefficients: Array2<f64>,
}

impl PlsModel {
    /// Fits up to `n_components` latent components.
    ///
    /// The count is reduced (with a warning) when the data cannot support it:
    /// at most `min(n_samples - 1, n_features)` components exist, and
    /// extraction stops early once the remaining predictors carry no
    /// covariance with the remaining response.
    ///
    /// # Errors
    /// Returns `PlsrError::Fit` if there are fewer than 2 samples, the shapes
    /// disagree, `n_components` is 0, any input is non-finite, not even one
    /// component can be extracted, or the coefficient system is singular.
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>, n_components: usize) -> PlsrResult<Self> {
        let (n_samples, n_features) = x.dim();
        if n_samples < 2 {
            return Err(PlsrError::Fit(format!(
                "at least 2 samples are required, got {}",
                n_samples
            )));
        }
        if n_features == 0 {
            return Err(PlsrError::Fit("predictor matrix has no columns".into()));
        }
        if y.len() != n_samples {
            return Err(PlsrError::Fit(format!(
                "response has {} values but the predictor matrix has {} rows",
                y.len(),
                n_samples
            )));
        }
        if n_components == 0 {
            return Err(PlsrError::Fit("number of components must be greater than 0".into()));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(PlsrError::Fit("inputs contain non-finite values".into()));
        }

        let max_rank = (n_samples - 1).min(n_features);
        let requested = if n_components > max_rank {
            warn!(
                "Requested {} components but {} samples x {} features support at most {}; reducing.",
                n_components, n_samples, n_features, max_rank
            );
            max_rank
        } else {
            n_components
        };

        let x_mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| PlsrError::Fit("failed to compute predictor means".into()))?;
        let y_mean = y.mean().ok_or_else(|| PlsrError::Fit("failed to compute response mean".into()))?;
        let mut x_residual = &x - &x_mean;
        let mut y_residual = y.mapv(|v| v - y_mean);

        let mut weights = Array2::<f64>::zeros((n_features, requested));
        let mut x_loadings = Array2::<f64>::zeros((n_features, requested));
        let mut y_loadings = Array1::<f64>::zeros(requested);
        let mut scores = Array2::<f64>::zeros((n_samples, requested));

        // Relative scales for deciding when the residual covariance is exhausted.
        let initial_cov = x_residual.t().dot(&y_residual);
        let initial_cov_norm = initial_cov.dot(&initial_cov).sqrt();
        let initial_x_ss = x_residual.iter().map(|v| v * v).sum::<f64>();
        let mut extracted = 0usize;

        for a in 0..requested {
            let mut w = x_residual.t().dot(&y_residual);
            let w_norm = w.dot(&w).sqrt();
            if !(w_norm > DEGENERACY_TOLERANCE * initial_cov_norm) {
                debug!("Stopping NIPALS after {} components: no remaining covariance.", a);
                break;
            }
            w.mapv_inplace(|v| v / w_norm);

            let t = x_residual.dot(&w);
            let tt = t.dot(&t);
            if !(tt > DEGENERACY_TOLERANCE * initial_x_ss) {
                debug!("Stopping NIPALS after {} components: zero score vector.", a);
                break;
            }
            let p = x_residual.t().dot(&t) / tt;
            let q = y_residual.dot(&t) / tt;

            // Deflate: X <- X - t p', y <- y - q t
            let t_col = t.view().insert_axis(Axis(1));
            let p_row = p.view().insert_axis(Axis(0));
            x_residual -= &t_col.dot(&p_row);
            y_residual.scaled_add(-q, &t);

            weights.column_mut(a).assign(&w);
            x_loadings.column_mut(a).assign(&p);
            y_loadings[a] = q;
            scores.column_mut(a).assign(&t);
            extracted += 1;
        }

        if extracted == 0 {
            return Err(PlsrError::Fit(
                "no latent component could be extracted: the response has no covariance with the predictors".into(),
            ));
        }
        if extracted < requested {
            warn!("Only {} of {} requested components could be extracted.", extracted, requested);
            weights = weights.slice(s![.., ..extracted]).to_owned();
            x_loadings = x_loadings.slice(s![.., ..extracted]).to_owned();
            y_loadings = y_loadings.slice(s![..extracted]).to_owned();
            scores = scores.slice(s![.., ..extracted]).to_owned();
        }

        let coefficients = cumulative_coefficients(&weights, &x_loadings, &y_loadings)?;
        trace!(
            "Fitted PLS model: {} samples, {} features, {} components",
            n_samples,
            n_features,
            extracted
        );

        Ok(Self {
            x_mean,
            y_mean,
            weights,
            y_loadings,
            scores,
            coefficients,
        })
    }

    /// Number of components actually extracted.
    pub fn n_components(&self) -> usize {
        self.y_loadings.len()
    }

    pub fn n_features(&self) -> usize {
        self.x_mean.len()
    }

    pub fn y_mean(&self) -> f64 {
        self.y_mean
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn scores(&self) -> &Array2<f64> {
        &self.scores
    }

    fn check_components(&self, k: usize) -> PlsrResult<()> {
        if k == 0 || k > self.n_components() {
            return Err(PlsrError::Fit(format!(
                "component count {} is outside 1..={}",
                k,
                self.n_components()
            )));
        }
        Ok(())
    }

    /// Regression coefficients (on the original predictor scale) of the
    /// `k`-component model.
    pub fn coefficients(&self, k: usize) -> PlsrResult<ArrayView1<'_, f64>> {
        self.check_components(k)?;
        Ok(self.coefficients.column(k - 1))
    }

    /// Intercept of the `k`-component model: `y_mean - x_mean . B_k`.
    pub fn intercept(&self, k: usize) -> PlsrResult<f64> {
        let b = self.coefficients(k)?;
        Ok(self.y_mean - self.x_mean.dot(&b))
    }

    /// Predictions for new samples with the `k`-component model.
    pub fn predict(&self, x: ArrayView2<f64>, k: usize) -> PlsrResult<Array1<f64>> {
        let b = self.coefficients(k)?;
        if x.ncols() != self.n_features() {
            return Err(PlsrError::Fit(format!(
                "model was fitted on {} features but got {}",
                self.n_features(),
                x.ncols()
            )));
        }
        let centered = &x - &self.x_mean;
        Ok(centered.dot(&b) + self.y_mean)
    }

    /// Predictions for new samples for every component count, one column per count.
    pub fn predict_all(&self, x: ArrayView2<f64>) -> PlsrResult<Array2<f64>> {
        if x.ncols() != self.n_features() {
            return Err(PlsrError::Fit(format!(
                "model was fitted on {} features but got {}",
                self.n_features(),
                x.ncols()
            )));
        }
        let centered = &x - &self.x_mean;
        Ok(centered.dot(&self.coefficients) + self.y_mean)
    }

    /// In-sample fitted values of the `k`-component model.
    pub fn fitted(&self, k: usize) -> PlsrResult<Array1<f64>> {
        self.check_components(k)?;
        let t = self.scores.slice(s![.., ..k]);
        let q = self.y_loadings.slice(s![..k]);
        Ok(t.dot(&q) + self.y_mean)
    }

    /// Variable importance in projection for the `k`-component model.
    ///
    /// `VIP_j = sqrt(p * sum_a(SS_a * w_ja^2) / sum_a(SS_a))` where
    /// `SS_a = q_a^2 t_a't_a` is the response variance explained by component `a`.
    pub fn vip(&self, k: usize) -> PlsrResult<Array1<f64>> {
        self.check_components(k)?;
        let n_features = self.n_features() as f64;
        let explained: Array1<f64> = (0..k)
            .map(|a| {
                let t = self.scores.column(a);
                self.y_loadings[a].powi(2) * t.dot(&t)
            })
            .collect();
        let total: f64 = explained.sum();
        if !(total > 0.0) {
            return Err(PlsrError::Fit("model explains no response variance".into()));
        }
        let w_sq = self.weights.slice(s![.., ..k]).mapv(|v| v * v);
        let weighted = w_sq.dot(&explained);
        Ok(weighted.mapv(|v| (n_features * v / total).sqrt()))
    }
}

/// `B_k = W_k (P_k' W_k)^{-1} q_k` for every `k`.
fn cumulative_coefficients(
    weights: &Array2<f64>,
    x_loadings: &Array2<f64>,
    y_loadings: &Array1<f64>,
) -> PlsrResult<Array2<f64>> {
    let n_features = weights.nrows();
    let n_components = y_loadings.len();
    let backend = LinAlgBackendProvider::<f64>::new();
    let pw = x_loadings.t().dot(weights);

    let mut coefficients = Array2::<f64>::zeros((n_features, n_components));
    for k in 1..=n_components {
        let pw_k = pw.slice(s![..k, ..k]).to_owned();
        let q_k = y_loadings.slice(s![..k]).to_owned();
        let z = backend
            .solve_upper_triangular(&pw_k, &q_k)
            .map_err(|e| PlsrError::Fit(format!("coefficient system for {} components: {}", k, e)))?;
        coefficients
            .column_mut(k - 1)
            .assign(&weights.slice(s![.., ..k]).dot(&z));
    }
    Ok(coefficients)
}

/// Splits `0..n_samples` into `n_segments` cross-validation folds.
///
/// Segment length is `ceil(n / k)`. For `Random` and `Interleaved` the
/// sequence (a random permutation, or `0..n`) is dealt out round-robin, so
/// when `n` is not a multiple of `k` the last folds are one sample shorter.
/// `Consecutive` cuts the sequence into contiguous blocks. Empty folds are
/// dropped. Only `Random` draws from `rng`.
pub fn cv_segments<R: Rng + ?Sized>(
    n_samples: usize,
    n_segments: usize,
    segment_type: SegmentType,
    rng: &mut R,
) -> PlsrResult<Vec<Vec<usize>>> {
    if n_segments < 2 {
        return Err(PlsrError::Fit(format!(
            "cross-validation needs at least 2 segments, got {}",
            n_segments
        )));
    }
    if n_segments > n_samples {
        return Err(PlsrError::Fit(format!(
            "cannot split {} samples into {} segments",
            n_samples, n_segments
        )));
    }

    let mut order: Vec<usize> = (0..n_samples).collect();
    let segment_len = n_samples.div_ceil(n_segments);
    let mut segments = vec![Vec::with_capacity(segment_len); n_segments];
    match segment_type {
        SegmentType::Random | SegmentType::Interleaved => {
            if segment_type == SegmentType::Random {
                order.shuffle(rng);
            }
            for (pos, idx) in order.into_iter().enumerate() {
                segments[pos % n_segments].push(idx);
            }
        }
        SegmentType::Consecutive => {
            for (pos, idx) in order.into_iter().enumerate() {
                segments[pos / segment_len].push(idx);
            }
        }
    }
    segments.retain(|seg| !seg.is_empty());
    Ok(segments)
}

/// Largest component count every fold's training set can support:
/// `min(n_features, n_samples - largest_fold - 1)`.
pub fn max_cv_components(n_samples: usize, segments: &[Vec<usize>], n_features: usize) -> usize {
    let largest_fold = segments.iter().map(Vec::len).max().unwrap_or(0);
    n_samples
        .saturating_sub(largest_fold)
        .saturating_sub(1)
        .min(n_features)
}

/// Out-of-fold predictions and prediction error sums of squares.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CvResult {
    /// Column `k - 1` holds the out-of-fold predictions of the `k`-component models.
    /// Shape: (n_samples, n_components)
    pub predictions: Array2<f64>,
    /// PRESS for component counts `1..=n_components`.
    pub press: Array1<f64>,
    /// PRESS of the intercept-only model (each fold predicts its training mean).
    pub press0: f64,
    pub segments: Vec<Vec<usize>>,
}

impl CvResult {
    /// Number of component counts the cross-validation evaluated.
    pub fn n_components(&self) -> usize {
        self.press.len()
    }

    /// Root mean squared error of prediction per component count.
    pub fn rmsep(&self) -> Array1<f64> {
        let n = self.predictions.nrows() as f64;
        self.press.mapv(|p| (p / n).sqrt())
    }

    /// Cross-validated R² per component count, `1 - PRESS / SS_tot`.
    pub fn r2(&self, y: ArrayView1<f64>) -> Array1<f64> {
        let mean = y.mean().unwrap_or(0.0);
        let ss_tot: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
        self.press.mapv(|p| if ss_tot > 0.0 { 1.0 - p / ss_tot } else { f64::NAN })
    }
}

/// Segmented cross-validation for component counts `1..=max_components`.
///
/// The evaluated count is capped by `max_cv_components` and by what each
/// fold's model can extract, so the PRESS series may be shorter than
/// requested.
pub fn cross_validate(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    max_components: usize,
    segments: &[Vec<usize>],
) -> PlsrResult<CvResult> {
    let (n_samples, n_features) = x.dim();
    if y.len() != n_samples {
        return Err(PlsrError::Fit(format!(
            "response has {} values but the predictor matrix has {} rows",
            y.len(),
            n_samples
        )));
    }
    let covered: usize = segments.iter().map(Vec::len).sum();
    if covered != n_samples || segments.iter().flatten().any(|&i| i >= n_samples) {
        return Err(PlsrError::Fit(format!(
            "segments cover {} indices but there are {} samples",
            covered, n_samples
        )));
    }

    let cv_limit = max_cv_components(n_samples, segments, n_features);
    if cv_limit == 0 {
        return Err(PlsrError::Fit(format!(
            "{} samples in {} segments leave too few training samples per fold",
            n_samples,
            segments.len()
        )));
    }
    let n_components = if max_components > cv_limit {
        debug!(
            "Reducing cross-validated components from {} to {} ({} samples, {} segments).",
            max_components,
            cv_limit,
            n_samples,
            segments.len()
        );
        cv_limit
    } else {
        max_components
    };

    let mut predictions = Array2::<f64>::from_elem((n_samples, n_components), f64::NAN);
    let mut press0 = 0.0;
    let mut evaluated = n_components;

    for (fold, held_out) in segments.iter().enumerate() {
        let mut in_fold = vec![false; n_samples];
        for &i in held_out {
            in_fold[i] = true;
        }
        let train: Vec<usize> = (0..n_samples).filter(|&i| !in_fold[i]).collect();

        let x_train = x.select(Axis(0), &train);
        let y_train = y.select(Axis(0), &train);
        let x_test = x.select(Axis(0), held_out);

        let model = PlsModel::fit(x_train.view(), y_train.view(), n_components)?;
        evaluated = evaluated.min(model.n_components());
        let fold_predictions = model.predict_all(x_test.view())?;
        for (row, &sample) in held_out.iter().enumerate() {
            predictions
                .slice_mut(s![sample, ..model.n_components()])
                .assign(&fold_predictions.row(row));
            press0 += (y[sample] - model.y_mean()).powi(2);
        }
        trace!(
            "Fold {}: {} training samples, {} held out, {} components",
            fold,
            train.len(),
            held_out.len(),
            model.n_components()
        );
    }

    if evaluated < n_components {
        debug!(
            "A fold extracted only {} of {} components; truncating the PRESS series.",
            evaluated, n_components
        );
        predictions = predictions.slice(s![.., ..evaluated]).to_owned();
    }

    let press: Array1<f64> = predictions
        .axis_iter(Axis(1))
        .map(|col| col.iter().zip(y.iter()).map(|(p, obs)| (obs - p).powi(2)).sum::<f64>())
        .collect();

    Ok(CvResult {
        predictions,
        press,
        press0,
        segments: segments.to_vec(),
    })
}

/// A model fitted on all samples together with its cross-validation.
#[derive(Clone, Debug)]
pub struct ValidatedPlsModel {
    pub model: PlsModel,
    pub validation: CvResult,
}

/// Fits on all samples and cross-validates over the given segments.
pub fn fit_with_validation(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    max_components: usize,
    segments: &[Vec<usize>],
) -> PlsrResult<ValidatedPlsModel> {
    let validation = cross_validate(x, y, max_components, segments)?;
    let model = PlsModel::fit(x, y, validation.n_components())?;
    Ok(ValidatedPlsModel { model, validation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn interleaved_segments_follow_round_robin() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let segs = cv_segments(10, 4, SegmentType::Interleaved, &mut rng).unwrap();
        assert_eq!(segs, vec![vec![0, 4, 8], vec![1, 5, 9], vec![2, 6], vec![3, 7]]);
    }

    #[test]
    fn consecutive_segments_are_blocks() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let segs = cv_segments(10, 4, SegmentType::Consecutive, &mut rng).unwrap();
        assert_eq!(segs, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8], vec![9]]);
    }

    #[test]
    fn random_segments_partition_all_indices() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let segs = cv_segments(23, 5, SegmentType::Random, &mut rng).unwrap();
        assert_eq!(segs.len(), 5);
        let mut all: Vec<usize> = segs.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        let sizes: Vec<usize> = segs.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 5, 5, 4, 4]);
    }

    #[test]
    fn rejects_too_many_segments() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(cv_segments(3, 4, SegmentType::Interleaved, &mut rng).is_err());
        assert!(cv_segments(3, 1, SegmentType::Interleaved, &mut rng).is_err());
    }

    #[test]
    fn cv_limit_accounts_for_largest_fold() {
        let segs = vec![vec![0, 4, 8], vec![1, 5, 9], vec![2, 6], vec![3, 7]];
        assert_eq!(max_cv_components(10, &segs, 100), 6);
        assert_eq!(max_cv_components(10, &segs, 3), 3);
    }
}
