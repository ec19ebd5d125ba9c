// Final PLSR model on the full data set at the chosen component count.

use crate::config::SegmentType;
use crate::dataset::AnalysisSet;
use crate::error::{PlsrError, PlsrResult};
use crate::plsr::{cv_segments, fit_with_validation, CvResult, PlsModel};
use crate::stats;
use log::{debug, info};
use ndarray::Array1;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalFitConfig {
    pub selected_components: usize,
    /// Cross-validation folds of the final fit.
    pub segments: usize,
    pub segment_type: SegmentType,
    /// Only consulted for `SegmentType::Random`.
    pub random_seed: u64,
}

impl Default for FinalFitConfig {
    fn default() -> Self {
        FinalFitConfig {
            selected_components: 12,
            segments: 30,
            segment_type: SegmentType::Interleaved,
            random_seed: 2025,
        }
    }
}

/// Calibration and cross-validation statistics of the `components`-component model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetrics {
    pub components: usize,
    pub calibration_r2: Option<f64>,
    pub calibration_rmse: Option<f64>,
    pub cv_r2: Option<f64>,
    pub rmsep: f64,
    pub press: f64,
}

/// Per-sample outcome of the final model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleFit {
    pub sample_id: String,
    pub observed: f64,
    pub fitted: f64,
    /// `fitted - observed`.
    pub residual: f64,
    /// Out-of-fold prediction at the selected component count.
    pub cv_predicted: f64,
}

/// Everything the reporting stage needs from the final model.
#[derive(Clone, Debug)]
pub struct FittedResult {
    pub selected_components: usize,
    pub samples: Vec<SampleFit>,
    /// One entry per component count the validation evaluated.
    pub metrics: Vec<ComponentMetrics>,
    pub wavelengths: Vec<u32>,
    /// Coefficients of the selected model, one per wavelength.
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    pub vip: Array1<f64>,
    pub press0: f64,
    pub model: PlsModel,
    pub validation: CvResult,
}

impl FittedResult {
    pub fn observed(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.observed).collect()
    }

    pub fn fitted(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.fitted).collect()
    }

    pub fn residuals(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.residual).collect()
    }

    pub fn cv_predicted(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.cv_predicted).collect()
    }

    /// Metrics at the selected component count.
    pub fn selected_metrics(&self) -> Option<&ComponentMetrics> {
        self.metrics.iter().find(|m| m.components == self.selected_components)
    }
}

#[derive(Debug, Clone)]
pub struct FinalModelFitter {
    config: FinalFitConfig,
}

impl FinalModelFitter {
    pub fn new(config: FinalFitConfig) -> PlsrResult<Self> {
        if config.selected_components == 0 {
            return Err(PlsrError::Config("selected_components must be greater than 0".into()));
        }
        if config.segments < 2 {
            return Err(PlsrError::Config("final segments must be at least 2".into()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &FinalFitConfig {
        &self.config
    }

    /// Fits once on all samples, cross-validates over the configured folds and
    /// extracts fitted values and residuals at the selected component count.
    pub fn fit(&self, data: &AnalysisSet) -> PlsrResult<FittedResult> {
        let k = self.config.selected_components;
        info!(
            "Fitting final model: {} samples, {} wavelengths, {} components, {} {:?} segments",
            data.num_samples(),
            data.num_wavelengths(),
            k,
            self.config.segments,
            self.config.segment_type
        );
        let start = Instant::now();

        let x = data.spectra();
        let y = data.trait_values();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_seed);
        let segments = cv_segments(data.num_samples(), self.config.segments, self.config.segment_type, &mut rng)?;
        let validated = fit_with_validation(x, y.view(), k, &segments)?;
        let model = validated.model;
        let validation = validated.validation;

        if model.n_components() < k {
            return Err(PlsrError::Fit(format!(
                "{} components were selected but the data support only {} under {}-fold cross-validation",
                k,
                model.n_components(),
                segments.len()
            )));
        }

        let fitted = model.fitted(k)?;
        let cv_predicted = validation.predictions.column(k - 1);
        let samples: Vec<SampleFit> = data
            .metadata()
            .iter()
            .enumerate()
            .map(|(i, meta)| SampleFit {
                sample_id: meta.sample_id.clone(),
                observed: meta.trait_value,
                fitted: fitted[i],
                residual: fitted[i] - meta.trait_value,
                cv_predicted: cv_predicted[i],
            })
            .collect();

        let observed = y.to_vec();
        let cv_r2 = validation.r2(y.view());
        let rmsep = validation.rmsep();
        let metrics = (1..=validation.n_components())
            .map(|c| {
                let calibration = model.fitted(c)?.to_vec();
                Ok(ComponentMetrics {
                    components: c,
                    calibration_r2: stats::r_squared(&observed, &calibration),
                    calibration_rmse: stats::rmse(&observed, &calibration),
                    cv_r2: Some(cv_r2[c - 1]).filter(|v| v.is_finite()),
                    rmsep: rmsep[c - 1],
                    press: validation.press[c - 1],
                })
            })
            .collect::<PlsrResult<Vec<_>>>()?;

        let coefficients = model.coefficients(k)?.to_owned();
        let intercept = model.intercept(k)?;
        let vip = model.vip(k)?;

        if let Some(m) = metrics.iter().find(|m| m.components == k) {
            info!(
                "Final model ({} components): calibration R2 = {:.3}, RMSE = {:.3}; CV R2 = {:.3}, RMSEP = {:.3}",
                k,
                m.calibration_r2.unwrap_or(f64::NAN),
                m.calibration_rmse.unwrap_or(f64::NAN),
                m.cv_r2.unwrap_or(f64::NAN),
                m.rmsep
            );
        }
        debug!("Final fit finished in {:?}", start.elapsed());

        Ok(FittedResult {
            selected_components: k,
            samples,
            metrics,
            wavelengths: data.wavelengths().to_vec(),
            coefficients,
            intercept,
            vip,
            press0: validation.press0,
            model,
            validation,
        })
    }
}
