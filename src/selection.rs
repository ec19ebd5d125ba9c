// Choosing the number of PLSR components by repeated sub-sampled cross-validation.

use crate::config::{SegmentType, SelectionRule};
use crate::dataset::AnalysisSet;
use crate::error::{PlsrError, PlsrResult};
use crate::plsr::{cross_validate, cv_segments};
use crate::stats;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Parameters of the selection runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentSelectorConfig {
    /// Largest component count evaluated (columns of the PRESS matrix).
    pub max_components: usize,
    /// Number of sub-sampled cross-validation runs (rows of the PRESS matrix).
    pub iterations: usize,
    /// Folds per run.
    pub cv_segments: usize,
    pub cv_segment_type: SegmentType,
    /// Fraction of the samples drawn without replacement for each run.
    pub subsample_fraction: f64,
    /// Base seed. Run `i` uses stream `i` of a ChaCha8 generator seeded with it,
    /// so results do not depend on how runs are scheduled across threads.
    pub random_seed: u64,
    /// Worker threads. `None` uses all but one processing unit.
    pub threads: Option<usize>,
}

impl Default for ComponentSelectorConfig {
    fn default() -> Self {
        ComponentSelectorConfig {
            max_components: 20,
            iterations: 50,
            cv_segments: 5,
            cv_segment_type: SegmentType::Random,
            subsample_fraction: 0.70,
            random_seed: 2025,
            threads: None,
        }
    }
}

/// PRESS values of every run: one row per run, one column per component count
/// (column `c - 1` is `c` components). Counts a run did not evaluate are `NaN`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PressMatrix {
    values: Array2<f64>,
}

impl PressMatrix {
    pub fn new(values: Array2<f64>) -> PlsrResult<Self> {
        if values.iter().any(|v| !v.is_nan() && (*v < 0.0 || v.is_infinite())) {
            return Err(PlsrError::Fit("PRESS values must be finite and non-negative".into()));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn num_iterations(&self) -> usize {
        self.values.nrows()
    }

    pub fn max_components(&self) -> usize {
        self.values.ncols()
    }

    pub fn row(&self, iteration: usize) -> ArrayView1<'_, f64> {
        self.values.row(iteration)
    }

    /// Non-missing PRESS values for `components` (1-based) across all runs.
    pub fn column_values(&self, components: usize) -> Vec<f64> {
        if components == 0 || components > self.max_components() {
            return Vec::new();
        }
        self.values
            .column(components - 1)
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .collect()
    }

    /// Mean, standard deviation and count of PRESS per component count.
    pub fn summary(&self) -> Vec<PressSummary> {
        (1..=self.max_components())
            .map(|c| {
                let values = self.column_values(c);
                PressSummary {
                    components: c,
                    mean: stats::mean(&values),
                    sd: stats::sample_variance(&values).map(f64::sqrt),
                    n: values.len(),
                }
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PressSummary {
    pub components: usize,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub n: usize,
}

/// Result of comparing the PRESS distribution of `components` with that of
/// `comparator` (always `components + 1`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PValueEntry {
    pub components: usize,
    pub comparator: usize,
    /// `None` when either count has fewer than two PRESS values.
    pub p_value: Option<f64>,
}

/// PRESS matrix and the pairwise comparisons derived from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentSelection {
    pub press: PressMatrix,
    pub p_values: Vec<PValueEntry>,
}

impl ComponentSelection {
    /// Smallest count whose PRESS is not significantly different from the
    /// next count's (p > `alpha`).
    pub fn first_plateau(&self, alpha: f64) -> Option<usize> {
        self.p_values
            .iter()
            .find(|entry| entry.p_value.is_some_and(|p| p > alpha))
            .map(|entry| entry.components)
    }

    /// Smallest count whose mean PRESS is not improved on by the next count.
    /// If mean PRESS keeps falling, the largest evaluated count.
    pub fn first_minimum(&self) -> Option<usize> {
        let means: Vec<(usize, f64)> = self
            .press
            .summary()
            .into_iter()
            .filter_map(|s| s.mean.map(|m| (s.components, m)))
            .collect();
        means
            .windows(2)
            .find(|pair| pair[0].1 <= pair[1].1)
            .map(|pair| pair[0].0)
            .or_else(|| means.last().map(|&(c, _)| c))
    }

    /// Applies an automated rule. `Manual` never picks a count.
    pub fn apply(&self, rule: SelectionRule) -> Option<usize> {
        match rule {
            SelectionRule::Manual => None,
            SelectionRule::FirstPlateau { alpha } => self.first_plateau(alpha),
            SelectionRule::FirstMinimum => self.first_minimum(),
        }
    }
}

/// The generator used by selection run `iteration`.
pub fn iteration_rng(random_seed: u64, iteration: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(random_seed);
    rng.set_stream(iteration as u64);
    rng
}

/// Welch t-tests between neighbouring component counts: 1 vs 2, 2 vs 3, ...,
/// `max - 1` vs `max`. The sequence has `max_components - 1` entries.
pub fn press_p_values(press: &PressMatrix) -> PlsrResult<Vec<PValueEntry>> {
    let max_components = press.max_components();
    let mut entries = Vec::with_capacity(max_components.saturating_sub(1));
    let mut comparator = 2usize;
    for components in 1..max_components {
        if comparator > max_components {
            break;
        }
        let current = press.column_values(components);
        let next = press.column_values(comparator);
        let p_value = if current.len() < 2 || next.len() < 2 {
            None
        } else {
            Some(stats::welch_t_test(&current, &next)?.p_value)
        };
        debug!("PRESS {} vs {} components: p = {:?}", components, comparator, p_value);
        entries.push(PValueEntry {
            components,
            comparator,
            p_value,
        });
        comparator += 1;
    }
    Ok(entries)
}

/// Runs the repeated sub-sampled cross-validation and the PRESS comparisons.
#[derive(Debug, Clone)]
pub struct ComponentSelector {
    config: ComponentSelectorConfig,
}

impl ComponentSelector {
    pub fn new(config: ComponentSelectorConfig) -> PlsrResult<Self> {
        if config.max_components == 0 {
            return Err(PlsrError::Config("max_components must be greater than 0".into()));
        }
        if config.iterations == 0 {
            return Err(PlsrError::Config("iterations must be greater than 0".into()));
        }
        if config.cv_segments < 2 {
            return Err(PlsrError::Config("cv_segments must be at least 2".into()));
        }
        if !(config.subsample_fraction > 0.0 && config.subsample_fraction <= 1.0) {
            return Err(PlsrError::Config(format!(
                "subsample_fraction must be in (0, 1], got {}",
                config.subsample_fraction
            )));
        }
        if config.threads == Some(0) {
            return Err(PlsrError::Config("threads must be greater than 0 when set".into()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ComponentSelectorConfig {
        &self.config
    }

    /// Fills the PRESS matrix and compares neighbouring component counts.
    pub fn select(&self, data: &AnalysisSet) -> PlsrResult<ComponentSelection> {
        let press = self.run_press_iterations(data)?;
        let p_values = press_p_values(&press)?;
        Ok(ComponentSelection { press, p_values })
    }

    /// Runs every iteration and collects the PRESS rows in iteration order.
    /// The first failing iteration aborts the whole run.
    pub fn run_press_iterations(&self, data: &AnalysisSet) -> PlsrResult<PressMatrix> {
        let n_samples = data.num_samples();
        let subsample_size = self.subsample_size(n_samples);
        if subsample_size < self.config.cv_segments {
            return Err(PlsrError::Fit(format!(
                "sub-sample of {} samples cannot be split into {} segments",
                subsample_size, self.config.cv_segments
            )));
        }
        let num_threads = self.config.threads.unwrap_or_else(default_thread_count);

        info!(
            "Starting component selection: {} iterations, {} of {} samples each, {} {:?} segments, up to {} components, {} threads",
            self.config.iterations,
            subsample_size,
            n_samples,
            self.config.cv_segments,
            self.config.cv_segment_type,
            self.config.max_components,
            num_threads
        );
        let start = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| PlsrError::Config(format!("could not build worker pool: {}", e)))?;

        let rows: Vec<Array1<f64>> = pool.install(|| {
            (0..self.config.iterations)
                .into_par_iter()
                .map(|iteration| self.run_iteration(data, subsample_size, iteration))
                .collect::<PlsrResult<Vec<_>>>()
        })?;

        let mut values = Array2::<f64>::from_elem((self.config.iterations, self.config.max_components), f64::NAN);
        for (mut target, row) in values.axis_iter_mut(Axis(0)).zip(rows.iter()) {
            target.assign(row);
        }

        let short_rows = values
            .axis_iter(Axis(0))
            .filter(|row| row.iter().any(|v| v.is_nan()))
            .count();
        if short_rows > 0 {
            warn!(
                "{} of {} iterations evaluated fewer than {} components; missing PRESS values left empty.",
                short_rows, self.config.iterations, self.config.max_components
            );
        }
        info!("Component selection finished in {:?}", start.elapsed());
        PressMatrix::new(values)
    }

    fn subsample_size(&self, n_samples: usize) -> usize {
        (self.config.subsample_fraction * n_samples as f64).floor() as usize
    }

    /// One run: draw the sub-sample, cross-validate, return a full-width PRESS row.
    fn run_iteration(&self, data: &AnalysisSet, subsample_size: usize, iteration: usize) -> PlsrResult<Array1<f64>> {
        let mut rng = iteration_rng(self.config.random_seed, iteration);
        let n_samples = data.num_samples();

        let indices: Vec<usize> = if subsample_size >= n_samples {
            (0..n_samples).collect()
        } else {
            index::sample(&mut rng, n_samples, subsample_size).into_vec()
        };
        let x = data.spectra().select(Axis(0), &indices);
        let y = data.trait_values().select(Axis(0), &indices);

        let segments = cv_segments(indices.len(), self.config.cv_segments, self.config.cv_segment_type, &mut rng)?;
        let cv = cross_validate(x.view(), y.view(), self.config.max_components, &segments)?;

        let mut row = Array1::<f64>::from_elem(self.config.max_components, f64::NAN);
        let evaluated = cv.n_components().min(self.config.max_components);
        row.slice_mut(ndarray::s![..evaluated])
            .assign(&cv.press.slice(ndarray::s![..evaluated]));
        debug!(
            "Iteration {}: {} samples, {} components evaluated, min PRESS {:.4}",
            iteration,
            indices.len(),
            evaluated,
            cv.press.iter().cloned().fold(f64::INFINITY, f64::min)
        );
        Ok(row)
    }
}

/// All but one available processing unit, and at least one.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn press_matrix(rows: Array2<f64>) -> PressMatrix {
        PressMatrix::new(rows).unwrap()
    }

    #[test]
    fn p_value_sequence_has_one_entry_per_neighbouring_pair() {
        let press = press_matrix(array![
            [10.0, 6.0, 5.0, 5.1],
            [11.0, 6.5, 5.2, 5.0],
            [10.5, 6.2, 4.9, 5.2],
        ]);
        let entries = press_p_values(&press).unwrap();
        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.components, i + 1);
            assert_eq!(entry.comparator, i + 2);
            let p = entry.p_value.unwrap();
            assert!((0.0..=1.0).contains(&p));
        }
        // 1 vs 2 differ clearly; 3 vs 4 do not.
        assert!(entries[0].p_value.unwrap() < 0.01);
        assert!(entries[2].p_value.unwrap() > 0.05);
    }

    #[test]
    fn missing_columns_give_no_p_value() {
        let press = press_matrix(array![[10.0, 6.0, f64::NAN], [11.0, 6.5, f64::NAN]]);
        let entries = press_p_values(&press).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].p_value.is_some());
        assert_eq!(entries[1].p_value, None);
    }

    #[test]
    fn rules_pick_documented_counts() {
        let press = press_matrix(array![
            [10.0, 6.0, 5.0, 5.1],
            [11.0, 6.5, 5.2, 5.0],
            [10.5, 6.2, 4.9, 5.2],
        ]);
        let p_values = press_p_values(&press).unwrap();
        let selection = ComponentSelection { press, p_values };
        assert_eq!(selection.apply(SelectionRule::Manual), None);
        // Means: 10.5, 6.23, 5.03, 5.1 -> first minimum at 3.
        assert_eq!(selection.first_minimum(), Some(3));
        let plateau = selection.first_plateau(0.05).unwrap();
        assert!(plateau >= 2 && plateau <= 3, "plateau = {}", plateau);
    }

    #[test]
    fn first_minimum_falls_back_to_largest_count() {
        let press = press_matrix(array![[10.0, 8.0, 6.0], [9.0, 7.0, 5.0]]);
        let selection = ComponentSelection {
            p_values: press_p_values(&press).unwrap(),
            press,
        };
        assert_eq!(selection.first_minimum(), Some(3));
    }

    #[test]
    fn negative_press_is_rejected() {
        assert!(PressMatrix::new(array![[1.0, -0.5]]).is_err());
    }

    #[test]
    fn iteration_streams_differ() {
        use rand::Rng;
        let a: u64 = iteration_rng(1, 0).gen();
        let b: u64 = iteration_rng(1, 1).gen();
        let a_again: u64 = iteration_rng(1, 0).gen();
        assert_ne!(a, b);
        assert_eq!(a, a_again);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = ComponentSelectorConfig::default();
        config.subsample_fraction = 1.2;
        assert!(ComponentSelector::new(config).is_err());
        let mut config = ComponentSelectorConfig::default();
        config.threads = Some(0);
        assert!(ComponentSelector::new(config).is_err());
    }
}
