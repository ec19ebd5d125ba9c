// End-to-end analysis: acquire, assemble, select components, fit, report.

use crate::config::{AnalysisConfig, SelectionRule};
use crate::dataset::{AnalysisSet, DatasetAssembler};
use crate::error::PlsrResult;
use crate::final_fit::{ComponentMetrics, FinalFitConfig, FinalModelFitter, FittedResult};
use crate::loader::{export_url, fetch_raw_table, read_raw_table, RawTable};
use crate::report::{ReportPaths, Reporter};
use crate::selection::{ComponentSelection, ComponentSelector, ComponentSelectorConfig, PValueEntry, PressSummary};
use log::{info, warn};
use serde::Serialize;
use std::time::Instant;

/// Everything one analysis run produced.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Where the table came from: a file path or the export URL.
    pub source: String,
    pub data: AnalysisSet,
    pub selection: ComponentSelection,
    /// Count the configured automated rule picked, if any.
    pub suggested_components: Option<usize>,
    /// Count the final model was fitted with.
    pub selected_components: usize,
    pub fitted: FittedResult,
    pub report: ReportPaths,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    source: &'a str,
    config: &'a AnalysisConfig,
    num_samples: usize,
    num_wavelengths: usize,
    trait_name: &'a str,
    selection_rule: SelectionRule,
    suggested_components: Option<usize>,
    selected_components: usize,
    press_summary: Vec<PressSummary>,
    p_values: &'a [PValueEntry],
    final_metrics: Option<&'a ComponentMetrics>,
    intercept: f64,
    press0: f64,
    outputs: &'a ReportPaths,
}

/// Runs the whole workflow from one validated configuration.
#[derive(Debug, Clone)]
pub struct PlsrAnalysis {
    config: AnalysisConfig,
}

impl PlsrAnalysis {
    pub fn new(config: AnalysisConfig) -> PlsrResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn selector_config(&self) -> ComponentSelectorConfig {
        ComponentSelectorConfig {
            max_components: self.config.max_components,
            iterations: self.config.iterations,
            cv_segments: self.config.cv_segments,
            cv_segment_type: self.config.cv_segment_type,
            subsample_fraction: self.config.subsample_fraction,
            random_seed: self.config.seed,
            threads: self.config.threads,
        }
    }

    pub fn final_fit_config(&self, selected_components: usize) -> FinalFitConfig {
        FinalFitConfig {
            selected_components,
            segments: self.config.final_segments,
            segment_type: self.config.final_segment_type,
            random_seed: self.config.seed,
        }
    }

    /// Reads `input_path` when set, otherwise downloads the package export.
    /// Returns the table and a description of where it came from.
    pub fn load_raw(&self) -> PlsrResult<(RawTable, String)> {
        match &self.config.input_path {
            Some(path) => {
                info!("Reading dataset from {}", path.display());
                Ok((read_raw_table(path)?, path.display().to_string()))
            }
            None => {
                let url = export_url(&self.config.host, &self.config.dataset_id)?;
                info!("Downloading dataset {} from {}", self.config.dataset_id, url);
                let raw = fetch_raw_table(&url)?;
                Ok((raw, url.to_string()))
            }
        }
    }

    pub fn assemble(&self, raw: &RawTable) -> PlsrResult<AnalysisSet> {
        let assembler = DatasetAssembler::new(
            self.config.start_wave,
            self.config.end_wave,
            self.config.metadata_columns.clone(),
        )?;
        assembler.assemble(raw)
    }

    /// The rule's pick (if any) and the count actually used. `Manual`, or a
    /// rule that finds nothing, falls back to `selected_components`.
    pub fn choose_components(&self, selection: &ComponentSelection) -> (Option<usize>, usize) {
        let fallback = self.config.selected_components;
        match self.config.selection_rule {
            SelectionRule::Manual => (None, fallback),
            rule => match selection.apply(rule) {
                Some(c) => {
                    info!("Selection rule {:?} picked {} components", rule, c);
                    (Some(c), c)
                }
                None => {
                    warn!(
                        "Selection rule {:?} found no component count; using the configured {}",
                        rule, fallback
                    );
                    (None, fallback)
                }
            },
        }
    }

    /// Loads the data and runs every stage.
    pub fn run(&self) -> PlsrResult<AnalysisOutcome> {
        let (raw, source) = self.load_raw()?;
        self.run_on_table(&raw, source)
    }

    /// Runs every stage after acquisition on an already loaded table.
    pub fn run_on_table(&self, raw: &RawTable, source: String) -> PlsrResult<AnalysisOutcome> {
        let start = Instant::now();
        let data = self.assemble(raw)?;

        let selector = ComponentSelector::new(self.selector_config())?;
        let selection = selector.select(&data)?;
        for entry in &selection.p_values {
            info!(
                "PRESS {} vs {} components: p = {}",
                entry.components,
                entry.comparator,
                entry.p_value.map_or_else(|| "n/a".to_string(), |p| format!("{:.4}", p))
            );
        }

        let (suggested_components, selected_components) = self.choose_components(&selection);
        let fitter = FinalModelFitter::new(self.final_fit_config(selected_components))?;
        let fitted = fitter.fit(&data)?;

        // Nothing touches the output directory until every stage has succeeded.
        let reporter = Reporter::new(&self.config.output_dir, self.config.render_plots, self.config.stratify_by)?;
        let mut report = ReportPaths::default();
        reporter.write_spectral_report(&data, &mut report)?;
        reporter.write_selection_report(&selection, &mut report)?;
        reporter.write_fit_report(&data, &fitted, &mut report)?;

        let summary = RunSummary {
            source: &source,
            config: &self.config,
            num_samples: data.num_samples(),
            num_wavelengths: data.num_wavelengths(),
            trait_name: data.trait_name(),
            selection_rule: self.config.selection_rule,
            suggested_components,
            selected_components,
            press_summary: selection.press.summary(),
            p_values: &selection.p_values,
            final_metrics: fitted.selected_metrics(),
            intercept: fitted.intercept,
            press0: fitted.press0,
            outputs: &report,
        };
        let mut final_report = report.clone();
        reporter.write_summary_json(&summary, &mut final_report)?;

        info!(
            "Analysis finished in {:?}; outputs in {}",
            start.elapsed(),
            reporter.output_dir().display()
        );
        Ok(AnalysisOutcome {
            source,
            data,
            selection,
            suggested_components,
            selected_components,
            fitted,
            report: final_report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{press_p_values, PressMatrix};
    use ndarray::array;

    fn selection() -> ComponentSelection {
        let press = PressMatrix::new(array![[10.0, 8.0, 6.0], [9.0, 7.0, 5.0]]).unwrap();
        ComponentSelection {
            p_values: press_p_values(&press).unwrap(),
            press,
        }
    }

    #[test]
    fn manual_rule_uses_configured_count() {
        let analysis = PlsrAnalysis::new(AnalysisConfig {
            selected_components: 7,
            ..AnalysisConfig::default()
        })
        .unwrap();
        assert_eq!(analysis.choose_components(&selection()), (None, 7));
    }

    #[test]
    fn automated_rule_overrides_and_falls_back() {
        let analysis = PlsrAnalysis::new(AnalysisConfig {
            selection_rule: SelectionRule::FirstMinimum,
            ..AnalysisConfig::default()
        })
        .unwrap();
        assert_eq!(analysis.choose_components(&selection()), (Some(3), 3));

        // Two runs with a steady drop never reach p > 0.999.
        let analysis = PlsrAnalysis::new(AnalysisConfig {
            selection_rule: SelectionRule::FirstPlateau { alpha: 0.999 },
            selected_components: 2,
            ..AnalysisConfig::default()
        })
        .unwrap();
        assert_eq!(analysis.choose_components(&selection()), (None, 2));
    }

    #[test]
    fn sub_configs_follow_the_analysis_config() {
        let analysis = PlsrAnalysis::new(AnalysisConfig {
            seed: 9,
            iterations: 3,
            final_segments: 4,
            threads: Some(2),
            ..AnalysisConfig::default()
        })
        .unwrap();
        let selector = analysis.selector_config();
        assert_eq!(selector.random_seed, 9);
        assert_eq!(selector.iterations, 3);
        assert_eq!(selector.threads, Some(2));
        let final_fit = analysis.final_fit_config(5);
        assert_eq!(final_fit.selected_components, 5);
        assert_eq!(final_fit.segments, 4);
        assert_eq!(final_fit.random_seed, 9);
    }
}
