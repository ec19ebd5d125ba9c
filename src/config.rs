use crate::dataset::CategoricalField;
use crate::error::{PlsrError, PlsrResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// How samples are assigned to cross-validation folds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    /// A random permutation of the samples, split into folds.
    Random,
    /// Sample `i` goes to fold `i mod k`.
    Interleaved,
    /// Contiguous blocks of samples.
    Consecutive,
}

/// How the component count for the final model is chosen once the PRESS
/// comparisons are available.
///
/// Picking the count is a judgement call made by looking at the p-value
/// sequence, so the default leaves it to the caller. The automated rules
/// only run when asked for.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SelectionRule {
    /// Use `AnalysisConfig::selected_components` as given.
    Manual,
    /// Smallest count whose PRESS distribution is not significantly different
    /// (p > `alpha`) from the next count.
    FirstPlateau { alpha: f64 },
    /// Smallest count whose mean PRESS is not improved upon by the next count.
    FirstMinimum,
}

/// Column names in the exported table, and the names they take after assembly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataColumns {
    pub domain: String,
    pub functional_type: String,
    pub sample_id: String,
    /// Source column holding the species code.
    pub species_code_source: String,
    /// Name the species code column is given in the analysis table.
    pub species_code_name: String,
    /// Source column holding the trait measurement.
    pub trait_source: String,
    /// Name the trait column is given in the analysis table.
    pub trait_name: String,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        MetadataColumns {
            domain: "Domain".to_string(),
            functional_type: "Functional_type".to_string(),
            sample_id: "Sample_ID".to_string(),
            species_code_source: "USDA Symbol".to_string(),
            species_code_name: "USDA_Species_Code".to_string(),
            trait_source: "LMA".to_string(),
            trait_name: "LMA_gDW_m2".to_string(),
        }
    }
}

/// Parameters of the whole analysis. Everything that used to be a hard-coded
/// constant at the top of the workflow lives here, initialised once per process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Host serving the package export API.
    pub host: String,
    /// Identifier of the dataset package to export.
    pub dataset_id: String,
    /// Read the export from this CSV file instead of downloading it.
    pub input_path: Option<PathBuf>,

    /// First wavelength (nm, inclusive) of the spectral matrix.
    pub start_wave: u32,
    /// Last wavelength (nm, inclusive) of the spectral matrix.
    pub end_wave: u32,
    pub metadata_columns: MetadataColumns,

    /// Largest component count evaluated during selection.
    pub max_components: usize,
    /// Number of sub-sampled cross-validation runs.
    pub iterations: usize,
    /// Folds per selection run.
    pub cv_segments: usize,
    pub cv_segment_type: SegmentType,
    /// Fraction of the samples drawn (without replacement) for each selection run.
    pub subsample_fraction: f64,
    pub selection_rule: SelectionRule,
    /// Component count of the final model (used directly under `SelectionRule::Manual`,
    /// and as the fallback when an automated rule finds nothing).
    pub selected_components: usize,
    /// Folds of the final model's cross-validation.
    pub final_segments: usize,
    pub final_segment_type: SegmentType,

    /// Seed for the sub-sampling and random fold assignment.
    pub seed: u64,
    /// Worker threads for the selection runs. `None` uses all but one processing unit.
    pub threads: Option<usize>,

    pub output_dir: PathBuf,
    pub render_plots: bool,
    /// Categorical field used to colour/group the plots and summaries.
    pub stratify_by: Option<CategoricalField>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            host: "ecosis.org".to_string(),
            dataset_id: "5617da17-c925-49fb-b395-45a51291bd2d".to_string(),
            input_path: None,
            start_wave: 500,
            end_wave: 2400,
            metadata_columns: MetadataColumns::default(),
            max_components: 20,
            iterations: 50,
            cv_segments: 5,
            cv_segment_type: SegmentType::Random,
            subsample_fraction: 0.70,
            selection_rule: SelectionRule::Manual,
            selected_components: 12,
            final_segments: 30,
            final_segment_type: SegmentType::Interleaved,
            seed: 2025,
            threads: None,
            output_dir: PathBuf::from("plsr_output"),
            render_plots: true,
            stratify_by: Some(CategoricalField::FunctionalType),
        }
    }
}

impl AnalysisConfig {
    /// Reads a JSON configuration file. Missing keys take their default values.
    pub fn from_json_file(path: &Path) -> PlsrResult<Self> {
        let file = File::open(path)?;
        let config: AnalysisConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the parameters before any work is done.
    pub fn validate(&self) -> PlsrResult<()> {
        if self.start_wave > self.end_wave {
            return Err(PlsrError::Config(format!(
                "start_wave ({}) must not exceed end_wave ({})",
                self.start_wave, self.end_wave
            )));
        }
        if self.max_components == 0 {
            return Err(PlsrError::Config("max_components must be greater than 0".into()));
        }
        if self.iterations == 0 {
            return Err(PlsrError::Config("iterations must be greater than 0".into()));
        }
        if self.cv_segments < 2 {
            return Err(PlsrError::Config(format!(
                "cv_segments must be at least 2, got {}",
                self.cv_segments
            )));
        }
        if self.final_segments < 2 {
            return Err(PlsrError::Config(format!(
                "final_segments must be at least 2, got {}",
                self.final_segments
            )));
        }
        if !(self.subsample_fraction > 0.0 && self.subsample_fraction <= 1.0) {
            return Err(PlsrError::Config(format!(
                "subsample_fraction must be in (0, 1], got {}",
                self.subsample_fraction
            )));
        }
        if self.selected_components == 0 {
            return Err(PlsrError::Config("selected_components must be greater than 0".into()));
        }
        if let SelectionRule::FirstPlateau { alpha } = self.selection_rule {
            if !(alpha > 0.0 && alpha < 1.0) {
                return Err(PlsrError::Config(format!(
                    "first-plateau alpha must be in (0, 1), got {}",
                    alpha
                )));
            }
        }
        if self.threads == Some(0) {
            return Err(PlsrError::Config("threads must be greater than 0 when set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AnalysisConfig::default();
        config.validate().unwrap();
        assert_eq!((config.start_wave, config.end_wave), (500, 2400));
        assert_eq!(config.selection_rule, SelectionRule::Manual);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = AnalysisConfig::default();
        config.subsample_fraction = 0.0;
        assert!(matches!(config.validate(), Err(PlsrError::Config(_))));

        let mut config = AnalysisConfig::default();
        config.start_wave = 2500;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.cv_segments = 1;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.selection_rule = SelectionRule::FirstPlateau { alpha: 1.5 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "iterations": 10,
                "cv_segment_type": "interleaved",
                "selection_rule": {{ "rule": "first_plateau", "alpha": 0.05 }},
                "stratify_by": "domain",
                "metadata_columns": {{ "trait_source": "Nmass" }}
            }}"#
        )
        .unwrap();

        let config = AnalysisConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.iterations, 10);
        assert_eq!(config.cv_segment_type, SegmentType::Interleaved);
        assert_eq!(config.selection_rule, SelectionRule::FirstPlateau { alpha: 0.05 });
        assert_eq!(config.stratify_by, Some(CategoricalField::Domain));
        assert_eq!(config.metadata_columns.trait_source, "Nmass");
        assert_eq!(config.metadata_columns.domain, "Domain");
        assert_eq!(config.max_components, 20);
    }
}
