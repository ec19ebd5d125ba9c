// Turns an exported table into the spectra + trait analysis set.

use crate::config::MetadataColumns;
use crate::error::{PlsrError, PlsrResult};
use crate::loader::RawTable;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Categorical metadata fields that plots and summaries can be grouped by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalField {
    Domain,
    FunctionalType,
    SpeciesCode,
}

impl fmt::Display for CategoricalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CategoricalField::Domain => "domain",
            CategoricalField::FunctionalType => "functional_type",
            CategoricalField::SpeciesCode => "species_code",
        };
        write!(f, "{}", name)
    }
}

/// Per-sample metadata kept for modelling and reporting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub domain: String,
    pub functional_type: String,
    pub sample_id: String,
    pub species_code: String,
    pub trait_value: f64,
}

impl SampleMetadata {
    pub fn categorical(&self, field: CategoricalField) -> &str {
        match field {
            CategoricalField::Domain => &self.domain,
            CategoricalField::FunctionalType => &self.functional_type,
            CategoricalField::SpeciesCode => &self.species_code,
        }
    }
}

/// One sample: its metadata and its reflectance spectrum.
#[derive(Clone, Debug)]
pub struct AnalysisRecord<'a> {
    pub metadata: &'a SampleMetadata,
    pub spectrum: ArrayView1<'a, f64>,
}

/// All samples ready for modelling. Row `i` of `spectra` is the spectrum of
/// `metadata[i]`; columns follow `wavelengths`, strictly ascending.
/// Built once and only read afterwards.
#[derive(Clone, Debug)]
pub struct AnalysisSet {
    metadata: Vec<SampleMetadata>,
    spectra: Array2<f64>,
    wavelengths: Vec<u32>,
    trait_name: String,
    species_code_name: String,
}

impl AnalysisSet {
    /// Builds a set directly from its parts.
    pub fn new(
        metadata: Vec<SampleMetadata>,
        spectra: Array2<f64>,
        wavelengths: Vec<u32>,
        trait_name: impl Into<String>,
        species_code_name: impl Into<String>,
    ) -> PlsrResult<Self> {
        if metadata.len() != spectra.nrows() {
            return Err(PlsrError::Schema(format!(
                "{} metadata rows but {} spectra",
                metadata.len(),
                spectra.nrows()
            )));
        }
        if wavelengths.len() != spectra.ncols() {
            return Err(PlsrError::Schema(format!(
                "{} wavelengths but {} spectral columns",
                wavelengths.len(),
                spectra.ncols()
            )));
        }
        if wavelengths.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PlsrError::Schema("wavelengths must be strictly ascending".into()));
        }
        Ok(Self {
            metadata,
            spectra,
            wavelengths,
            trait_name: trait_name.into(),
            species_code_name: species_code_name.into(),
        })
    }

    pub fn num_samples(&self) -> usize {
        self.metadata.len()
    }

    pub fn num_wavelengths(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn metadata(&self) -> &[SampleMetadata] {
        &self.metadata
    }

    pub fn spectra(&self) -> ArrayView2<'_, f64> {
        self.spectra.view()
    }

    pub fn wavelengths(&self) -> &[u32] {
        &self.wavelengths
    }

    /// Name of the (renamed) trait column, e.g. `LMA_gDW_m2`.
    pub fn trait_name(&self) -> &str {
        &self.trait_name
    }

    pub fn species_code_name(&self) -> &str {
        &self.species_code_name
    }

    pub fn trait_values(&self) -> Array1<f64> {
        self.metadata.iter().map(|m| m.trait_value).collect()
    }

    /// Canonical spectral column names, `Wave_<nm>`.
    pub fn spectral_column_names(&self) -> Vec<String> {
        self.wavelengths.iter().map(|w| format!("Wave_{}", w)).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = AnalysisRecord<'_>> + '_ {
        self.metadata
            .iter()
            .zip(self.spectra.axis_iter(Axis(0)))
            .map(|(metadata, spectrum)| AnalysisRecord { metadata, spectrum })
    }

    pub fn categorical_values(&self, field: CategoricalField) -> Vec<&str> {
        self.metadata.iter().map(|m| m.categorical(field)).collect()
    }

    /// A new set holding the given samples, in the given order.
    ///
    /// # Panics
    /// Panics if any index is out of bounds.
    pub fn subset(&self, indices: &[usize]) -> AnalysisSet {
        AnalysisSet {
            metadata: indices.iter().map(|&i| self.metadata[i].clone()).collect(),
            spectra: self.spectra.select(Axis(0), indices),
            wavelengths: self.wavelengths.clone(),
            trait_name: self.trait_name.clone(),
            species_code_name: self.species_code_name.clone(),
        }
    }
}

/// Splits an exported table into wavelength columns and metadata columns and
/// assembles the analysis set.
#[derive(Clone, Debug)]
pub struct DatasetAssembler {
    start_wave: u32,
    end_wave: u32,
    columns: MetadataColumns,
}

impl DatasetAssembler {
    pub fn new(start_wave: u32, end_wave: u32, columns: MetadataColumns) -> PlsrResult<Self> {
        if start_wave > end_wave {
            return Err(PlsrError::Config(format!(
                "start_wave ({}) must not exceed end_wave ({})",
                start_wave, end_wave
            )));
        }
        Ok(Self { start_wave, end_wave, columns })
    }

    /// Produces the analysis set.
    ///
    /// Rows whose trait value or any in-range reflectance is missing or not
    /// numeric are dropped with a warning. Missing columns are errors.
    pub fn assemble(&self, raw: &RawTable) -> PlsrResult<AnalysisSet> {
        info!(
            "Assembling analysis set from {} rows, wavelengths {}-{} nm",
            raw.num_rows(),
            self.start_wave,
            self.end_wave
        );

        let wave_columns = self.wavelength_columns(raw)?;
        let require = |name: &str| {
            raw.column_index(name)
                .ok_or_else(|| PlsrError::MissingColumn(name.to_string()))
        };
        let domain_idx = require(&self.columns.domain)?;
        let functional_type_idx = require(&self.columns.functional_type)?;
        let sample_id_idx = require(&self.columns.sample_id)?;
        let species_idx = require(&self.columns.species_code_source)?;
        let trait_idx = require(&self.columns.trait_source)?;

        let num_waves = wave_columns.len();
        let mut spectra_flat: Vec<f64> = Vec::with_capacity(raw.num_rows() * num_waves);
        let mut metadata = Vec::with_capacity(raw.num_rows());
        let mut dropped_trait = 0usize;
        let mut dropped_spectra = 0usize;

        for row in raw.rows() {
            let trait_value = match parse_numeric(&row[trait_idx]) {
                Some(v) => v,
                None => {
                    dropped_trait += 1;
                    continue;
                }
            };
            let spectrum: Option<Vec<f64>> = wave_columns
                .iter()
                .map(|&(_, idx)| parse_numeric(&row[idx]))
                .collect();
            let spectrum = match spectrum {
                Some(s) => s,
                None => {
                    dropped_spectra += 1;
                    continue;
                }
            };
            spectra_flat.extend(spectrum);
            metadata.push(SampleMetadata {
                domain: row[domain_idx].clone(),
                functional_type: row[functional_type_idx].clone(),
                sample_id: row[sample_id_idx].clone(),
                species_code: row[species_idx].clone(),
                trait_value,
            });
        }

        if dropped_trait > 0 {
            warn!(
                "Dropped {} rows with a missing or non-numeric '{}' value",
                dropped_trait, self.columns.trait_source
            );
        }
        if dropped_spectra > 0 {
            warn!("Dropped {} rows with missing or non-numeric reflectance", dropped_spectra);
        }
        if metadata.is_empty() {
            return Err(PlsrError::Schema("no complete samples remain after assembly".into()));
        }

        let spectra = Array2::from_shape_vec((metadata.len(), num_waves), spectra_flat)
            .map_err(|e| PlsrError::Schema(format!("could not shape spectral matrix: {}", e)))?;
        let wavelengths: Vec<u32> = wave_columns.iter().map(|&(w, _)| w).collect();
        debug!("Spectral matrix shape: {:?}", spectra.dim());

        AnalysisSet::new(
            metadata,
            spectra,
            wavelengths,
            self.columns.trait_name.clone(),
            self.columns.species_code_name.clone(),
        )
    }

    /// In-range wavelength columns as `(nm, column index)`, ascending by nm.
    fn wavelength_columns(&self, raw: &RawTable) -> PlsrResult<Vec<(u32, usize)>> {
        let mut by_wave: BTreeMap<u32, usize> = BTreeMap::new();
        let mut other_columns = 0usize;
        for (idx, header) in raw.headers().iter().enumerate() {
            match parse_wavelength(header) {
                Some(w) => {
                    if by_wave.insert(w, idx).is_some() {
                        return Err(PlsrError::Schema(format!(
                            "wavelength {} nm appears in more than one column",
                            w
                        )));
                    }
                }
                None => other_columns += 1,
            }
        }
        debug!(
            "Found {} wavelength columns and {} other columns",
            by_wave.len(),
            other_columns
        );

        let mut selected = Vec::with_capacity((self.end_wave - self.start_wave + 1) as usize);
        for wave in self.start_wave..=self.end_wave {
            match by_wave.get(&wave) {
                Some(&idx) => selected.push((wave, idx)),
                None => return Err(PlsrError::MissingWavelength(wave)),
            }
        }
        Ok(selected)
    }
}

/// A header names a wavelength when it is a whole, non-negative number.
fn parse_wavelength(header: &str) -> Option<u32> {
    let value: f64 = header.trim().parse().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Some(value as u32)
    } else {
        None
    }
}

fn parse_numeric(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("na") {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}
