// Partial least squares regression of a leaf trait on reflectance spectra

#![doc = include_str!("../README.md")]

pub mod config;
pub mod dataset;
pub mod error;
pub mod final_fit;
pub mod linalg_backends;
pub mod loader;
pub mod pipeline;
pub mod plsr;
pub mod report;
pub mod selection;
pub mod stats;

pub use config::{AnalysisConfig, MetadataColumns, SegmentType, SelectionRule};
pub use dataset::{AnalysisRecord, AnalysisSet, CategoricalField, DatasetAssembler, SampleMetadata};
pub use error::{PlsrError, PlsrResult};
pub use final_fit::{ComponentMetrics, FinalFitConfig, FinalModelFitter, FittedResult, SampleFit};
pub use loader::RawTable;
pub use pipeline::{AnalysisOutcome, PlsrAnalysis};
pub use plsr::{CvResult, PlsModel, ValidatedPlsModel};
pub use report::{ReportPaths, Reporter};
pub use selection::{
    ComponentSelection, ComponentSelector, ComponentSelectorConfig, PValueEntry, PressMatrix,
};

#[cfg(test)]
mod plsr_tests;
