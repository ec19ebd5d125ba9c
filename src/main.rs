use clap::{Parser, ValueEnum};
use leaf_plsr::{AnalysisConfig, PlsrAnalysis, PlsrError, SelectionRule};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "leaf-plsr")]
#[command(about = "PLSR of a leaf trait on reflectance spectra", long_about = None)]
struct Cli {
    /// JSON configuration file; command-line flags override its values.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Read the export from a local CSV instead of downloading it.
    #[arg(long = "input")]
    input: Option<PathBuf>,
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,
    #[arg(long = "seed")]
    seed: Option<u64>,
    #[arg(long = "iterations")]
    iterations: Option<usize>,
    #[arg(long = "max-components")]
    max_components: Option<usize>,
    #[arg(long = "selected-components")]
    selected_components: Option<usize>,
    #[arg(long = "threads")]
    threads: Option<usize>,
    #[arg(long = "no-plots", default_value_t = false)]
    no_plots: bool,
    #[arg(long = "dataset-id")]
    dataset_id: Option<String>,
    #[arg(long = "host")]
    host: Option<String>,
    #[arg(long = "select", value_enum)]
    select: Option<SelectArg>,
    /// Significance level of `--select first-plateau`.
    #[arg(long = "alpha", default_value_t = 0.05)]
    alpha: f64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SelectArg {
    Manual,
    FirstPlateau,
    FirstMinimum,
}

impl Cli {
    fn into_config(self) -> Result<AnalysisConfig, PlsrError> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_json_file(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(input) = self.input {
            config.input_path = Some(input);
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(max_components) = self.max_components {
            config.max_components = max_components;
        }
        if let Some(selected) = self.selected_components {
            config.selected_components = selected;
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        if self.no_plots {
            config.render_plots = false;
        }
        if let Some(id) = self.dataset_id {
            config.dataset_id = id;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(select) = self.select {
            config.selection_rule = match select {
                SelectArg::Manual => SelectionRule::Manual,
                SelectArg::FirstPlateau => SelectionRule::FirstPlateau { alpha: self.alpha },
                SelectArg::FirstMinimum => SelectionRule::FirstMinimum,
            };
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = cli
        .into_config()
        .and_then(PlsrAnalysis::new)
        .and_then(|analysis| analysis.run());
    match result {
        Ok(outcome) => {
            info!(
                "Final model: {} samples, {} components, outputs written to {}",
                outcome.data.num_samples(),
                outcome.selected_components,
                outcome
                    .report
                    .summary_json
                    .as_deref()
                    .and_then(|p| p.parent())
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
