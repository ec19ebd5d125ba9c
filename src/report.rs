// Headless reporting: CSV tables, a JSON run summary and SVG plots.

use crate::dataset::{AnalysisSet, CategoricalField};
use crate::error::{PlsrError, PlsrResult};
use crate::final_fit::FittedResult;
use crate::selection::ComponentSelection;
use crate::stats;
use csv::Writer;
use log::{debug, info};
use ndarray::Axis;
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Lower and upper quantiles of the spectral band.
const BAND_QUANTILES: (f64, f64) = (0.05, 0.95);
const PLOT_SIZE: (u32, u32) = (1000, 650);
const RESIDUAL_BINS: usize = 20;
const ALL_SAMPLES: &str = "all";

/// Paths of every file the reporter wrote. Plot paths are `None` when plot
/// rendering is switched off.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportPaths {
    pub spectral_summary_csv: Option<PathBuf>,
    pub spectra_plot: Option<PathBuf>,
    pub press_matrix_csv: Option<PathBuf>,
    pub press_summary_csv: Option<PathBuf>,
    pub p_values_csv: Option<PathBuf>,
    pub press_plot: Option<PathBuf>,
    pub fitted_values_csv: Option<PathBuf>,
    pub observed_vs_fitted_plot: Option<PathBuf>,
    pub residual_plot: Option<PathBuf>,
    pub coefficients_csv: Option<PathBuf>,
    pub model_summary_csv: Option<PathBuf>,
    pub summary_json: Option<PathBuf>,
}

/// Per-wavelength reflectance statistics of one group of samples.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectralSummaryRow {
    pub group: String,
    pub wavelength: u32,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub q05: f64,
    pub q95: f64,
}

/// Reflectance statistics per wavelength over all samples, followed by one
/// block per category of `stratify_by` (categories in sorted order).
pub fn spectral_summary(data: &AnalysisSet, stratify_by: Option<CategoricalField>) -> Vec<SpectralSummaryRow> {
    let mut groups: Vec<(String, Vec<usize>)> = vec![(ALL_SAMPLES.to_string(), (0..data.num_samples()).collect())];
    if let Some(field) = stratify_by {
        groups.extend(group_indices(data, field));
    }

    let mut rows = Vec::with_capacity(groups.len() * data.num_wavelengths());
    for (group, indices) in &groups {
        let members = data.subset(indices);
        for (col, &wavelength) in members.spectra().axis_iter(Axis(1)).zip(data.wavelengths()) {
            let mut values = col.to_vec();
            values.sort_by(|a, b| a.total_cmp(b));
            let (Some(q05), Some(q95), Some(mean)) = (
                stats::quantile_sorted(&values, BAND_QUANTILES.0),
                stats::quantile_sorted(&values, BAND_QUANTILES.1),
                stats::mean(&values),
            ) else {
                continue;
            };
            rows.push(SpectralSummaryRow {
                group: group.clone(),
                wavelength,
                mean,
                min: values[0],
                max: values[values.len() - 1],
                q05,
                q95,
            });
        }
    }
    rows
}

/// Sample indices per category of `field`, categories sorted.
fn group_indices(data: &AnalysisSet, field: CategoricalField) -> Vec<(String, Vec<usize>)> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, value) in data.categorical_values(field).into_iter().enumerate() {
        groups.entry(value.to_string()).or_default().push(i);
    }
    groups.into_iter().collect()
}

/// Histogram of `values` over `bins` equal-width bins: `(lower, upper, count)`.
pub fn histogram(values: &[f64], bins: usize) -> Vec<(f64, f64, usize)> {
    if values.is_empty() || bins == 0 {
        return Vec::new();
    }
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let (min, max) = if max > min { (min, max) } else { (min - 0.5, max + 0.5) };
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for &v in values {
        let idx = (((v - min) / width).floor() as usize).min(bins - 1);
        counts[idx] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (min + i as f64 * width, min + (i + 1) as f64 * width, c))
        .collect()
}

fn plot_err<E: std::fmt::Display>(e: E) -> PlsrError {
    PlsrError::Plot(e.to_string())
}

fn padded_range(min: f64, max: f64, pad_fraction: f64) -> std::ops::Range<f64> {
    if !(max > min) {
        return (min - 1.0)..(max + 1.0);
    }
    let pad = (max - min) * pad_fraction;
    (min - pad)..(max + pad)
}

fn group_color(index: usize) -> RGBAColor {
    Palette99::pick(index).to_rgba()
}

fn optional_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes the report files into one output directory.
#[derive(Debug, Clone)]
pub struct Reporter {
    output_dir: PathBuf,
    render_plots: bool,
    stratify_by: Option<CategoricalField>,
}

impl Reporter {
    /// Creates the output directory if needed.
    pub fn new(output_dir: impl Into<PathBuf>, render_plots: bool, stratify_by: Option<CategoricalField>) -> PlsrResult<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            render_plots,
            stratify_by,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    /// `spectral_summary.csv` and, with plots on, `spectra.svg`.
    pub fn write_spectral_report(&self, data: &AnalysisSet, paths: &mut ReportPaths) -> PlsrResult<()> {
        let rows = spectral_summary(data, self.stratify_by);
        let csv_path = self.path("spectral_summary.csv");
        let mut writer = Writer::from_path(&csv_path)?;
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        debug!("Wrote {} spectral summary rows to {}", rows.len(), csv_path.display());
        paths.spectral_summary_csv = Some(csv_path);

        if self.render_plots {
            let plot_path = self.path("spectra.svg");
            self.plot_spectra(&rows, data.trait_name(), &plot_path)?;
            paths.spectra_plot = Some(plot_path);
        }
        Ok(())
    }

    fn plot_spectra(&self, rows: &[SpectralSummaryRow], trait_name: &str, path: &Path) -> PlsrResult<()> {
        let mut by_group: BTreeMap<&str, Vec<&SpectralSummaryRow>> = BTreeMap::new();
        for row in rows {
            by_group.entry(row.group.as_str()).or_default().push(row);
        }
        // With a stratification field the per-category bands replace the overall one.
        if by_group.len() > 1 {
            by_group.remove(ALL_SAMPLES);
        }
        let (x_min, x_max) = rows
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                (lo.min(r.wavelength as f64), hi.max(r.wavelength as f64))
            });
        let y_max = rows.iter().map(|r| r.q95.max(r.mean)).fold(0.0f64, f64::max);

        let root = SVGBackend::new(path, PLOT_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(format!("Leaf reflectance ({} samples)", trait_name), ("sans-serif", 24))
            .margin(15)
            .x_label_area_size(45)
            .y_label_area_size(60)
            .build_cartesian_2d(padded_range(x_min, x_max, 0.01), 0.0..(y_max * 1.05).max(0.1))
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_desc("Wavelength (nm)")
            .y_desc("Reflectance")
            .draw()
            .map_err(plot_err)?;

        for (i, (group, group_rows)) in by_group.iter().enumerate() {
            let color = group_color(i);
            let mut band: Vec<(f64, f64)> = group_rows.iter().map(|r| (r.wavelength as f64, r.q95)).collect();
            band.extend(group_rows.iter().rev().map(|r| (r.wavelength as f64, r.q05)));
            chart
                .draw_series(std::iter::once(Polygon::new(band, color.mix(0.2).filled())))
                .map_err(plot_err)?;
            chart
                .draw_series(LineSeries::new(
                    group_rows.iter().map(|r| (r.wavelength as f64, r.mean)),
                    color.stroke_width(2),
                ))
                .map_err(plot_err)?
                .label(format!("{} (mean, 5-95%)", group))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8).filled())
            .border_style(BLACK.stroke_width(1))
            .draw()
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        debug!("Rendered {}", path.display());
        Ok(())
    }

    /// PRESS matrix, PRESS summary, p-value table and, with plots on, `press.svg`.
    pub fn write_selection_report(&self, selection: &ComponentSelection, paths: &mut ReportPaths) -> PlsrResult<()> {
        let press = &selection.press;

        let matrix_path = self.path("press_matrix.csv");
        let mut writer = Writer::from_path(&matrix_path)?;
        let mut header = vec!["iteration".to_string()];
        header.extend((1..=press.max_components()).map(|c| format!("comp_{}", c)));
        writer.write_record(&header)?;
        for (i, row) in press.values().axis_iter(Axis(0)).enumerate() {
            let mut record = vec![(i + 1).to_string()];
            record.extend(row.iter().map(|&v| if v.is_nan() { String::new() } else { v.to_string() }));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        paths.press_matrix_csv = Some(matrix_path);

        let summary = press.summary();
        let summary_path = self.path("press_summary.csv");
        let mut writer = Writer::from_path(&summary_path)?;
        writer.write_record(["components", "mean_press", "sd_press", "n"])?;
        for s in &summary {
            writer.write_record([
                s.components.to_string(),
                optional_cell(s.mean),
                optional_cell(s.sd),
                s.n.to_string(),
            ])?;
        }
        writer.flush()?;
        paths.press_summary_csv = Some(summary_path);

        let p_path = self.path("press_pvalues.csv");
        let mut writer = Writer::from_path(&p_path)?;
        writer.write_record(["components", "comparator", "p_value"])?;
        for entry in &selection.p_values {
            writer.write_record([
                entry.components.to_string(),
                entry.comparator.to_string(),
                optional_cell(entry.p_value),
            ])?;
        }
        writer.flush()?;
        paths.p_values_csv = Some(p_path);

        if self.render_plots {
            let plot_path = self.path("press.svg");
            self.plot_press(selection, &plot_path)?;
            paths.press_plot = Some(plot_path);
        }
        Ok(())
    }

    fn plot_press(&self, selection: &ComponentSelection, path: &Path) -> PlsrResult<()> {
        let points: Vec<(f64, f64, f64)> = selection
            .press
            .summary()
            .into_iter()
            .filter_map(|s| s.mean.map(|m| (s.components as f64, m, s.sd.unwrap_or(0.0))))
            .collect();
        if points.is_empty() {
            return Err(PlsrError::Plot("PRESS matrix has no values to plot".into()));
        }
        let y_min = points.iter().map(|p| p.1 - p.2).fold(f64::INFINITY, f64::min);
        let y_max = points.iter().map(|p| p.1 + p.2).fold(f64::NEG_INFINITY, f64::max);
        let x_max = selection.press.max_components() as f64;

        let root = SVGBackend::new(path, PLOT_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("PRESS over {} sub-sampled runs", selection.press.num_iterations()),
                ("sans-serif", 24),
            )
            .margin(15)
            .x_label_area_size(45)
            .y_label_area_size(70)
            .build_cartesian_2d(0.5..(x_max + 0.5), padded_range(y_min, y_max, 0.05))
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_desc("Number of components")
            .y_desc("PRESS (mean +/- sd)")
            .draw()
            .map_err(plot_err)?;

        let color = group_color(0);
        chart
            .draw_series(points.iter().map(|&(x, m, sd)| {
                PathElement::new(vec![(x, m - sd), (x, m + sd)], BLACK.stroke_width(1))
            }))
            .map_err(plot_err)?;
        chart
            .draw_series(LineSeries::new(points.iter().map(|&(x, m, _)| (x, m)), color.stroke_width(2)))
            .map_err(plot_err)?;
        chart
            .draw_series(points.iter().map(|&(x, m, _)| Circle::new((x, m), 4, color.filled())))
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        debug!("Rendered {}", path.display());
        Ok(())
    }

    /// Fitted values, coefficients, model summary and, with plots on, the
    /// observed-vs-fitted scatter and residual histogram.
    pub fn write_fit_report(&self, data: &AnalysisSet, fitted: &FittedResult, paths: &mut ReportPaths) -> PlsrResult<()> {
        let fitted_path = self.path("fitted_values.csv");
        let mut writer = Writer::from_path(&fitted_path)?;
        writer.write_record([
            "sample_id",
            "domain",
            "functional_type",
            data.species_code_name(),
            data.trait_name(),
            "fitted",
            "residual",
            "cv_predicted",
        ])?;
        for (sample, record) in fitted.samples.iter().zip(data.records()) {
            let meta = record.metadata;
            writer.write_record([
                sample.sample_id.clone(),
                meta.domain.clone(),
                meta.functional_type.clone(),
                meta.species_code.clone(),
                sample.observed.to_string(),
                sample.fitted.to_string(),
                sample.residual.to_string(),
                sample.cv_predicted.to_string(),
            ])?;
        }
        writer.flush()?;
        paths.fitted_values_csv = Some(fitted_path);

        let coef_path = self.path("coefficients.csv");
        let mut writer = Writer::from_path(&coef_path)?;
        writer.write_record(["term", "wavelength", "coefficient", "vip"])?;
        writer.write_record(["(Intercept)".to_string(), String::new(), fitted.intercept.to_string(), String::new()])?;
        for (((term, wavelength), coef), vip) in data
            .spectral_column_names()
            .into_iter()
            .zip(fitted.wavelengths.iter())
            .zip(fitted.coefficients.iter())
            .zip(fitted.vip.iter())
        {
            writer.write_record([
                term,
                wavelength.to_string(),
                coef.to_string(),
                vip.to_string(),
            ])?;
        }
        writer.flush()?;
        paths.coefficients_csv = Some(coef_path);

        let summary_path = self.path("model_summary.csv");
        let mut writer = Writer::from_path(&summary_path)?;
        for metrics in &fitted.metrics {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        paths.model_summary_csv = Some(summary_path);

        if self.render_plots {
            let scatter_path = self.path("observed_vs_fitted.svg");
            self.plot_observed_vs_fitted(data, fitted, &scatter_path)?;
            paths.observed_vs_fitted_plot = Some(scatter_path);

            let residual_path = self.path("residuals.svg");
            self.plot_residuals(fitted, &residual_path)?;
            paths.residual_plot = Some(residual_path);
        }
        Ok(())
    }

    fn plot_observed_vs_fitted(&self, data: &AnalysisSet, fitted: &FittedResult, path: &Path) -> PlsrResult<()> {
        let observed = fitted.observed();
        let predicted = fitted.fitted();
        let lo = observed.iter().chain(&predicted).cloned().fold(f64::INFINITY, f64::min);
        let hi = observed.iter().chain(&predicted).cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = padded_range(lo, hi, 0.05);
        let r2 = stats::r_squared(&observed, &predicted).unwrap_or(f64::NAN);
        let rmse = stats::rmse(&observed, &predicted).unwrap_or(f64::NAN);

        let root = SVGBackend::new(path, PLOT_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("{}: observed vs fitted ({} components)", data.trait_name(), fitted.selected_components),
                ("sans-serif", 24),
            )
            .margin(15)
            .x_label_area_size(45)
            .y_label_area_size(60)
            .build_cartesian_2d(range.clone(), range.clone())
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_desc(format!("Fitted {}", data.trait_name()))
            .y_desc(format!("Observed {}", data.trait_name()))
            .draw()
            .map_err(plot_err)?;

        chart
            .draw_series(LineSeries::new(
                vec![(range.start, range.start), (range.end, range.end)],
                BLACK.stroke_width(1),
            ))
            .map_err(plot_err)?
            .label("1:1")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLACK.stroke_width(1)));

        let groups = match self.stratify_by {
            Some(field) => group_indices(data, field),
            None => vec![(ALL_SAMPLES.to_string(), (0..fitted.samples.len()).collect())],
        };
        for (i, (group, indices)) in groups.iter().enumerate() {
            let color = group_color(i);
            chart
                .draw_series(
                    indices
                        .iter()
                        .map(|&s| Circle::new((predicted[s], observed[s]), 4, color.mix(0.8).filled())),
                )
                .map_err(plot_err)?
                .label(group.clone())
                .legend(move |(x, y)| Circle::new((x + 10, y), 4, color.filled()));
        }

        let span = range.end - range.start;
        chart
            .draw_series([
                Text::new(format!("R2 = {:.3}", r2), (range.start + 0.03 * span, range.end - 0.05 * span), ("sans-serif", 18)),
                Text::new(format!("RMSE = {:.3}", rmse), (range.start + 0.03 * span, range.end - 0.10 * span), ("sans-serif", 18)),
            ])
            .map_err(plot_err)?;
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::LowerRight)
            .background_style(WHITE.mix(0.8).filled())
            .border_style(BLACK.stroke_width(1))
            .draw()
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        debug!("Rendered {}", path.display());
        Ok(())
    }

    fn plot_residuals(&self, fitted: &FittedResult, path: &Path) -> PlsrResult<()> {
        let bins = histogram(&fitted.residuals(), RESIDUAL_BINS);
        let (Some(first), Some(last)) = (bins.first(), bins.last()) else {
            return Err(PlsrError::Plot("no residuals to plot".into()));
        };
        let max_count = bins.iter().map(|b| b.2).max().unwrap_or(1).max(1);

        let root = SVGBackend::new(path, PLOT_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption("Residuals (fitted - observed)", ("sans-serif", 24))
            .margin(15)
            .x_label_area_size(45)
            .y_label_area_size(60)
            .build_cartesian_2d(first.0..last.1, 0.0..(max_count as f64 * 1.1))
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_desc("Residual")
            .y_desc("Count")
            .draw()
            .map_err(plot_err)?;
        let color = group_color(0);
        chart
            .draw_series(bins.iter().map(|&(lo, hi, count)| {
                Rectangle::new([(lo, 0.0), (hi, count as f64)], color.mix(0.6).filled())
            }))
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        debug!("Rendered {}", path.display());
        Ok(())
    }

    /// `summary.json`: any serialisable run summary plus the paths written so far.
    pub fn write_summary_json<S: Serialize>(&self, summary: &S, paths: &mut ReportPaths) -> PlsrResult<()> {
        let json_path = self.path("summary.json");
        paths.summary_json = Some(json_path.clone());
        let file = fs::File::create(&json_path)?;
        serde_json::to_writer_pretty(file, summary)?;
        info!("Wrote run summary to {}", json_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SampleMetadata;
    use ndarray::array;

    fn small_set() -> AnalysisSet {
        let spectra = array![
            [0.10, 0.20, 0.30],
            [0.20, 0.30, 0.40],
            [0.30, 0.40, 0.50],
            [0.40, 0.50, 0.60],
        ];
        let metadata = (0..4)
            .map(|i| SampleMetadata {
                domain: "D01".to_string(),
                functional_type: if i < 2 { "broadleaf".to_string() } else { "conifer".to_string() },
                sample_id: format!("S{}", i),
                species_code: "ACRU".to_string(),
                trait_value: 50.0 + i as f64,
            })
            .collect();
        AnalysisSet::new(metadata, spectra, vec![500, 501, 502], "LMA_gDW_m2", "USDA_Species_Code").unwrap()
    }

    #[test]
    fn spectral_summary_has_all_and_group_blocks() {
        let rows = spectral_summary(&small_set(), Some(CategoricalField::FunctionalType));
        // 3 wavelengths x (all + broadleaf + conifer)
        assert_eq!(rows.len(), 9);
        let all_500 = &rows[0];
        assert_eq!(all_500.group, "all");
        assert_eq!(all_500.wavelength, 500);
        assert!((all_500.mean - 0.25).abs() < 1e-12);
        assert!((all_500.min - 0.10).abs() < 1e-12);
        assert!((all_500.max - 0.40).abs() < 1e-12);
        assert!(all_500.q05 >= all_500.min && all_500.q95 <= all_500.max);
        assert_eq!(rows[3].group, "broadleaf");
        assert!((rows[3].mean - 0.15).abs() < 1e-12);
        assert_eq!(rows[6].group, "conifer");
    }

    #[test]
    fn histogram_counts_every_value() {
        let values = [-1.0, -0.5, 0.0, 0.5, 1.0, 1.0];
        let bins = histogram(&values, 4);
        assert_eq!(bins.len(), 4);
        assert_eq!(bins.iter().map(|b| b.2).sum::<usize>(), values.len());
        assert_eq!(bins[0].0, -1.0);
        assert_eq!(bins[3].1, 1.0);
        assert_eq!(bins[3].2, 2);
        assert!(histogram(&[], 4).is_empty());
        // A constant sample still lands in a bin.
        assert_eq!(histogram(&[2.0, 2.0], 3).iter().map(|b| b.2).sum::<usize>(), 2);
    }

    #[test]
    fn spectral_report_writes_csv_and_plot() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path().join("out"), true, Some(CategoricalField::FunctionalType)).unwrap();
        let mut paths = ReportPaths::default();
        reporter.write_spectral_report(&small_set(), &mut paths).unwrap();
        let csv_path = paths.spectral_summary_csv.unwrap();
        let text = fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("group,wavelength,mean,min,max,q05,q95"));
        assert_eq!(text.lines().count(), 10);
        let svg = fs::read_to_string(paths.spectra_plot.unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }
}
