//! Artifact export — JSON arrays and provenance, CSV fit tables.
//!
//! - **Array JSON**: axes plus row-major data, NaN written as `null`
//! - **Fit CSV**: one row per slice with indices, coordinates, parameters,
//!   errors, rss and convergence
//! - **Provenance JSON**: the whole graph, reloadable for inspection

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use arpes_core::array::LabeledArray;
use arpes_core::fit::DatasetFit;
use arpes_core::provenance::ProvenanceGraph;

use crate::pipeline::PipelineOutput;

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_array_json(array: &LabeledArray) -> Result<String> {
    serde_json::to_string(&array.to_nullable()).context("failed to serialize array to JSON")
}

pub fn import_array_json(json: &str) -> Result<LabeledArray> {
    let nullable: LabeledArray<Option<f64>> =
        serde_json::from_str(json).context("failed to deserialize array from JSON")?;
    Ok(LabeledArray::from_nullable(&nullable))
}

pub fn export_provenance_json(graph: &ProvenanceGraph) -> Result<String> {
    serde_json::to_string_pretty(graph).context("failed to serialize provenance graph")
}

/// Reload a graph; parent edges are validated on the way in.
pub fn import_provenance_json(json: &str) -> Result<ProvenanceGraph> {
    serde_json::from_str(json).context("failed to deserialize provenance graph")
}

// ─── CSV export ─────────────────────────────────────────────────────

fn number(v: f64) -> String {
    if v.is_finite() {
        format!("{v}")
    } else {
        String::new()
    }
}

/// Fit results as CSV, one row per slice.
///
/// Columns: `{axis}_index` and `{axis}` per non-fit axis, then per parameter
/// `{name}` and `{name}_stderr` (plus `{name}_p2_5` / `{name}_p97_5` when
/// bootstrapped), then rss, iterations, n_points, converged, status,
/// error_source. Missing values are empty cells.
pub fn export_fit_csv(fit: &DatasetFit) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    let axes = fit.results.axes();
    let with_interval = fit.results.values().iter().any(|r| r.interval.is_some());

    let mut header: Vec<String> = Vec::new();
    for axis in axes {
        header.push(format!("{}_index", axis.name()));
        header.push(axis.name().to_string());
    }
    for name in &fit.param_names {
        header.push(name.clone());
        header.push(format!("{name}_stderr"));
        if with_interval {
            header.push(format!("{name}_p2_5"));
            header.push(format!("{name}_p97_5"));
        }
    }
    header.extend(
        ["rss", "iterations", "n_points", "converged", "status", "error_source"].map(String::from),
    );
    wtr.write_record(&header)?;

    for (i, r) in fit.results.values().iter().enumerate() {
        let index = fit.results.unravel(i);
        let mut row: Vec<String> = Vec::with_capacity(header.len());
        for (axis, &j) in axes.iter().zip(&index) {
            row.push(j.to_string());
            row.push(number(axis.coords()[j]));
        }
        for p in 0..fit.param_names.len() {
            row.push(number(r.params[p]));
            row.push(number(r.stderr[p]));
            if with_interval {
                let [lo, hi] = r
                    .interval
                    .as_ref()
                    .map_or([f64::NAN, f64::NAN], |iv| iv[p]);
                row.push(number(lo));
                row.push(number(hi));
            }
        }
        row.push(number(r.rss));
        row.push(r.iterations.to_string());
        row.push(r.n_points.to_string());
        row.push(r.converged.to_string());
        row.push(r.status.as_str().to_string());
        row.push(
            match r.error_source {
                arpes_core::fit::ErrorSource::Covariance => "covariance",
                arpes_core::fit::ErrorSource::Bootstrap => "bootstrap",
            }
            .to_string(),
        );
        wtr.write_record(&row)?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Save the full artifact set of a pipeline run into `output_dir`:
/// - `array.json` — the corrected array
/// - `fit.csv` — per-slice fit table, when a fit ran
/// - `provenance.json` — the provenance graph
/// - `report.json` — the run report
///
/// Returns the paths written.
pub fn save_artifacts(output: &PipelineOutput, output_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output dir: {}", output_dir.display()))?;
    let mut written = Vec::new();
    let mut write = |name: &str, content: String| -> Result<()> {
        let path = output_dir.join(name);
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
        Ok(())
    };

    write("array.json", export_array_json(&output.array)?)?;
    if let Some(fit) = &output.fit {
        write("fit.csv", export_fit_csv(fit)?)?;
    }
    write("provenance.json", export_provenance_json(&output.graph)?)?;
    write(
        "report.json",
        serde_json::to_string_pretty(&output.report).context("failed to serialize report")?,
    )?;
    Ok(written)
}
