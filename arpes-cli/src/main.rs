//! ARPES CLI — synthesize spectra, run pipelines, inspect provenance.
//!
//! Commands:
//! - `synth` — write a synthetic band map and a matching pipeline TOML
//! - `run` — apply a TOML pipeline to an array file and save artifacts
//! - `provenance` — print the lineage of a node from a saved graph

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arpes_core::correction::{AngleToKSpec, CorrectionSpec, FermiEdgeSpec, InstrumentMetadata};
use arpes_core::provenance::{ParamValue, Params, ProvenanceGraph};
use arpes_core::synthetic::{add_noise, BandMap};
use arpes_core::LabeledArray;
use arpes_runner::{
    export_array_json, import_array_json, import_provenance_json, save_artifacts, Pipeline,
    PipelineConfig, PipelineOutput, StepCache,
};

#[derive(Parser)]
#[command(
    name = "arpes",
    about = "ARPES CLI — correction and fitting pipeline with provenance"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic band map (raw.json) and a pipeline config (pipeline.toml).
    Synth {
        /// Fermi level drift across the angle channels, eV.
        #[arg(long, default_value_t = 0.01)]
        drift: f64,

        /// Gaussian noise standard deviation.
        #[arg(long, default_value_t = 0.0)]
        noise: f64,

        /// Noise seed.
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Number of angle channels.
        #[arg(long, default_value_t = 41)]
        angles: usize,

        /// Number of energy samples.
        #[arg(long, default_value_t = 201)]
        energies: usize,

        /// Output directory.
        #[arg(long, default_value = "synthetic")]
        output_dir: PathBuf,
    },
    /// Run a pipeline over an array file and save the artifact set.
    Run {
        /// Path to a TOML pipeline config.
        #[arg(long)]
        config: PathBuf,

        /// Array JSON to correct.
        #[arg(long)]
        input: PathBuf,

        /// Reference arrays as NAME=PATH, repeatable.
        #[arg(long = "reference", value_name = "NAME=PATH")]
        references: Vec<String>,

        /// Output directory for artifacts.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Print the lineage of a node in a saved provenance graph.
    Provenance {
        /// Path to provenance.json.
        file: PathBuf,

        /// Node index; the last recorded node when omitted.
        #[arg(long)]
        node: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Synth {
            drift,
            noise,
            seed,
            angles,
            energies,
            output_dir,
        } => run_synth(drift, noise, seed, angles, energies, &output_dir),
        Commands::Run {
            config,
            input,
            references,
            output_dir,
        } => run_pipeline_cmd(&config, &input, &references, &output_dir),
        Commands::Provenance { file, node } => run_provenance(&file, node),
    }
}

fn run_synth(
    drift: f64,
    noise: f64,
    seed: u64,
    angles: usize,
    energies: usize,
    output_dir: &Path,
) -> Result<()> {
    let band = BandMap {
        n_angle: angles,
        n_energy: energies,
        edge_drift: drift,
        ..BandMap::default()
    };
    let raw = add_noise(&band.generate()?, noise, seed);

    let config = PipelineConfig {
        metadata: InstrumentMetadata {
            photon_energy: Some(band.photon_energy),
            work_function: Some(band.work_function),
            temperature_k: Some(band.temperature_k),
            ..InstrumentMetadata::default()
        },
        corrections: vec![
            CorrectionSpec::FermiEdgeAlign(FermiEdgeSpec {
                window: Some([-0.1, 0.1]),
                resolution: band.resolution,
                ..FermiEdgeSpec::default()
            }),
            CorrectionSpec::AngleToK(AngleToKSpec::default()),
        ],
        fit: None,
    };

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output dir: {}", output_dir.display()))?;
    let raw_path = output_dir.join("raw.json");
    std::fs::write(&raw_path, export_array_json(&raw)?)
        .with_context(|| format!("failed to write {}", raw_path.display()))?;
    let config_path = output_dir.join("pipeline.toml");
    std::fs::write(&config_path, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    info!(dims = ?raw.dims(), shape = ?raw.shape(), "synthetic band map written");
    println!("Array:  {}", raw_path.display());
    println!("Config: {}", config_path.display());
    Ok(())
}

fn read_array(path: &Path) -> Result<LabeledArray> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    import_array_json(&json).with_context(|| format!("invalid array file {}", path.display()))
}

fn parse_references(specs: &[String]) -> Result<BTreeMap<String, LabeledArray>> {
    let mut references = BTreeMap::new();
    for spec in specs {
        let Some((name, path)) = spec.split_once('=') else {
            bail!("reference '{spec}' must be NAME=PATH");
        };
        if name.is_empty() {
            bail!("reference '{spec}' has an empty name");
        }
        if references
            .insert(name.to_string(), read_array(Path::new(path))?)
            .is_some()
        {
            bail!("reference '{name}' given twice");
        }
    }
    Ok(references)
}

fn run_pipeline_cmd(
    config_path: &Path,
    input: &Path,
    references: &[String],
    output_dir: &Path,
) -> Result<()> {
    let config = PipelineConfig::from_file(config_path)?;
    let raw = read_array(input)?;
    let references = parse_references(references)?;

    let cache = StepCache::new();
    let output = match Pipeline::new(&config, &cache).run(&raw, &references) {
        Ok(output) => output,
        Err(err) => {
            // Keep what was recorded before the failure.
            std::fs::create_dir_all(output_dir).ok();
            let path = output_dir.join("provenance.partial.json");
            if let Ok(json) = arpes_runner::export_provenance_json(&err.graph) {
                if std::fs::write(&path, json).is_ok() {
                    eprintln!("Partial provenance saved to: {}", path.display());
                }
            }
            return Err(err.into());
        }
    };

    print_summary(&output);
    let written = save_artifacts(&output, output_dir)?;
    println!("Artifacts saved to: {}", output_dir.display());
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

fn print_summary(output: &PipelineOutput) {
    let report = &output.report;
    println!("=== Pipeline Result ===");
    println!("Dims:     {:?}", output.array.dims());
    println!("Shape:    {:?}", output.array.shape());
    println!("Masked:   {}", output.array.masked_count());
    println!();
    for step in &report.steps {
        let mut notes = Vec::new();
        if step.cache_hit {
            notes.push("cached".to_string());
        }
        if !step.failed_channels.is_empty() {
            notes.push(format!("fallback channels {:?}", step.failed_channels));
        }
        if step.masked_samples > 0 {
            notes.push(format!("{} masked", step.masked_samples));
        }
        println!(
            "{:>3}  {:<22} {:<5} {}",
            step.step,
            step.operation,
            step.node.to_string(),
            notes.join(", ")
        );
    }
    if let Some(fit) = &output.fit {
        println!();
        println!("Fit axis: {}", fit.fit_axis);
        println!("Params:   {}", fit.param_names.join(", "));
        println!(
            "Slices:   {}/{} converged",
            report.converged_slices, report.total_slices
        );
        if !report.failed_slices.is_empty() {
            println!("Failed:   {:?}", report.failed_slices);
        }
    }
    if let Some(root) = output.graph.get(output.root) {
        println!();
        println!("Root:     {} {}", root.id(), root.fingerprint());
    }
}

fn run_provenance(file: &Path, node: Option<usize>) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let graph = import_provenance_json(&json)?;
    print_lineage(&graph, node)
}

fn print_lineage(graph: &ProvenanceGraph, node: Option<usize>) -> Result<()> {
    let target = match node {
        Some(index) => graph
            .records()
            .iter()
            .find(|r| r.id().index() == index)
            .with_context(|| format!("no node #{index} in graph of {} nodes", graph.len()))?,
        None => graph.records().last().context("provenance graph is empty")?,
    };

    println!("{:<5} {:<20} {:<16} {:<12} Params", "Node", "Operation", "Fingerprint", "Parents");
    println!("{}", "-".repeat(80));
    for record in graph.lineage(target.id()) {
        let parents: Vec<String> = record.parents().iter().map(ToString::to_string).collect();
        println!(
            "{:<5} {:<20} {:<16} {:<12} {}",
            record.id().to_string(),
            record.operation(),
            record.fingerprint().short(),
            parents.join(","),
            format_params(record.params())
        );
    }
    Ok(())
}

fn format_params(params: &Params) -> String {
    let pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| {
            let value = match v {
                ParamValue::Flag(b) => b.to_string(),
                ParamValue::Number(x) => format!("{x}"),
                ParamValue::Numbers(xs) => format!("{xs:?}"),
                ParamValue::Text(s) => s.clone(),
            };
            format!("{k}={value}")
        })
        .collect();
    pairs.join(" ")
}
