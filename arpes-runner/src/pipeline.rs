//! Pipeline orchestrator — wires corrections, fitting and provenance together.
//!
//! One run:
//! 1. record a source node for the raw array;
//! 2. apply each correction in order, threading `(array, node)`; references
//!    are recorded as extra source parents;
//! 3. fit the corrected array (and bootstrap it when configured);
//! 4. record a `pipeline` root whose parents are the final array and fit nodes.
//!
//! Every step is fingerprinted before it runs and the cache is consulted, so
//! a re-run with an unchanged prefix reuses the cached products.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use arpes_core::array::LabeledArray;
use arpes_core::correction::{Corrected, CorrectionEngine, CorrectionError, CorrectionSpec};
use arpes_core::error::ErrorClass;
use arpes_core::fit::{bootstrap_dataset, failed_slices, fit_dataset, DatasetFit, FitError};
use arpes_core::models::ModelError;
use arpes_core::provenance::{NodeId, ParamValue, Params, ProvenanceError, ProvenanceGraph};

use crate::cache::FingerprintCache;
use crate::config::{FitConfig, PipelineConfig};

/// Operation name of the fit step.
pub const FIT_OPERATION: &str = "fit_dataset";
/// Operation name of the root node.
pub const PIPELINE_OPERATION: &str = "pipeline";

// ─── Cache values ────────────────────────────────────────────────────

/// A cached step product.
#[derive(Debug, Clone)]
pub enum StepProduct {
    Corrected(Arc<Corrected>),
    Fit(Arc<DatasetFit>),
}

pub type StepCache = FingerprintCache<StepProduct>;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error("cache holds a different kind of product for fingerprint {0}")]
    CacheKind(String),
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Correction(e) => e.class(),
            StepError::Fit(e) => e.class(),
            StepError::Model(e) => e.class(),
            StepError::Provenance(e) => e.class(),
            StepError::CacheKind(_) => ErrorClass::Structural,
        }
    }
}

/// A step failed; the run stopped there.
#[derive(Debug, Error)]
#[error("pipeline step {step} ({operation}) failed: {cause}")]
pub struct PipelineError {
    /// Corrections are steps `0..n`, the fit is step `n`.
    pub step: usize,
    pub operation: String,
    #[source]
    pub cause: StepError,
    /// Everything recorded before the failure.
    pub graph: Box<ProvenanceGraph>,
    /// Node of the last array that was produced successfully.
    pub last_node: NodeId,
}

// ─── Output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub operation: String,
    pub node: NodeId,
    pub cache_hit: bool,
    pub failed_channels: Vec<usize>,
    pub masked_samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub cache_hits: usize,
    pub fit_cache_hit: bool,
    pub total_slices: usize,
    pub converged_slices: usize,
    /// Multi-indices over the non-fit axes.
    pub failed_slices: Vec<Vec<usize>>,
}

impl PipelineReport {
    /// True when nothing fell back, was masked or failed to converge.
    pub fn is_clean(&self) -> bool {
        self.failed_slices.is_empty()
            && self
                .steps
                .iter()
                .all(|s| s.failed_channels.is_empty() && s.masked_samples == 0)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub array: LabeledArray,
    pub array_node: NodeId,
    pub fit: Option<DatasetFit>,
    pub fit_node: Option<NodeId>,
    pub graph: ProvenanceGraph,
    pub root: NodeId,
    pub report: PipelineReport,
}

// ─── Orchestrator ────────────────────────────────────────────────────

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    cache: &'a StepCache,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, cache: &'a StepCache) -> Self {
        Self { config, cache }
    }

    pub fn run(
        &self,
        raw: &LabeledArray,
        references: &BTreeMap<String, LabeledArray>,
    ) -> Result<PipelineOutput, PipelineError> {
        let engine = CorrectionEngine::new(&self.config.metadata, references);
        let mut graph = ProvenanceGraph::new();
        let mut node = graph.record_source("raw", raw);
        let mut report = PipelineReport {
            started_at: Utc::now(),
            ..PipelineReport::default()
        };
        let mut last: Option<Arc<Corrected>> = None;

        info!(
            corrections = self.config.corrections.len(),
            fit = self.config.fit.is_some(),
            dims = ?raw.dims(),
            "pipeline started"
        );

        for (step, spec) in self.config.corrections.iter().enumerate() {
            let input = last.as_ref().map_or(raw, |c| &c.array);
            match self.correction_step(&engine, &mut graph, spec, input, node) {
                Ok((corrected, next, cache_hit)) => {
                    if !corrected.failed_channels.is_empty() {
                        warn!(
                            step,
                            operation = spec.operation(),
                            channels = ?corrected.failed_channels,
                            "channels fell back"
                        );
                    }
                    report.steps.push(StepReport {
                        step,
                        operation: spec.operation().to_string(),
                        node: next,
                        cache_hit,
                        failed_channels: corrected.failed_channels.clone(),
                        masked_samples: corrected.masked_samples,
                    });
                    report.cache_hits += usize::from(cache_hit);
                    node = next;
                    last = Some(corrected);
                }
                Err(cause) => {
                    return Err(fail(step, spec.operation(), cause, graph, node));
                }
            }
        }

        let array = last.map_or_else(|| raw.clone(), |c| c.array.clone());
        let array_node = node;

        let mut fit = None;
        let mut fit_node = None;
        if let Some(fit_config) = &self.config.fit {
            let step = self.config.corrections.len();
            match self.fit_step(&mut graph, fit_config, &array, array_node) {
                Ok((result, id, cache_hit)) => {
                    report.fit_cache_hit = cache_hit;
                    report.cache_hits += usize::from(cache_hit);
                    report.total_slices = result.results.len();
                    report.converged_slices = result.converged_count();
                    report.failed_slices = failed_slices(&result.results);
                    fit = Some(result);
                    fit_node = Some(id);
                }
                Err(cause) => return Err(fail(step, FIT_OPERATION, cause, graph, array_node)),
            }
        }

        let mut params = Params::new();
        params.insert(
            "steps".into(),
            ParamValue::Text(
                self.config
                    .corrections
                    .iter()
                    .map(CorrectionSpec::operation)
                    .chain(fit_node.map(|_| FIT_OPERATION))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        );
        let parents: Vec<NodeId> = std::iter::once(array_node).chain(fit_node).collect();
        let step = self.config.corrections.len() + usize::from(fit_node.is_some());
        let root = match graph.record(PIPELINE_OPERATION, params, &parents) {
            Ok(root) => root,
            Err(e) => return Err(fail(step, PIPELINE_OPERATION, e.into(), graph, array_node)),
        };

        report.finished_at = Utc::now();
        info!(
            nodes = graph.len(),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            cache_hits = report.cache_hits,
            converged = report.converged_slices,
            slices = report.total_slices,
            "pipeline finished"
        );

        Ok(PipelineOutput {
            array,
            array_node,
            fit,
            fit_node,
            graph,
            root,
            report,
        })
    }

    fn correction_step(
        &self,
        engine: &CorrectionEngine<'_>,
        graph: &mut ProvenanceGraph,
        spec: &CorrectionSpec,
        input: &LabeledArray,
        node: NodeId,
    ) -> Result<(Arc<Corrected>, NodeId, bool), StepError> {
        let params = engine.resolve_params(spec)?;
        let parents = engine.parent_nodes(graph, spec, node)?;
        let fingerprint = graph.fingerprint_for(spec.operation(), &params, &parents)?;
        debug!(operation = spec.operation(), fingerprint = fingerprint.short(), "step start");

        let (product, cache_hit) = self.cache.get_or_compute(&fingerprint, || {
            engine
                .apply(spec, input)
                .map(|c| StepProduct::Corrected(Arc::new(c)))
        })?;
        let StepProduct::Corrected(corrected) = product else {
            return Err(StepError::CacheKind(fingerprint.to_string()));
        };

        let id = graph.record_with_outputs(
            spec.operation(),
            params,
            corrected.outputs.clone(),
            &parents,
        )?;
        debug!(operation = spec.operation(), node = %id, cache_hit, "step finished");
        Ok((corrected, id, cache_hit))
    }

    fn fit_step(
        &self,
        graph: &mut ProvenanceGraph,
        config: &FitConfig,
        array: &LabeledArray,
        node: NodeId,
    ) -> Result<(DatasetFit, NodeId, bool), StepError> {
        let resolved = config.resolve()?;
        let params = config.params(&resolved);
        let parents = [node];
        let fingerprint = graph.fingerprint_for(FIT_OPERATION, &params, &parents)?;
        debug!(model = %config.model, fingerprint = fingerprint.short(), "fit start");

        let (product, cache_hit) = self.cache.get_or_compute(&fingerprint, || {
            let fit = fit_dataset(
                &config.model,
                array,
                &config.fit_axis,
                &resolved.initial,
                &resolved.bounds,
                &config.options,
            )?;
            let fit = if config.bootstrap_resamples > 0 {
                bootstrap_dataset(
                    &config.model,
                    array,
                    &fit,
                    &resolved.bounds,
                    config.bootstrap_resamples,
                    config.seed,
                    &config.options,
                )?
            } else {
                fit
            };
            Ok::<_, StepError>(StepProduct::Fit(Arc::new(fit)))
        })?;
        let StepProduct::Fit(fit) = product else {
            return Err(StepError::CacheKind(fingerprint.to_string()));
        };

        let mut outputs = Params::new();
        outputs.insert("total_slices".into(), fit.results.len().into());
        outputs.insert("converged_slices".into(), fit.converged_count().into());
        let id = graph.record_with_outputs(FIT_OPERATION, params, outputs, &parents)?;
        debug!(node = %id, cache_hit, "fit finished");

        // Node ids belong to this run's graph, not the cached one.
        let fit = DatasetFit::clone(&fit).with_input_node(node);
        Ok((fit, id, cache_hit))
    }
}

fn fail(
    step: usize,
    operation: &str,
    cause: StepError,
    graph: ProvenanceGraph,
    last_node: NodeId,
) -> PipelineError {
    warn!(step, operation, class = ?cause.class(), error = %cause, "pipeline step failed");
    PipelineError {
        step,
        operation: operation.to_string(),
        cause,
        graph: Box::new(graph),
        last_node,
    }
}
