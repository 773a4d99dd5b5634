//! Correction engine: detector coordinates to physical coordinates.
//!
//! Three kinds of step, each described by a `CorrectionSpec`:
//! - `fermi_edge_align`: per-channel edge detection, refinement and shift;
//! - `angle_to_k`: closed-form momentum conversion (kp, kz or kx/ky) with
//!   pull-back resampling;
//! - `intensity_normalize`: division by total counts or a reference array.
//!
//! Corrections are pure functions of `(spec, metadata, references, array)`.
//! `CorrectionEngine::apply_tracked` additionally records the provenance node;
//! the pipeline does the same in two halves so it can consult its cache
//! between fingerprinting and computing.

pub mod fermi;
pub mod momentum;
pub mod normalize;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::array::{ArrayError, Interpolation, LabeledArray};
use crate::error::ErrorClass;
use crate::provenance::{NodeId, ParamValue, Params, ProvenanceError, ProvenanceGraph, Tracked};

pub use fermi::{detect_edge, FermiEdgeSpec};
pub use momentum::{AngleToKSpec, K_FACTOR};
pub use normalize::NormalizeSpec;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrectionError {
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(GeometryError),
    #[error("reference '{0}' was not supplied")]
    MissingReference(String),
    #[error("reference '{reference}' does not align with target: {reason}")]
    ReferenceShapeMismatch { reference: String, reason: String },
    #[error("invalid correction parameter: {0}")]
    InvalidParameter(String),
    #[error("edge fit diverged in channel {channel}: {reason}")]
    EdgeFitDiverged { channel: usize, reason: String },
    #[error("no Fermi edge found in any channel")]
    EdgeNotFound,
}

impl CorrectionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CorrectionError::Array(e) => e.class(),
            CorrectionError::Provenance(e) => e.class(),
            CorrectionError::InvalidGeometry(GeometryError::Missing(_)) => ErrorClass::Structural,
            CorrectionError::InvalidGeometry(GeometryError::NonPhysical(_)) => ErrorClass::Numeric,
            CorrectionError::EdgeFitDiverged { .. } | CorrectionError::EdgeNotFound => {
                ErrorClass::Convergence
            }
            CorrectionError::MissingReference(_)
            | CorrectionError::ReferenceShapeMismatch { .. }
            | CorrectionError::InvalidParameter(_) => ErrorClass::Structural,
        }
    }
}

/// Why a momentum conversion cannot run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("'{0}' is neither in the correction nor in the instrument metadata")]
    Missing(&'static str),
    /// No sample maps to a physical momentum; nothing is left to mask.
    #[error("{0}")]
    NonPhysical(String),
}

impl CorrectionError {
    pub(crate) fn missing_geometry(name: &'static str) -> Self {
        CorrectionError::InvalidGeometry(GeometryError::Missing(name))
    }
}

// ─── Configuration ───────────────────────────────────────────────────

/// Instrument values supplied alongside raw data. Correction parameters,
/// when given, take precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentMetadata {
    /// eV
    pub photon_energy: Option<f64>,
    /// eV
    pub work_function: Option<f64>,
    /// eV
    pub inner_potential: Option<f64>,
    /// Sample temperature in K.
    pub temperature_k: Option<f64>,
    /// Loader-specific values, carried along untouched.
    pub extra: BTreeMap<String, f64>,
}

/// One correction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionSpec {
    FermiEdgeAlign(FermiEdgeSpec),
    AngleToK(AngleToKSpec),
    IntensityNormalize(NormalizeSpec),
}

impl CorrectionSpec {
    /// Operation name recorded in provenance.
    pub fn operation(&self) -> &'static str {
        match self {
            CorrectionSpec::FermiEdgeAlign(_) => "fermi_edge_align",
            CorrectionSpec::AngleToK(_) => "angle_to_k",
            CorrectionSpec::IntensityNormalize(_) => "intensity_normalize",
        }
    }

    /// Name of the reference array this step divides by, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            CorrectionSpec::IntensityNormalize(NormalizeSpec::Reference { name }) => Some(name),
            _ => None,
        }
    }
}

// ─── Output ──────────────────────────────────────────────────────────

/// Result of one correction.
#[derive(Debug, Clone, PartialEq)]
pub struct Corrected {
    pub array: LabeledArray,
    /// Values computed by the step (edges, shifts, grids); not fingerprinted.
    pub outputs: Params,
    /// Channels (lanes) that fell back to a cruder estimate.
    pub failed_channels: Vec<usize>,
    /// Samples set to NaN because their geometry was non-physical.
    pub masked_samples: usize,
}

impl Corrected {
    fn new(array: LabeledArray) -> Self {
        Self {
            array,
            outputs: Params::new(),
            failed_channels: Vec::new(),
            masked_samples: 0,
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────

/// Applies corrections against one set of metadata and reference arrays.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionEngine<'a> {
    metadata: &'a InstrumentMetadata,
    references: &'a BTreeMap<String, LabeledArray>,
}

impl<'a> CorrectionEngine<'a> {
    pub fn new(
        metadata: &'a InstrumentMetadata,
        references: &'a BTreeMap<String, LabeledArray>,
    ) -> Self {
        Self {
            metadata,
            references,
        }
    }

    pub fn metadata(&self) -> &InstrumentMetadata {
        self.metadata
    }

    fn reference_array(&self, name: &str) -> Result<&'a LabeledArray, CorrectionError> {
        self.references
            .get(name)
            .ok_or_else(|| CorrectionError::MissingReference(name.to_string()))
    }

    /// Parameters that determine the step's output, with metadata resolved.
    pub fn resolve_params(&self, spec: &CorrectionSpec) -> Result<Params, CorrectionError> {
        match spec {
            CorrectionSpec::FermiEdgeAlign(s) => Ok(s.params(self.metadata)),
            CorrectionSpec::AngleToK(s) => s.params(self.metadata),
            CorrectionSpec::IntensityNormalize(s) => Ok(s.params()),
        }
    }

    /// Parent nodes of the step: the input, plus the reference's source node.
    pub fn parent_nodes(
        &self,
        graph: &mut ProvenanceGraph,
        spec: &CorrectionSpec,
        input: NodeId,
    ) -> Result<Vec<NodeId>, CorrectionError> {
        let mut parents = vec![input];
        if let Some(name) = spec.reference() {
            let reference = self.reference_array(name)?;
            parents.push(graph.record_source(name, reference));
        }
        Ok(parents)
    }

    /// Run one correction.
    pub fn apply(
        &self,
        spec: &CorrectionSpec,
        array: &LabeledArray,
    ) -> Result<Corrected, CorrectionError> {
        debug!(operation = spec.operation(), dims = ?array.dims(), "applying correction");
        match spec {
            CorrectionSpec::FermiEdgeAlign(s) => fermi::align(array, s, self.metadata),
            CorrectionSpec::AngleToK(s) => momentum::convert(array, s, self.metadata),
            CorrectionSpec::IntensityNormalize(s) => match s {
                NormalizeSpec::TotalCounts { axis } => normalize::total_counts(array, axis),
                NormalizeSpec::Reference { name } => {
                    normalize::by_reference(array, name, self.reference_array(name)?)
                }
            },
        }
    }

    /// Run one correction and record it in `graph`.
    pub fn apply_tracked(
        &self,
        graph: &mut ProvenanceGraph,
        spec: &CorrectionSpec,
        input: Tracked<&LabeledArray>,
    ) -> Result<Tracked<Corrected>, CorrectionError> {
        let params = self.resolve_params(spec)?;
        let parents = self.parent_nodes(graph, spec, input.node)?;
        let corrected = self.apply(spec, input.value)?;
        let node = graph.record_with_outputs(
            spec.operation(),
            params,
            corrected.outputs.clone(),
            &parents,
        )?;
        Ok(Tracked::new(corrected, node))
    }
}

// ─── Shared helpers ──────────────────────────────────────────────────

fn interpolation_param(method: Interpolation) -> ParamValue {
    match method {
        Interpolation::Linear => "linear".into(),
        Interpolation::MonotoneCubic => "monotone_cubic".into(),
    }
}

fn optional_param(params: &mut Params, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        params.insert(key.to_string(), v.into());
    }
}
