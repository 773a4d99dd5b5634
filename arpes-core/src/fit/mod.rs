//! Fit engine.
//!
//! - `lm`: bounded Levenberg–Marquardt for one slice (`fit_slice`).
//! - `dataset`: every slice of a `LabeledArray`, optionally warm-started.
//! - `bootstrap`: residual-resampling uncertainty estimates.
//!
//! Single-slice fits never fail: optimizer trouble is reported through
//! `FitResult::status` so batch fits keep going past isolated bad slices.

pub mod bootstrap;
pub mod dataset;
pub mod lm;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::array::ArrayError;
use crate::error::ErrorClass;
use crate::models::ModelError;
use crate::provenance::NodeId;

pub use bootstrap::{bootstrap, bootstrap_dataset, BootstrapResult, ParameterDistribution};
pub use dataset::{failed_slices, fit_dataset, parameter_map, DatasetFit};
pub use lm::fit_slice;

// ─── Errors ──────────────────────────────────────────────────────────

/// Structural problems with a fit request (never optimizer failures).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{what} has {got} entries, model has {expected} parameters")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

impl FitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FitError::Array(e) => e.class(),
            FitError::Model(e) => e.class(),
            FitError::LengthMismatch { .. } => ErrorClass::Structural,
        }
    }
}

// ─── Options ─────────────────────────────────────────────────────────

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative cost reduction below which an accepted step ends the fit.
    pub ftol: f64,
    /// Relative step size below which an accepted step ends the fit.
    pub xtol: f64,
    /// Starting Marquardt damping.
    pub initial_lambda: f64,
    /// `fit_dataset` only: start each slice from its chain predecessor.
    pub warm_start: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            initial_lambda: 1e-3,
            warm_start: true,
        }
    }
}

// ─── Results ─────────────────────────────────────────────────────────

/// Why a fit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    MaxIterations,
    /// Too few finite points or constant observed data.
    Degenerate,
    /// Curvature matrix not invertible at the solution.
    Singular,
    /// Cost not finite at the starting point.
    NonFinite,
}

impl FitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FitStatus::Converged => "converged",
            FitStatus::MaxIterations => "max_iterations",
            FitStatus::Degenerate => "degenerate",
            FitStatus::Singular => "singular",
            FitStatus::NonFinite => "non_finite",
        }
    }
}

/// Where `FitResult::stderr` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Covariance,
    Bootstrap,
}

/// Outcome of fitting one slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    pub params: Vec<f64>,
    /// NaN where no estimate is available.
    pub stderr: Vec<f64>,
    pub error_source: ErrorSource,
    /// 2.5 / 97.5 percentile bounds, when bootstrapped.
    pub interval: Option<Vec<[f64; 2]>>,
    pub rss: f64,
    pub iterations: usize,
    pub n_points: usize,
    pub converged: bool,
    pub status: FitStatus,
    pub input_node: Option<NodeId>,
}

impl FitResult {
    /// A result that never left the starting point.
    pub(crate) fn unfitted(params: Vec<f64>, status: FitStatus, n_points: usize) -> Self {
        let n = params.len();
        Self {
            params,
            stderr: vec![f64::NAN; n],
            error_source: ErrorSource::Covariance,
            interval: None,
            rss: f64::NAN,
            iterations: 0,
            n_points,
            converged: false,
            status,
            input_node: None,
        }
    }
}
