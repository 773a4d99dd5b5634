//! ARPES Core — labeled arrays, provenance, corrections, models and fitting.
//!
//! This crate contains the numerical heart of the pipeline:
//! - Labeled N-dimensional arrays with named, monotonic coordinate axes
//! - Content-addressed provenance DAG with deterministic fingerprints
//! - Correction engine (Fermi-edge alignment, momentum conversion, normalization)
//! - Composable peak/background models with namespaced parameters
//! - Bounded Levenberg–Marquardt fitting with warm-started dataset sweeps
//! - Residual bootstrap uncertainties on a seeded RNG hierarchy

pub mod array;
pub mod correction;
pub mod error;
pub mod fit;
pub mod models;
pub mod provenance;
pub mod rng;
pub mod synthetic;

pub use array::{Axis, LabeledArray};
pub use error::ErrorClass;
