//! Provenance tracking.
//!
//! Every derived array is paired with a `NodeId` in a `ProvenanceGraph`.
//! Records are content-addressed by a `Fingerprint`, which doubles as the
//! cache key for re-runs.

pub mod fingerprint;
pub mod graph;

use thiserror::Error;

use crate::error::ErrorClass;

pub use fingerprint::{canonical_float, fingerprint, Fingerprint, ParamValue, Params};
pub use graph::{Ancestors, NodeId, ProvenanceGraph, ProvenanceRecord};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvenanceError {
    #[error("parent node {0} does not exist")]
    UnknownParent(NodeId),
    #[error("invalid provenance graph: {0}")]
    InvalidGraph(String),
}

impl ProvenanceError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

/// A value paired with the provenance node that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
    pub value: T,
    pub node: NodeId,
}

impl<T> Tracked<T> {
    pub fn new(value: T, node: NodeId) -> Self {
        Self { value, node }
    }
}
