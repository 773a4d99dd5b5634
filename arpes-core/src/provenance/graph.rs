//! Arena-backed provenance DAG.
//!
//! Records live in a `Vec` and refer to their parents by `NodeId` (index).
//! A record can only name parents that already exist, so every edge points to
//! a strictly smaller index and no cycle can ever be formed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::array::LabeledArray;

use super::fingerprint::{fingerprint, Fingerprint, ParamValue, Params};
use super::ProvenanceError;

/// Index of a record in a `ProvenanceGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One immutable node of the provenance DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    id: NodeId,
    operation: String,
    params: Params,
    /// Values produced by the step (e.g. per-channel shifts). Not hashed.
    #[serde(default)]
    outputs: Params,
    timestamp: DateTime<Utc>,
    parents: Vec<NodeId>,
    fingerprint: Fingerprint,
}

impl ProvenanceRecord {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn outputs(&self) -> &Params {
        &self.outputs
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn is_source(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Append-only store of provenance records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "GraphParts")]
pub struct ProvenanceGraph {
    records: Vec<ProvenanceRecord>,
    #[serde(skip)]
    index: HashMap<Fingerprint, NodeId>,
}

#[derive(Deserialize)]
struct GraphParts {
    records: Vec<ProvenanceRecord>,
}

impl TryFrom<GraphParts> for ProvenanceGraph {
    type Error = ProvenanceError;

    fn try_from(parts: GraphParts) -> Result<Self, Self::Error> {
        let mut index = HashMap::new();
        for (i, record) in parts.records.iter().enumerate() {
            if record.id.0 != i {
                return Err(ProvenanceError::InvalidGraph(format!(
                    "record at position {i} has id {}",
                    record.id
                )));
            }
            if let Some(bad) = record.parents.iter().find(|p| p.0 >= i) {
                return Err(ProvenanceError::InvalidGraph(format!(
                    "record {} names non-preceding parent {bad}",
                    record.id
                )));
            }
            index.entry(record.fingerprint.clone()).or_insert(record.id);
        }
        Ok(Self {
            records: parts.records,
            index,
        })
    }
}

impl ProvenanceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&ProvenanceRecord> {
        self.records.get(id.0)
    }

    pub fn records(&self) -> &[ProvenanceRecord] {
        &self.records
    }

    /// Node previously recorded with this fingerprint, if any.
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<NodeId> {
        self.index.get(fingerprint).copied()
    }

    /// Fingerprint an operation over existing parents without recording it.
    pub fn fingerprint_for(
        &self,
        operation: &str,
        params: &Params,
        parents: &[NodeId],
    ) -> Result<Fingerprint, ProvenanceError> {
        let parent_fps = parents
            .iter()
            .map(|&p| {
                self.get(p)
                    .map(ProvenanceRecord::fingerprint)
                    .ok_or(ProvenanceError::UnknownParent(p))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fingerprint(operation, params, &parent_fps))
    }

    /// Record an operation applied to `parents`.
    ///
    /// Recording an operation whose fingerprint already exists returns the
    /// existing node unchanged.
    pub fn record(
        &mut self,
        operation: &str,
        params: Params,
        parents: &[NodeId],
    ) -> Result<NodeId, ProvenanceError> {
        self.record_with_outputs(operation, params, Params::new(), parents)
    }

    /// Like `record`, also storing values the step produced.
    pub fn record_with_outputs(
        &mut self,
        operation: &str,
        params: Params,
        outputs: Params,
        parents: &[NodeId],
    ) -> Result<NodeId, ProvenanceError> {
        let fp = self.fingerprint_for(operation, &params, parents)?;
        if let Some(existing) = self.find(&fp) {
            return Ok(existing);
        }
        let id = NodeId(self.records.len());
        self.records.push(ProvenanceRecord {
            id,
            operation: operation.to_string(),
            params,
            outputs,
            timestamp: Utc::now(),
            parents: parents.to_vec(),
            fingerprint: fp.clone(),
        });
        self.index.insert(fp, id);
        Ok(id)
    }

    /// Root record for an externally supplied array, keyed by its content.
    pub fn record_source(&mut self, label: &str, array: &LabeledArray) -> NodeId {
        let mut params = Params::new();
        params.insert("label".into(), ParamValue::from(label));
        params.insert("content".into(), ParamValue::Text(array.content_hash()));
        params.insert(
            "dims".into(),
            ParamValue::Text(array.dims().join(",")),
        );
        // No parents, so this cannot fail.
        self.record("source", params, &[])
            .unwrap_or_else(|_| unreachable!("source records have no parents"))
    }

    /// Every record transitively reachable through parent edges.
    ///
    /// Lazy, each ancestor yielded once, never `id` itself.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        let stack = self
            .get(id)
            .map(|r| r.parents.iter().rev().copied().collect())
            .unwrap_or_default();
        Ancestors {
            graph: self,
            stack,
            seen: HashSet::new(),
        }
    }

    /// `id` and all of its ancestors in creation (topological) order.
    pub fn lineage(&self, id: NodeId) -> Vec<&ProvenanceRecord> {
        let mut ids: Vec<NodeId> = self.ancestors(id).map(|r| r.id).collect();
        if self.get(id).is_some() {
            ids.push(id);
        }
        ids.sort();
        ids.into_iter().filter_map(|i| self.get(i)).collect()
    }

    /// Names of all operations applied to produce `id`, oldest first.
    pub fn operations_applied(&self, id: NodeId) -> Vec<&str> {
        self.lineage(id)
            .into_iter()
            .map(ProvenanceRecord::operation)
            .collect()
    }
}

/// Lazy iterator over the ancestors of a node.
pub struct Ancestors<'g> {
    graph: &'g ProvenanceGraph,
    stack: Vec<NodeId>,
    seen: HashSet<NodeId>,
}

impl<'g> Iterator for Ancestors<'g> {
    type Item = &'g ProvenanceRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if !self.seen.insert(id) {
                continue;
            }
            let Some(record) = self.graph.get(id) else {
                continue;
            };
            self.stack.extend(record.parents.iter().rev().copied());
            return Some(record);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Axis;

    fn p(key: &str, v: f64) -> Params {
        let mut params = Params::new();
        params.insert(key.into(), v.into());
        params
    }

    fn raw() -> LabeledArray {
        LabeledArray::new(vec![Axis::new("eV", vec![0.0, 1.0])], vec![1.0, 2.0]).unwrap()
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut g = ProvenanceGraph::new();
        let err = g.record("op", Params::new(), &[NodeId(3)]).unwrap_err();
        assert_eq!(err, ProvenanceError::UnknownParent(NodeId(3)));
        assert!(g.is_empty());
    }

    #[test]
    fn recording_is_idempotent_by_fingerprint() {
        let mut g = ProvenanceGraph::new();
        let src = g.record_source("raw", &raw());
        let a = g.record("shift", p("dx", 1.0), &[src]).unwrap();
        let b = g.record("shift", p("dx", 1.0), &[src]).unwrap();
        let c = g.record("shift", p("dx", 2.0), &[src]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(g.len(), 3);
        assert_eq!(g.find(g.get(a).unwrap().fingerprint()), Some(a));
    }

    #[test]
    fn ancestors_cover_fan_in_and_fan_out_once() {
        let mut g = ProvenanceGraph::new();
        let src = g.record_source("raw", &raw());
        let reference = g.record("reference", Params::new(), &[src]).unwrap();
        let left = g.record("left", Params::new(), &[src]).unwrap();
        let joined = g.record("divide", Params::new(), &[left, reference]).unwrap();

        let ids: Vec<NodeId> = g.ancestors(joined).map(ProvenanceRecord::id).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&joined));
        assert_eq!(
            g.operations_applied(joined),
            vec!["source", "reference", "left", "divide"]
        );
    }

    #[test]
    fn graph_json_roundtrip_rebuilds_index() {
        let mut g = ProvenanceGraph::new();
        let src = g.record_source("raw", &raw());
        let a = g.record("shift", p("dx", 1.0), &[src]).unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: ProvenanceGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.find(g.get(a).unwrap().fingerprint()), Some(a));
    }

    #[test]
    fn deserialization_rejects_forward_edges() {
        let mut g = ProvenanceGraph::new();
        let src = g.record_source("raw", &raw());
        g.record("shift", p("dx", 1.0), &[src]).unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let tampered = json.replacen("\"parents\":[0]", "\"parents\":[1]", 1);
        assert!(serde_json::from_str::<ProvenanceGraph>(&tampered).is_err());
    }
}
