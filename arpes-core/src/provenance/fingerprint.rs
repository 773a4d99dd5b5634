//! Content fingerprints for provenance records.
//!
//! A fingerprint is a BLAKE3 hash over a canonical text encoding of
//! `(operation, sorted params, ordered parent fingerprints)`. Floats are
//! rounded to 10 significant digits before hashing so that float noise from
//! config round-trips does not change the cache key.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Parameter map recorded on a provenance node; sorted for deterministic hashing.
pub type Params = BTreeMap<String, ParamValue>;

/// A parameter value attached to a provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    #[serde(with = "nullable_float")]
    Number(f64),
    #[serde(with = "nullable_floats")]
    Numbers(Vec<f64>),
    Text(String),
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Number(v as f64)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Flag(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        ParamValue::Numbers(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            ParamValue::Numbers(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            ParamValue::Flag(b) => {
                let _ = write!(out, "b:{b}");
            }
            ParamValue::Number(v) => {
                out.push_str("n:");
                out.push_str(&canonical_float(*v));
            }
            ParamValue::Numbers(vs) => {
                let _ = write!(out, "v{}:[", vs.len());
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&canonical_float(*v));
                }
                out.push(']');
            }
            ParamValue::Text(s) => {
                let _ = write!(out, "t{}:{s}", s.len());
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Flag(b) => write!(f, "{b}"),
            ParamValue::Number(v) => write!(f, "{v}"),
            ParamValue::Numbers(vs) => write!(f, "[{} values]", vs.len()),
            ParamValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Fixed-precision float encoding: 10 significant digits, `-0` folded into `0`.
pub fn canonical_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        let s = if v > 0.0 { "inf" } else { "-inf" };
        s.to_string()
    } else if v == 0.0 {
        "0".to_string()
    } else {
        format!("{v:.9e}")
    }
}

/// Deterministic cache key of an operation applied to parents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash an operation, its parameters and its parents' fingerprints.
pub fn fingerprint(operation: &str, params: &Params, parents: &[&Fingerprint]) -> Fingerprint {
    let mut canonical = String::new();
    let _ = writeln!(canonical, "op{}:{operation}", operation.len());
    for (key, value) in params {
        let _ = write!(canonical, "p{}:{key}=", key.len());
        value.write_canonical(&mut canonical);
        canonical.push('\n');
    }
    for parent in parents {
        let _ = writeln!(canonical, "parent:{}", parent.0);
    }
    Fingerprint(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

mod nullable_float {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_f64(*v)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

mod nullable_floats {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(vs: &[f64], s: S) -> Result<S::Ok, S::Error> {
        let wire: Vec<Option<f64>> = vs.iter().map(|v| v.is_finite().then_some(*v)).collect();
        wire.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let wire = Vec::<Option<f64>>::deserialize(d)?;
        Ok(wire.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}
