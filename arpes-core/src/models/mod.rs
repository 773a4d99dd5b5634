//! Composable parametric models.
//!
//! A `Model` is either a primitive function or an ordered composite of
//! children combined by addition or multiplication. Evaluation is structural
//! recursion; parameters are laid out leaf by leaf in composition order.
//!
//! Naming: a bare primitive uses its declared parameter names (`center`). In a
//! composite every leaf is namespaced by its label (`peak.center`); the label
//! defaults to the kind name, and labels shared by several leaves get their
//! occurrence index appended (`gaussian_0.center`, `gaussian_1.center`).

pub mod primitive;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorClass;
use crate::provenance::canonical_float;

pub use primitive::{fermi_edge_sigma, ParamSpec, PrimitiveKind, BOLTZMANN_EV};

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("duplicate parameter name '{0}'")]
    DuplicateParameter(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("model takes {expected} parameters, got {got}")]
    ParameterCount { expected: usize, got: usize },
    #[error("composite model has no children")]
    EmptyComposite,
    #[error("invalid bounds for '{name}': lower {lower} > upper {upper}")]
    InvalidBounds { name: String, lower: f64, upper: f64 },
}

impl ModelError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

// ─── Model tree ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOp {
    Add,
    Multiply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    #[serde(flatten)]
    pub kind: PrimitiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Primitive {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.kind.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composite {
    pub op: CompositeOp,
    pub children: Vec<Model>,
}

/// A parametric function `f(x; p)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Model {
    Composite(Composite),
    Primitive(Primitive),
}

impl Model {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        Model::Primitive(Primitive { kind, label: None })
    }

    pub fn constant() -> Self {
        Self::primitive(PrimitiveKind::Constant)
    }

    pub fn linear() -> Self {
        Self::primitive(PrimitiveKind::Linear)
    }

    pub fn polynomial(degree: usize) -> Self {
        Self::primitive(PrimitiveKind::Polynomial { degree })
    }

    pub fn gaussian() -> Self {
        Self::primitive(PrimitiveKind::Gaussian)
    }

    pub fn lorentzian() -> Self {
        Self::primitive(PrimitiveKind::Lorentzian)
    }

    pub fn fermi_dirac() -> Self {
        Self::primitive(PrimitiveKind::FermiDirac)
    }

    pub fn fermi_edge(temperature_k: f64) -> Self {
        Self::primitive(PrimitiveKind::FermiEdge { temperature_k })
    }

    /// Set the label of a primitive. Composites are returned unchanged.
    pub fn labeled(self, label: impl Into<String>) -> Self {
        match self {
            Model::Primitive(p) => Model::Primitive(Primitive {
                label: Some(label.into()),
                ..p
            }),
            other => other,
        }
    }

    /// Combine two models, flattening nested composites of the same op.
    pub fn compose(op: CompositeOp, lhs: Model, rhs: Model) -> Self {
        let mut children = Vec::new();
        for side in [lhs, rhs] {
            match side {
                Model::Composite(c) if c.op == op => children.extend(c.children),
                other => children.push(other),
            }
        }
        Model::Composite(Composite { op, children })
    }

    /// Total parameter count.
    pub fn n_params(&self) -> usize {
        match self {
            Model::Primitive(p) => p.kind.n_params(),
            Model::Composite(c) => c.children.iter().map(Model::n_params).sum(),
        }
    }

    /// Primitive leaves in composition order.
    pub fn leaves(&self) -> Vec<&Primitive> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Primitive>) {
        match self {
            Model::Primitive(p) => out.push(p),
            Model::Composite(c) => c.children.iter().for_each(|m| m.collect_leaves(out)),
        }
    }

    /// Declared parameters with fully qualified names, in evaluation order.
    pub fn parameters(&self) -> Result<Vec<ParamSpec>, ModelError> {
        let leaves = match self {
            Model::Primitive(p) => return Ok(p.kind.params()),
            Model::Composite(c) if c.children.is_empty() => {
                return Err(ModelError::EmptyComposite)
            }
            Model::Composite(_) => self.leaves(),
        };

        let mut totals: HashMap<&str, usize> = HashMap::new();
        for leaf in &leaves {
            *totals.entry(leaf.label()).or_default() += 1;
        }

        let mut seen_labels: HashMap<&str, usize> = HashMap::new();
        let mut names = HashSet::new();
        let mut specs = Vec::with_capacity(self.n_params());
        for leaf in &leaves {
            let label = leaf.label();
            let occurrence = seen_labels.entry(label).or_default();
            let namespace = if totals[label] > 1 {
                format!("{label}_{occurrence}")
            } else {
                label.to_string()
            };
            *occurrence += 1;

            for spec in leaf.kind.params() {
                let name = format!("{namespace}.{}", spec.name);
                if !names.insert(name.clone()) {
                    return Err(ModelError::DuplicateParameter(name));
                }
                specs.push(ParamSpec { name, ..spec });
            }
        }
        Ok(specs)
    }

    pub fn param_names(&self) -> Result<Vec<String>, ModelError> {
        Ok(self.parameters()?.into_iter().map(|s| s.name).collect())
    }

    /// Evaluate at one point. `params` must hold `n_params()` values.
    pub fn value_at(&self, x: f64, params: &[f64]) -> f64 {
        match self {
            Model::Primitive(p) => p.kind.eval(x, params),
            Model::Composite(c) => {
                let mut rest = params;
                let mut acc = match c.op {
                    CompositeOp::Add => 0.0,
                    CompositeOp::Multiply => 1.0,
                };
                for child in &c.children {
                    let (mine, tail) = rest.split_at(child.n_params());
                    rest = tail;
                    let v = child.value_at(x, mine);
                    match c.op {
                        CompositeOp::Add => acc += v,
                        CompositeOp::Multiply => acc *= v,
                    }
                }
                acc
            }
        }
    }

    /// Evaluate at every `x`.
    pub fn evaluate(&self, x: &[f64], params: &[f64]) -> Result<Vec<f64>, ModelError> {
        let expected = self.n_params();
        if params.len() != expected {
            return Err(ModelError::ParameterCount {
                expected,
                got: params.len(),
            });
        }
        Ok(x.iter().map(|&xi| self.value_at(xi, params)).collect())
    }

    /// Initial parameter vector: declared defaults with `overrides` applied.
    pub fn resolve_initial(&self, overrides: &BTreeMap<String, f64>) -> Result<Vec<f64>, ModelError> {
        let specs = self.parameters()?;
        check_known(&specs, overrides.keys())?;
        Ok(specs
            .iter()
            .map(|s| overrides.get(&s.name).copied().unwrap_or(s.initial))
            .collect())
    }

    /// `(lower, upper)` per parameter: declared bounds with `overrides` applied.
    pub fn resolve_bounds(
        &self,
        overrides: &BTreeMap<String, Bounds>,
    ) -> Result<Vec<(f64, f64)>, ModelError> {
        let specs = self.parameters()?;
        check_known(&specs, overrides.keys())?;
        specs
            .iter()
            .map(|s| {
                let o = overrides.get(&s.name).copied().unwrap_or_default();
                let lower = o.lower.unwrap_or(s.lower);
                let upper = o.upper.unwrap_or(s.upper);
                if lower > upper {
                    return Err(ModelError::InvalidBounds {
                        name: s.name.clone(),
                        lower,
                        upper,
                    });
                }
                Ok((lower, upper))
            })
            .collect()
    }
}

fn check_known<'a>(
    specs: &[ParamSpec],
    keys: impl Iterator<Item = &'a String>,
) -> Result<(), ModelError> {
    for key in keys {
        if !specs.iter().any(|s| &s.name == key) {
            return Err(ModelError::UnknownParameter(key.clone()));
        }
    }
    Ok(())
}

impl Add for Model {
    type Output = Model;

    fn add(self, rhs: Model) -> Model {
        Model::compose(CompositeOp::Add, self, rhs)
    }
}

impl Mul for Model {
    type Output = Model;

    fn mul(self, rhs: Model) -> Model {
        Model::compose(CompositeOp::Multiply, self, rhs)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Model::Primitive(p) => match &p.label {
                Some(label) => write!(f, "{label}:{}", p.kind.name()),
                None => write!(f, "{}", p.kind.name()),
            },
            Model::Composite(c) => {
                let sep = match c.op {
                    CompositeOp::Add => " + ",
                    CompositeOp::Multiply => " * ",
                };
                write!(f, "(")?;
                for (i, child) in c.children.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{sep}")?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl PrimitiveKind {
    /// Kind name plus every shape argument, floats in canonical form.
    fn canonical(&self) -> String {
        match self {
            PrimitiveKind::Polynomial { degree } => format!("polynomial(degree={degree})"),
            PrimitiveKind::FermiEdge { temperature_k } => {
                format!("fermi_edge(temperature_k={})", canonical_float(*temperature_k))
            }
            other => other.name().to_string(),
        }
    }
}

impl Model {
    /// Full identity of the model for fingerprinting.
    ///
    /// Unlike `Display`, this carries shape arguments (polynomial degree,
    /// edge temperature) and distinguishes explicit labels from defaults.
    pub fn canonical(&self) -> String {
        match self {
            Model::Primitive(p) => match &p.label {
                Some(label) => format!("{}@{label}", p.kind.canonical()),
                None => p.kind.canonical(),
            },
            Model::Composite(c) => {
                let op = match c.op {
                    CompositeOp::Add => "add",
                    CompositeOp::Multiply => "multiply",
                };
                let children: Vec<String> = c.children.iter().map(Model::canonical).collect();
                format!("{op}[{}]", children.join(";"))
            }
        }
    }
}

/// Optional override of one parameter's bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl Bounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_flattens_and_preserves_order() {
        let m = Model::gaussian() + Model::linear() + Model::constant();
        let Model::Composite(c) = &m else {
            panic!("expected composite");
        };
        assert_eq!(c.op, CompositeOp::Add);
        assert_eq!(c.children.len(), 3);
        assert_eq!(
            m.param_names().unwrap(),
            vec![
                "gaussian.amplitude",
                "gaussian.center",
                "gaussian.sigma",
                "linear.slope",
                "linear.intercept",
                "constant.c",
            ]
        );
    }

    #[test]
    fn grouping_does_not_change_parameter_order() {
        let left = (Model::gaussian() + Model::linear()) + Model::constant();
        let right = Model::gaussian() + (Model::linear() + Model::constant());
        assert_eq!(left.param_names().unwrap(), right.param_names().unwrap());
    }

    #[test]
    fn repeated_labels_are_qualified_by_index() {
        let m = Model::gaussian() + Model::gaussian() + Model::linear();
        let names = m.param_names().unwrap();
        assert_eq!(names[0], "gaussian_0.amplitude");
        assert_eq!(names[3], "gaussian_1.amplitude");
        assert_eq!(names[6], "linear.slope");
    }

    #[test]
    fn clashing_user_labels_are_rejected() {
        let m = Model::gaussian() + Model::gaussian() + Model::lorentzian().labeled("gaussian_1");
        // gaussian_1.amplitude and gaussian_1.amplitude collide.
        assert_eq!(
            m.parameters().unwrap_err(),
            ModelError::DuplicateParameter("gaussian_1.amplitude".into())
        );
    }

    #[test]
    fn add_and_multiply_evaluate_structurally() {
        let m = Model::constant() * (Model::linear() + Model::constant());
        // 2 * (3x + 1 + 4)
        let y = m.evaluate(&[0.0, 1.0], &[2.0, 3.0, 1.0, 4.0]).unwrap();
        assert_eq!(y, vec![10.0, 16.0]);
        assert_eq!(
            m.evaluate(&[0.0], &[1.0]).unwrap_err(),
            ModelError::ParameterCount { expected: 4, got: 1 }
        );
    }

    #[test]
    fn overrides_resolve_by_name() {
        let m = Model::gaussian().labeled("peak") + Model::linear();
        let mut init = BTreeMap::new();
        init.insert("peak.center".to_string(), 0.25);
        let p = m.resolve_initial(&init).unwrap();
        assert_eq!(p[1], 0.25);
        assert_eq!(p[0], 1.0);

        init.insert("peak.width".to_string(), 1.0);
        assert_eq!(
            m.resolve_initial(&init).unwrap_err(),
            ModelError::UnknownParameter("peak.width".into())
        );

        let mut bounds = BTreeMap::new();
        bounds.insert("linear.slope".to_string(), Bounds::new(-1.0, 1.0));
        let b = m.resolve_bounds(&bounds).unwrap();
        assert_eq!(b[3], (-1.0, 1.0));
        assert_eq!(b[0], (0.0, f64::INFINITY));

        bounds.insert("linear.intercept".to_string(), Bounds::new(2.0, 1.0));
        assert!(matches!(
            m.resolve_bounds(&bounds).unwrap_err(),
            ModelError::InvalidBounds { .. }
        ));
    }

    #[test]
    fn empty_composite_is_rejected() {
        let m = Model::Composite(Composite {
            op: CompositeOp::Add,
            children: vec![],
        });
        assert_eq!(m.parameters().unwrap_err(), ModelError::EmptyComposite);
    }

    #[test]
    fn canonical_form_carries_shape_arguments() {
        assert_ne!(Model::fermi_edge(10.0).canonical(), Model::fermi_edge(300.0).canonical());
        assert_eq!(Model::fermi_edge(10.0).to_string(), Model::fermi_edge(300.0).to_string());
        assert_ne!(Model::polynomial(2).canonical(), Model::polynomial(3).canonical());
        assert_ne!(
            Model::gaussian().canonical(),
            Model::gaussian().labeled("gaussian").canonical()
        );
        let sum = Model::gaussian() + Model::fermi_edge(20.0);
        let product = Model::gaussian() * Model::fermi_edge(20.0);
        assert_eq!(sum.canonical(), "add[gaussian;fermi_edge(temperature_k=2.000000000e1)]");
        assert_ne!(sum.canonical(), product.canonical());
    }

    #[test]
    fn model_serde_roundtrip() {
        let m = Model::gaussian().labeled("peak") + Model::fermi_edge(15.0);
        let json = serde_json::to_string(&m).unwrap();
        let back: Model = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert_eq!(m.to_string(), "(peak:gaussian + fermi_edge)");
    }
}
