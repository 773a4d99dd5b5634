//! Pipeline configuration loaded from TOML.
//!
//! ```toml
//! [metadata]
//! photon_energy = 21.2
//! work_function = 4.3
//!
//! [[corrections]]
//! kind = "fermi_edge_align"
//! window = [-0.1, 0.1]
//!
//! [[corrections]]
//! kind = "angle_to_k"
//!
//! [fit]
//! fit_axis = "eV"
//! bootstrap_resamples = 100
//! seed = 7
//!
//! [fit.model]
//! op = "add"
//! children = [{ kind = "gaussian", label = "peak" }, { kind = "linear" }]
//!
//! [fit.initial]
//! "peak.center" = -0.1
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use arpes_core::correction::{CorrectionSpec, InstrumentMetadata};
use arpes_core::error::ErrorClass;
use arpes_core::fit::FitOptions;
use arpes_core::models::{Bounds, Model, ModelError};
use arpes_core::provenance::{ParamValue, Params};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse pipeline TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize pipeline TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid fit configuration: {0}")]
    Model(#[from] ModelError),
    #[error("invalid pipeline configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

fn default_fit_axis() -> String {
    "eV".to_string()
}

/// Everything needed to reproduce one pipeline run, apart from the arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub metadata: InstrumentMetadata,
    /// Applied in order.
    #[serde(default)]
    pub corrections: Vec<CorrectionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub model: Model,
    #[serde(default = "default_fit_axis")]
    pub fit_axis: String,
    /// Starting values by parameter name; unnamed parameters use model defaults.
    #[serde(default)]
    pub initial: BTreeMap<String, f64>,
    #[serde(default)]
    pub bounds: BTreeMap<String, Bounds>,
    /// 0 disables the bootstrap.
    #[serde(default)]
    pub bootstrap_resamples: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(flatten)]
    pub options: FitOptions,
}

/// Initial values and bounds as vectors in model parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFit {
    pub param_names: Vec<String>,
    pub initial: Vec<f64>,
    pub bounds: Vec<(f64, f64)>,
}

impl FitConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            fit_axis: default_fit_axis(),
            initial: BTreeMap::new(),
            bounds: BTreeMap::new(),
            bootstrap_resamples: 0,
            seed: 0,
            options: FitOptions::default(),
        }
    }

    pub fn resolve(&self) -> Result<ResolvedFit, ModelError> {
        Ok(ResolvedFit {
            param_names: self.model.param_names()?,
            initial: self.model.resolve_initial(&self.initial)?,
            bounds: self.model.resolve_bounds(&self.bounds)?,
        })
    }

    /// Parameters fingerprinted for the fit step.
    pub fn params(&self, resolved: &ResolvedFit) -> Params {
        let mut p = Params::new();
        p.insert("model".into(), ParamValue::Text(self.model.canonical()));
        p.insert("parameters".into(), ParamValue::Text(resolved.param_names.join(",")));
        p.insert("fit_axis".into(), self.fit_axis.as_str().into());
        p.insert("initial".into(), resolved.initial.clone().into());
        p.insert(
            "bounds".into(),
            resolved
                .bounds
                .iter()
                .flat_map(|&(lo, hi)| [lo, hi])
                .collect::<Vec<_>>()
                .into(),
        );
        p.insert("max_iterations".into(), self.options.max_iterations.into());
        p.insert("ftol".into(), self.options.ftol.into());
        p.insert("xtol".into(), self.options.xtol.into());
        p.insert("initial_lambda".into(), self.options.initial_lambda.into());
        p.insert("warm_start".into(), self.options.warm_start.into());
        p.insert("bootstrap_resamples".into(), self.bootstrap_resamples.into());
        if self.bootstrap_resamples > 0 {
            p.insert("seed".into(), ParamValue::Text(self.seed.to_string()));
        }
        p
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks that can be made without the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("photon_energy", self.metadata.photon_energy),
            ("work_function", self.metadata.work_function),
            ("inner_potential", self.metadata.inner_potential),
            ("temperature_k", self.metadata.temperature_k),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(ConfigError::Invalid(format!("metadata.{name} is not finite")));
            }
        }
        if let Some(fit) = &self.fit {
            fit.resolve()?;
            if fit.options.max_iterations == 0 {
                return Err(ConfigError::Invalid("fit.max_iterations must be positive".into()));
            }
            if !(fit.options.ftol >= 0.0 && fit.options.xtol >= 0.0) {
                return Err(ConfigError::Invalid("fit tolerances must be non-negative".into()));
            }
            if fit.bootstrap_resamples == 1 {
                return Err(ConfigError::Invalid(
                    "fit.bootstrap_resamples must be 0 or at least 2".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arpes_core::correction::NormalizeSpec;
    use arpes_core::provenance::fingerprint;

    use crate::pipeline::FIT_OPERATION;

    const SAMPLE: &str = r#"
[metadata]
photon_energy = 21.2
work_function = 4.3
temperature_k = 15

[[corrections]]
kind = "fermi_edge_align"
window = [-0.1, 0.1]

[[corrections]]
kind = "intensity_normalize"
method = "total_counts"

[[corrections]]
kind = "angle_to_k"
k_points = 64

[fit]
fit_axis = "eV"
bootstrap_resamples = 50
seed = 9
max_iterations = 100

[fit.model]
op = "add"
children = [{ kind = "gaussian", label = "peak" }, { kind = "linear" }]

[fit.initial]
"peak.center" = -0.1

[fit.bounds]
"peak.sigma" = { lower = 0.001, upper = 0.5 }
"#;

    #[test]
    fn sample_config_parses() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.metadata.temperature_k, Some(15.0));
        assert_eq!(config.corrections.len(), 3);
        assert_eq!(config.corrections[0].operation(), "fermi_edge_align");
        assert!(matches!(
            &config.corrections[1],
            CorrectionSpec::IntensityNormalize(NormalizeSpec::TotalCounts { axis }) if axis == "eV"
        ));

        let fit = config.fit.as_ref().unwrap();
        assert_eq!(fit.options.max_iterations, 100);
        assert!(fit.options.warm_start);
        let resolved = fit.resolve().unwrap();
        assert_eq!(resolved.param_names[1], "peak.center");
        assert_eq!(resolved.initial[1], -0.1);
        assert_eq!(resolved.bounds[2], (0.001, 0.5));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let bad = SAMPLE.replace("\"peak.center\" = -0.1", "\"peak.centre\" = -0.1");
        let err = PipelineConfig::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Model(ModelError::UnknownParameter(_))));
    }

    #[test]
    fn unknown_correction_kind_is_a_parse_error() {
        let err = PipelineConfig::from_toml_str("[[corrections]]\nkind = \"deconvolve\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_config_is_valid() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert!(config.corrections.is_empty());
        assert!(config.fit.is_none());
    }

    #[test]
    fn toml_roundtrip() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn fit_params_change_with_seed_only_when_bootstrapping() {
        let mut fit = FitConfig::new(Model::linear());
        let resolved = fit.resolve().unwrap();
        let a = fit.params(&resolved);
        fit.seed = 4;
        assert_eq!(fit.params(&resolved), a);
        fit.bootstrap_resamples = 10;
        let b = fit.params(&resolved);
        fit.seed = 5;
        assert_ne!(fit.params(&resolved), b);
    }

    #[test]
    fn fit_params_change_with_edge_temperature() {
        let cold = FitConfig::new(Model::fermi_edge(10.0));
        let hot = FitConfig::new(Model::fermi_edge(300.0));
        let cold_params = cold.params(&cold.resolve().unwrap());
        let hot_params = hot.params(&hot.resolve().unwrap());
        assert_ne!(cold_params, hot_params);
        assert_ne!(
            fingerprint(FIT_OPERATION, &cold_params, &[]),
            fingerprint(FIT_OPERATION, &hot_params, &[])
        );
    }

    fn shaped(peak: Model, label: &str, temperature_k: f64, degree: usize) -> Model {
        peak.labeled(label) + Model::fermi_edge(temperature_k).labeled("edge") + Model::polynomial(degree)
    }

    proptest::proptest! {
        #[test]
        fn every_fit_setting_changes_the_fit_fingerprint(
            t in 5.0..300.0_f64,
            degree in 0usize..4,
            x in 0.01..1.0_f64,
            n in 2usize..200,
            seed in 0u64..1_000,
        ) {
            let base = FitConfig::new(shaped(Model::gaussian(), "peak", t, degree));
            let edit = |change: &dyn Fn(&mut FitConfig)| {
                let mut c = base.clone();
                change(&mut c);
                c
            };
            let bootstrapped = edit(&|c| {
                c.bootstrap_resamples = n;
                c.seed = seed;
            });

            let cases = vec![
                ("edge temperature", &base, edit(&|c| c.model = shaped(Model::gaussian(), "peak", t + x, degree))),
                ("polynomial degree", &base, edit(&|c| c.model = shaped(Model::gaussian(), "peak", t, degree + 1))),
                ("label", &base, edit(&|c| c.model = shaped(Model::gaussian(), "band", t, degree))),
                ("peak kind", &base, edit(&|c| c.model = shaped(Model::lorentzian(), "peak", t, degree))),
                ("composite op", &base, edit(&|c| {
                    c.model = Model::gaussian().labeled("peak") * Model::fermi_edge(t).labeled("edge")
                        + Model::polynomial(degree);
                })),
                ("fit_axis", &base, edit(&|c| c.fit_axis = "kp".into())),
                ("initial", &base, edit(&|c| {
                    c.initial.insert("peak.center".into(), x);
                })),
                ("lower bound", &base, edit(&|c| {
                    c.bounds.insert("peak.center".into(), Bounds { lower: Some(-x), upper: None });
                })),
                ("upper bound", &base, edit(&|c| {
                    c.bounds.insert("peak.sigma".into(), Bounds { lower: None, upper: Some(1.0 + x) });
                })),
                ("max_iterations", &base, edit(&|c| c.options.max_iterations += n)),
                ("ftol", &base, edit(&|c| c.options.ftol *= 1.0 + x)),
                ("xtol", &base, edit(&|c| c.options.xtol *= 1.0 + x)),
                ("initial_lambda", &base, edit(&|c| c.options.initial_lambda *= 1.0 + x)),
                ("warm_start", &base, edit(&|c| c.options.warm_start = !c.options.warm_start)),
                ("bootstrap_resamples", &base, bootstrapped.clone()),
                ("seed", &bootstrapped, {
                    let mut c = bootstrapped.clone();
                    c.seed += 1;
                    c
                }),
            ];

            for (field, before, after) in cases {
                let p = before.params(&before.resolve().unwrap());
                let q = after.params(&after.resolve().unwrap());
                proptest::prop_assert_ne!(&p, &q, "{} left the params unchanged", field);
                proptest::prop_assert_ne!(
                    fingerprint(FIT_OPERATION, &p, &[]),
                    fingerprint(FIT_OPERATION, &q, &[]),
                    "{} left the fingerprint unchanged", field
                );
            }
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/pipeline.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pipeline.toml"));
    }
}
