//! Primitive model functions.
//!
//! Each kind declares its parameters (name, default initial value, bounds) and
//! a pointwise evaluator taking exactly that many parameters in order.

use serde::{Deserialize, Serialize};

/// Boltzmann constant in eV/K.
pub const BOLTZMANN_EV: f64 = 8.617_333_262e-5;

/// Declared parameter of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ParamSpec {
    fn free(name: &str, initial: f64) -> Self {
        Self {
            name: name.to_string(),
            initial,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    fn at_least(name: &str, initial: f64, lower: f64) -> Self {
        Self {
            lower,
            ..Self::free(name, initial)
        }
    }
}

/// The shape of a primitive model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrimitiveKind {
    /// `c`
    Constant,
    /// `slope * x + intercept`
    Linear,
    /// `c0 + c1 x + ... + cN x^N`
    Polynomial { degree: usize },
    /// `amplitude * exp(-(x - center)^2 / (2 sigma^2))`
    Gaussian,
    /// `amplitude * gamma^2 / ((x - center)^2 + gamma^2)`
    Lorentzian,
    /// `amplitude / (exp((x - center) / width) + 1)`, `width` = kT in eV.
    FermiDirac,
    /// Fermi-Dirac at a fixed temperature broadened by a Gaussian of `width`.
    ///
    /// The convolution is approximated by an error-function step whose
    /// variance is the sum of the Gaussian variance and the variance of the
    /// Fermi-Dirac derivative, `(pi k T)^2 / 3`.
    FermiEdge { temperature_k: f64 },
}

impl PrimitiveKind {
    /// Default label, used as the parameter namespace in composites.
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Constant => "constant",
            PrimitiveKind::Linear => "linear",
            PrimitiveKind::Polynomial { .. } => "polynomial",
            PrimitiveKind::Gaussian => "gaussian",
            PrimitiveKind::Lorentzian => "lorentzian",
            PrimitiveKind::FermiDirac => "fermi_dirac",
            PrimitiveKind::FermiEdge { .. } => "fermi_edge",
        }
    }

    pub fn n_params(&self) -> usize {
        match self {
            PrimitiveKind::Constant => 1,
            PrimitiveKind::Linear => 2,
            PrimitiveKind::Polynomial { degree } => degree + 1,
            PrimitiveKind::Gaussian | PrimitiveKind::Lorentzian | PrimitiveKind::FermiDirac => 3,
            PrimitiveKind::FermiEdge { .. } => 4,
        }
    }

    pub fn params(&self) -> Vec<ParamSpec> {
        match self {
            PrimitiveKind::Constant => vec![ParamSpec::free("c", 0.0)],
            PrimitiveKind::Linear => vec![
                ParamSpec::free("slope", 0.0),
                ParamSpec::free("intercept", 0.0),
            ],
            PrimitiveKind::Polynomial { degree } => (0..=*degree)
                .map(|i| ParamSpec::free(&format!("c{i}"), 0.0))
                .collect(),
            PrimitiveKind::Gaussian => vec![
                ParamSpec::at_least("amplitude", 1.0, 0.0),
                ParamSpec::free("center", 0.0),
                ParamSpec::at_least("sigma", 0.1, 1e-9),
            ],
            PrimitiveKind::Lorentzian => vec![
                ParamSpec::at_least("amplitude", 1.0, 0.0),
                ParamSpec::free("center", 0.0),
                ParamSpec::at_least("gamma", 0.1, 1e-9),
            ],
            PrimitiveKind::FermiDirac => vec![
                ParamSpec::free("center", 0.0),
                ParamSpec::at_least("width", 0.01, 1e-6),
                ParamSpec::free("amplitude", 1.0),
            ],
            PrimitiveKind::FermiEdge { .. } => vec![
                ParamSpec::free("center", 0.0),
                ParamSpec::at_least("width", 0.01, 0.0),
                ParamSpec::free("amplitude", 1.0),
                ParamSpec::free("background", 0.0),
            ],
        }
    }

    /// Evaluate at `x`. `p` must hold exactly `n_params()` values.
    pub fn eval(&self, x: f64, p: &[f64]) -> f64 {
        match self {
            PrimitiveKind::Constant => p[0],
            PrimitiveKind::Linear => p[0] * x + p[1],
            // Horner, highest coefficient first.
            PrimitiveKind::Polynomial { .. } => p.iter().rev().fold(0.0, |acc, c| acc * x + c),
            PrimitiveKind::Gaussian => {
                let z = (x - p[1]) / p[2];
                p[0] * (-0.5 * z * z).exp()
            }
            PrimitiveKind::Lorentzian => {
                let g2 = p[2] * p[2];
                let d = x - p[1];
                p[0] * g2 / (d * d + g2)
            }
            PrimitiveKind::FermiDirac => {
                let z = (x - p[0]) / p[1];
                // exp overflows to inf for large z, giving 0 as intended.
                p[2] / (z.exp() + 1.0)
            }
            PrimitiveKind::FermiEdge { temperature_k } => {
                let sigma = fermi_edge_sigma(p[1], *temperature_k);
                let z = (x - p[0]) / (std::f64::consts::SQRT_2 * sigma);
                p[2] * 0.5 * libm::erfc(z) + p[3]
            }
        }
    }
}

/// Effective Gaussian width of a thermally and instrumentally broadened edge.
pub fn fermi_edge_sigma(resolution: f64, temperature_k: f64) -> f64 {
    let kt = BOLTZMANN_EV * temperature_k.max(0.0);
    let thermal_var = (std::f64::consts::PI * kt).powi(2) / 3.0;
    (resolution * resolution + thermal_var).sqrt().max(1e-12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_counts_match_declarations() {
        let kinds = [
            PrimitiveKind::Constant,
            PrimitiveKind::Linear,
            PrimitiveKind::Polynomial { degree: 3 },
            PrimitiveKind::Gaussian,
            PrimitiveKind::Lorentzian,
            PrimitiveKind::FermiDirac,
            PrimitiveKind::FermiEdge { temperature_k: 10.0 },
        ];
        for kind in kinds {
            assert_eq!(kind.params().len(), kind.n_params(), "{}", kind.name());
        }
    }

    #[test]
    fn peaks_reach_amplitude_at_center() {
        assert!((PrimitiveKind::Gaussian.eval(0.3, &[2.0, 0.3, 0.1]) - 2.0).abs() < 1e-12);
        assert!((PrimitiveKind::Lorentzian.eval(0.3, &[2.0, 0.3, 0.1]) - 2.0).abs() < 1e-12);
        // Lorentzian half maximum at one gamma.
        assert!((PrimitiveKind::Lorentzian.eval(0.4, &[2.0, 0.3, 0.1]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn polynomial_uses_ascending_coefficients() {
        let poly = PrimitiveKind::Polynomial { degree: 2 };
        assert_eq!(poly.eval(2.0, &[1.0, 2.0, 3.0]), 1.0 + 4.0 + 12.0);
    }

    #[test]
    fn fermi_functions_are_half_at_center_and_saturate() {
        let fd = PrimitiveKind::FermiDirac;
        assert!((fd.eval(0.0, &[0.0, 0.01, 1.0]) - 0.5).abs() < 1e-12);
        assert!(fd.eval(-1.0, &[0.0, 0.01, 1.0]) > 0.999);
        assert!(fd.eval(1.0, &[0.0, 0.01, 1.0]).abs() < 1e-12);

        let edge = PrimitiveKind::FermiEdge { temperature_k: 20.0 };
        let p = [0.05, 0.02, 3.0, 0.5];
        assert!((edge.eval(0.05, &p) - 2.0).abs() < 1e-12);
        assert!((edge.eval(-1.0, &p) - 3.5).abs() < 1e-9);
        assert!((edge.eval(1.0, &p) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn edge_width_combines_thermal_and_instrumental() {
        let cold = fermi_edge_sigma(0.02, 0.0);
        assert!((cold - 0.02).abs() < 1e-15);
        assert!(fermi_edge_sigma(0.02, 300.0) > cold);
        assert!(fermi_edge_sigma(0.0, 0.0) > 0.0);
    }
}
