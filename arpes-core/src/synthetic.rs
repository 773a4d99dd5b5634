//! Deterministic synthetic spectra for tests, benchmarks and the CLI.
//!
//! Every generator is a pure function of its arguments; noise is drawn from
//! the RNG hierarchy so the same seed gives the same array.

use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::array::{ArrayError, Axis, LabeledArray};
use crate::models::primitive::PrimitiveKind;
use crate::rng::RngHierarchy;

/// Energy window shared by the generators, eV relative to the Fermi level.
pub const ENERGY_RANGE: (f64, f64) = (-0.3, 0.2);

fn channel_axis(name: &str, n: usize, half_width: f64) -> Axis {
    if n == 1 {
        Axis::new(name, vec![0.0])
    } else {
        Axis::linspace(name, -half_width, half_width, n)
    }
}

fn grid(
    angle: Axis,
    energy: Axis,
    f: impl Fn(usize, f64) -> f64,
) -> Result<LabeledArray, ArrayError> {
    let data = (0..angle.len())
        .flat_map(|c| energy.coords().iter().map(move |&e| (c, e)))
        .map(|(c, e)| f(c, e))
        .collect();
    LabeledArray::new(vec![angle, energy], data)
}

/// Resolution-broadened Fermi steps over `(phi, eV)`, one channel per edge.
///
/// Amplitude 1 above a constant background of 0.05.
pub fn fermi_step(
    edges: &[f64],
    resolution: f64,
    temperature_k: f64,
    n_energy: usize,
) -> Result<LabeledArray, ArrayError> {
    let edge = PrimitiveKind::FermiEdge { temperature_k };
    grid(
        channel_axis("phi", edges.len(), 0.2),
        Axis::linspace("eV", ENERGY_RANGE.0, ENERGY_RANGE.1, n_energy),
        |c, e| edge.eval(e, &[edges[c], resolution, 1.0, 0.05]),
    )
}

/// Gaussian peaks on a linear background over `(phi, eV)`, one channel per
/// center. Parameters follow `gaussian + linear`.
pub fn gaussian_peaks(
    centers: &[f64],
    amplitude: f64,
    sigma: f64,
    background: (f64, f64),
    n_energy: usize,
) -> Result<LabeledArray, ArrayError> {
    let (slope, intercept) = background;
    grid(
        channel_axis("phi", centers.len(), 0.2),
        Axis::linspace("eV", ENERGY_RANGE.0, ENERGY_RANGE.1, n_energy),
        |c, e| {
            PrimitiveKind::Gaussian.eval(e, &[amplitude, centers[c], sigma])
                + PrimitiveKind::Linear.eval(e, &[slope, intercept])
        },
    )
}

/// A parabolic band cut by the Fermi edge, in detector coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandMap {
    pub n_angle: usize,
    pub n_energy: usize,
    /// Half-width of the angle window, radians.
    pub angle_half_width: f64,
    pub photon_energy: f64,
    pub work_function: f64,
    /// Binding energy of the band bottom, eV.
    pub band_bottom: f64,
    /// `ħ²/2m*` in eV Å².
    pub band_curvature: f64,
    /// Lorentzian half-width of the spectral peak, eV.
    pub linewidth: f64,
    pub resolution: f64,
    pub temperature_k: f64,
    /// Per-channel offset of the Fermi level, eV, from `-d` to `d`.
    pub edge_drift: f64,
}

impl Default for BandMap {
    fn default() -> Self {
        Self {
            n_angle: 41,
            n_energy: 201,
            angle_half_width: 0.25,
            photon_energy: 21.2,
            work_function: 4.3,
            band_bottom: -0.25,
            band_curvature: 3.8,
            linewidth: 0.02,
            resolution: 0.01,
            temperature_k: 10.0,
            edge_drift: 0.0,
        }
    }
}

impl BandMap {
    /// Binding energy of the band at parallel momentum `kp`.
    pub fn dispersion(&self, kp: f64) -> f64 {
        self.band_bottom + self.band_curvature * kp * kp
    }

    pub fn generate(&self) -> Result<LabeledArray, ArrayError> {
        let angle = channel_axis("phi", self.n_angle, self.angle_half_width);
        let energy = Axis::linspace("eV", ENERGY_RANGE.0, ENERGY_RANGE.1, self.n_energy);
        let phis = angle.coords().to_vec();
        let n = phis.len().max(2) as f64 - 1.0;
        let edge = PrimitiveKind::FermiEdge {
            temperature_k: self.temperature_k,
        };
        grid(angle, energy, |c, e| {
            let drift = if self.n_angle > 1 {
                self.edge_drift * (2.0 * c as f64 / n - 1.0)
            } else {
                0.0
            };
            let ek = self.photon_energy - self.work_function + e;
            let kp = crate::correction::K_FACTOR * ek.max(0.0).sqrt() * phis[c].sin();
            let peak = PrimitiveKind::Lorentzian.eval(e, &[1.0, self.dispersion(kp), self.linewidth]);
            // Occupied states only, plus a weak incoherent background.
            (peak + 0.1) * edge.eval(e - drift, &[0.0, self.resolution, 1.0, 0.0])
        })
    }
}

/// Add Gaussian noise of standard deviation `sigma`. Non-positive or
/// non-finite `sigma` leaves the array unchanged.
pub fn add_noise(array: &LabeledArray, sigma: f64, seed: u64) -> LabeledArray {
    let Ok(normal) = Normal::new(0.0, sigma) else {
        return array.clone();
    };
    if !(sigma > 0.0) {
        return array.clone();
    }
    let mut rng = RngHierarchy::new(seed).rng_for("noise", 0);
    let data: Vec<f64> = array
        .values()
        .iter()
        .map(|v| v + normal.sample(&mut rng))
        .collect();
    array
        .transform(array.axes().to_vec(), |_| data)
        .unwrap_or_else(|_| array.clone())
}
