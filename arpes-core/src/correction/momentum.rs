//! Angle-to-momentum conversion.
//!
//! With binding energy `E` (0 at the Fermi level), kinetic energy is
//! `Ek = hν - Φ + E` and
//!
//! ```text
//! k∥ = K √Ek sin φ
//! k⊥ = K √(Ek cos²φ + V0)
//! ```
//!
//! with `K = √(2 mₑ) / ħ` in Å⁻¹ eV^-½. The output is built by pulling every
//! target grid point back to detector coordinates and interpolating there, so
//! the regular momentum grid never has holes. Targets with no physical
//! pre-image (`Ek ≤ 0` or `|sin φ| > 1`) are masked as NaN and counted.
//!
//! When the array carries a photon-energy axis, the `(hν, φ)` plane is
//! converted to a regular `(kz, kp)` grid by bilinear sampling instead.
//!
//! With a polar axis θ the `(φ, θ)` plane maps to in-plane momenta
//!
//! ```text
//! kx = K √Ek sin φ
//! ky = K √Ek cos φ sin θ
//! ```
//!
//! and is pulled back the same way.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::array::{resample, unravel, ArrayError, Axis, Interpolation, LabeledArray};
use crate::provenance::{ParamValue, Params};

use super::{
    interpolation_param, optional_param, Corrected, CorrectionError, GeometryError,
    InstrumentMetadata,
};

/// `√(2 mₑ) / ħ` in Å⁻¹ eV^-½.
pub const K_FACTOR: f64 = 0.512_316_721_953_432_8;

/// Inner potential assumed for kz conversion when none is configured, eV.
pub const DEFAULT_INNER_POTENTIAL: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AngleToKSpec {
    pub angle_axis: String,
    pub energy_axis: String,
    /// Convert `(hν, φ)` to `(kz, kp)` along this axis.
    pub photon_energy_axis: Option<String>,
    pub photon_energy: Option<f64>,
    pub work_function: Option<f64>,
    pub inner_potential: Option<f64>,
    /// Angle coordinates are in degrees rather than radians.
    pub degrees: bool,
    /// Added to every angle coordinate before conversion, in axis units.
    pub angle_offset: f64,
    /// Size of the output kp grid; defaults to the angle axis length.
    pub k_points: Option<usize>,
    /// Size of the output kz grid; defaults to the photon-energy axis length.
    pub kz_points: Option<usize>,
    /// Convert `(φ, θ)` to `(kx, ky)` with θ along this axis.
    pub polar_axis: Option<String>,
    /// Added to every polar coordinate before conversion, in axis units.
    pub polar_offset: f64,
    /// Size of the output ky grid; defaults to the polar axis length.
    pub ky_points: Option<usize>,
    /// Angle resampling in kp mode. kz mode always samples bilinearly.
    pub interpolation: Interpolation,
}

impl Default for AngleToKSpec {
    fn default() -> Self {
        Self {
            angle_axis: "phi".to_string(),
            energy_axis: "eV".to_string(),
            photon_energy_axis: None,
            photon_energy: None,
            work_function: None,
            inner_potential: None,
            degrees: false,
            angle_offset: 0.0,
            k_points: None,
            kz_points: None,
            polar_axis: None,
            polar_offset: 0.0,
            ky_points: None,
            interpolation: Interpolation::Linear,
        }
    }
}

/// Geometry with metadata fallbacks applied.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Geometry {
    /// `None` in kz mode, where hν comes from the array.
    photon_energy: Option<f64>,
    work_function: f64,
    inner_potential: f64,
}

impl AngleToKSpec {
    fn geometry(&self, metadata: &InstrumentMetadata) -> Result<Geometry, CorrectionError> {
        let photon_energy = match self.photon_energy_axis {
            Some(_) => None,
            None => Some(
                self.photon_energy
                    .or(metadata.photon_energy)
                    .ok_or(CorrectionError::missing_geometry("photon_energy"))?,
            ),
        };
        let work_function = self
            .work_function
            .or(metadata.work_function)
            .ok_or(CorrectionError::missing_geometry("work_function"))?;
        let inner_potential = self
            .inner_potential
            .or(metadata.inner_potential)
            .unwrap_or(DEFAULT_INNER_POTENTIAL);
        for (name, v) in [
            ("work_function", Some(work_function)),
            ("photon_energy", photon_energy),
            ("inner_potential", Some(inner_potential)),
        ] {
            if v.is_some_and(|v| !v.is_finite()) {
                return Err(CorrectionError::InvalidParameter(format!("{name} is not finite")));
            }
        }
        Ok(Geometry {
            photon_energy,
            work_function,
            inner_potential,
        })
    }

    pub(crate) fn params(&self, metadata: &InstrumentMetadata) -> Result<Params, CorrectionError> {
        let g = self.geometry(metadata)?;
        let mut p = Params::new();
        p.insert("angle_axis".into(), self.angle_axis.as_str().into());
        p.insert("energy_axis".into(), self.energy_axis.as_str().into());
        p.insert("work_function".into(), g.work_function.into());
        optional_param(&mut p, "photon_energy", g.photon_energy);
        if let Some(axis) = &self.photon_energy_axis {
            p.insert("photon_energy_axis".into(), axis.as_str().into());
            p.insert("inner_potential".into(), g.inner_potential.into());
            if let Some(n) = self.kz_points {
                p.insert("kz_points".into(), ParamValue::from(n));
            }
        }
        if let Some(axis) = &self.polar_axis {
            p.insert("polar_axis".into(), axis.as_str().into());
            p.insert("polar_offset".into(), self.polar_offset.into());
            if let Some(n) = self.ky_points {
                p.insert("ky_points".into(), ParamValue::from(n));
            }
        }
        p.insert("degrees".into(), self.degrees.into());
        p.insert("angle_offset".into(), self.angle_offset.into());
        if let Some(n) = self.k_points {
            p.insert("k_points".into(), ParamValue::from(n));
        }
        p.insert("interpolation".into(), interpolation_param(self.interpolation));
        Ok(p)
    }

    fn angle_scale(&self) -> f64 {
        if self.degrees {
            std::f64::consts::PI / 180.0
        } else {
            1.0
        }
    }

    fn to_radians(&self, coord: f64) -> f64 {
        (coord + self.angle_offset) * self.angle_scale()
    }

    fn from_radians(&self, phi: f64) -> f64 {
        phi / self.angle_scale() - self.angle_offset
    }

    fn polar_to_radians(&self, coord: f64) -> f64 {
        (coord + self.polar_offset) * self.angle_scale()
    }

    fn polar_from_radians(&self, theta: f64) -> f64 {
        theta / self.angle_scale() - self.polar_offset
    }
}

// ─── Closed-form relations ───────────────────────────────────────────

pub fn kinetic_energy(photon_energy: f64, work_function: f64, binding_energy: f64) -> f64 {
    photon_energy - work_function + binding_energy
}

/// `(k∥, k⊥)` of an electron, or `None` for a negative radicand.
pub fn forward(kinetic_energy: f64, phi: f64, inner_potential: f64) -> Option<(f64, f64)> {
    if kinetic_energy < 0.0 {
        return None;
    }
    let cos = phi.cos();
    let radicand = kinetic_energy * cos * cos + inner_potential;
    if radicand < 0.0 {
        return None;
    }
    Some((
        K_FACTOR * kinetic_energy.sqrt() * phi.sin(),
        K_FACTOR * radicand.sqrt(),
    ))
}

/// `(Ek, φ)` of a momentum pair, or `None` without a physical pre-image.
pub fn inverse(kp: f64, kz: f64, inner_potential: f64) -> Option<(f64, f64)> {
    let ek = (kp * kp + kz * kz) / (K_FACTOR * K_FACTOR) - inner_potential;
    Some((ek, angle_from_kp(ek, kp)?))
}

/// Emission angle reaching `kp` at kinetic energy `ek`.
pub fn angle_from_kp(ek: f64, kp: f64) -> Option<f64> {
    if !(ek > 0.0) {
        return None;
    }
    let s = kp / (K_FACTOR * ek.sqrt());
    (s.abs() <= 1.0).then(|| s.asin())
}

/// `(kx, ky)` for emission angle `phi` and polar angle `theta`.
pub fn forward_in_plane(kinetic_energy: f64, phi: f64, theta: f64) -> Option<(f64, f64)> {
    if kinetic_energy < 0.0 {
        return None;
    }
    let k = K_FACTOR * kinetic_energy.sqrt();
    Some((k * phi.sin(), k * phi.cos() * theta.sin()))
}

/// `(φ, θ)` reaching `(kx, ky)` at kinetic energy `ek`, both within ±π/2.
pub fn angles_from_in_plane(ek: f64, kx: f64, ky: f64) -> Option<(f64, f64)> {
    let phi = angle_from_kp(ek, kx)?;
    let radial = K_FACTOR * ek.sqrt() * phi.cos();
    if radial == 0.0 {
        return (ky == 0.0).then_some((phi, 0.0));
    }
    let s = ky / radial;
    (s.abs() <= 1.0).then(|| (phi, s.asin()))
}

// ─── Conversion ──────────────────────────────────────────────────────

pub(crate) fn convert(
    array: &LabeledArray,
    spec: &AngleToKSpec,
    metadata: &InstrumentMetadata,
) -> Result<Corrected, CorrectionError> {
    let geometry = spec.geometry(metadata)?;
    let ka = array.axis_index(&spec.angle_axis)?;
    let ke = array.axis_index(&spec.energy_axis)?;
    if ka == ke {
        return Err(CorrectionError::InvalidParameter(
            "angle and energy axes must differ".into(),
        ));
    }
    if !array.axes()[ka].is_strictly_monotonic() {
        return Err(ArrayError::NonMonotonicAxis(spec.angle_axis.clone()).into());
    }

    let corrected = match (&spec.photon_energy_axis, &spec.polar_axis) {
        (Some(_), Some(_)) => {
            return Err(CorrectionError::InvalidParameter(
                "photon-energy and polar axes cannot be converted together".into(),
            ))
        }
        (None, None) => convert_kp(array, spec, geometry, ka, ke)?,
        (None, Some(name)) => {
            let kt = array.axis_index(name)?;
            if kt == ka || kt == ke {
                return Err(CorrectionError::InvalidParameter(
                    "polar axis must differ from angle and energy axes".into(),
                ));
            }
            if !array.axes()[kt].is_strictly_monotonic() {
                return Err(ArrayError::NonMonotonicAxis(name.clone()).into());
            }
            convert_in_plane(array, spec, geometry, ka, ke, kt)?
        }
        (Some(name), None) => {
            let kh = array.axis_index(name)?;
            if kh == ka || kh == ke {
                return Err(CorrectionError::InvalidParameter(
                    "photon-energy axis must differ from angle and energy axes".into(),
                ));
            }
            if !array.axes()[kh].is_strictly_monotonic() {
                return Err(ArrayError::NonMonotonicAxis(name.clone()).into());
            }
            convert_kz(array, spec, geometry, ka, ke, kh)?
        }
    };

    if corrected.masked_samples > 0 {
        warn!(
            masked = corrected.masked_samples,
            total = corrected.array.len(),
            "momentum samples without physical pre-image masked"
        );
    }
    Ok(corrected)
}

fn grid_size(requested: Option<usize>, fallback: usize, what: &str) -> Result<usize, CorrectionError> {
    let n = requested.unwrap_or(fallback);
    if n < 2 {
        return Err(CorrectionError::InvalidParameter(format!(
            "{what} grid needs at least 2 points, got {n}"
        )));
    }
    Ok(n)
}

fn angle_extremes(spec: &AngleToKSpec, coords: &[f64]) -> (f64, f64) {
    extremes(coords.iter().map(|&c| spec.to_radians(c)))
}

fn extremes(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p), hi.max(p)))
}

fn widen(range: Option<(f64, f64)>, v: f64) -> Option<(f64, f64)> {
    let (lo, hi) = range.unwrap_or((v, v));
    Some((lo.min(v), hi.max(v)))
}

fn convert_kp(
    array: &LabeledArray,
    spec: &AngleToKSpec,
    g: Geometry,
    ka: usize,
    ke: usize,
) -> Result<Corrected, CorrectionError> {
    let hv = g
        .photon_energy
        .ok_or(CorrectionError::missing_geometry("photon_energy"))?;
    let angles = array.axes()[ka].coords();
    let energies = array.axes()[ke].coords();
    let (phi_lo, phi_hi) = angle_extremes(spec, angles);

    // Forward image of the detector window.
    let mut k_range: Option<(f64, f64)> = None;
    for &e in energies {
        let ek = kinetic_energy(hv, g.work_function, e);
        for phi in [phi_lo, phi_hi] {
            if let Some((kp, _)) = forward(ek, phi, 0.0) {
                let (lo, hi) = k_range.unwrap_or((kp, kp));
                k_range = Some((lo.min(kp), hi.max(kp)));
            }
        }
    }
    let (k_lo, k_hi) = k_range.ok_or_else(|| {
        CorrectionError::InvalidGeometry(GeometryError::NonPhysical(format!(
            "no sample has positive kinetic energy (hν = {hv}, Φ = {})",
            g.work_function
        )))
    })?;
    let n_k = grid_size(spec.k_points, angles.len(), "kp")?;
    let kp_axis = Axis::linspace("kp", k_lo, k_hi, n_k);

    let others = array.axes_without(ka);
    let others_shape: Vec<usize> = others.iter().map(Axis::len).collect();
    let ke_other = if ke > ka { ke - 1 } else { ke };

    let mut masked = 0;
    let lanes: Vec<Vec<f64>> = array
        .lanes(ka)
        .iter()
        .enumerate()
        .map(|(l, lane)| {
            let e = energies[unravel(&others_shape, l)[ke_other]];
            let ek = kinetic_energy(hv, g.work_function, e);
            let targets: Vec<f64> = kp_axis
                .coords()
                .iter()
                .map(|&kp| match angle_from_kp(ek, kp) {
                    Some(phi) => spec.from_radians(phi),
                    None => {
                        masked += 1;
                        f64::NAN
                    }
                })
                .collect();
            resample(angles, lane, &targets, spec.interpolation)
        })
        .collect();

    let out = LabeledArray::from_lanes(others, ka, kp_axis, &lanes)?;
    debug!(k_lo, k_hi, n_k, masked, "converted angle to kp");

    let mut outputs = Params::new();
    outputs.insert("kp_range".into(), vec![k_lo, k_hi].into());
    outputs.insert("masked_samples".into(), ParamValue::from(masked));
    Ok(Corrected {
        array: out,
        outputs,
        failed_channels: Vec::new(),
        masked_samples: masked,
    })
}

fn convert_kz(
    array: &LabeledArray,
    spec: &AngleToKSpec,
    g: Geometry,
    ka: usize,
    ke: usize,
    kh: usize,
) -> Result<Corrected, CorrectionError> {
    let angles = array.axes()[ka].coords();
    let energies = array.axes()[ke].coords();
    let photon = array.axes()[kh].coords();
    let (phi_lo, phi_hi) = angle_extremes(spec, angles);
    let mut phis = vec![phi_lo, phi_hi];
    if phi_lo < 0.0 && phi_hi > 0.0 {
        phis.push(0.0);
    }

    let mut kp_range: Option<(f64, f64)> = None;
    let mut kz_range: Option<(f64, f64)> = None;
    for &hv in photon {
        for &e in energies {
            let ek = kinetic_energy(hv, g.work_function, e);
            for &phi in &phis {
                if let Some((kp, kz)) = forward(ek, phi, g.inner_potential) {
                    kp_range = widen(kp_range, kp);
                    kz_range = widen(kz_range, kz);
                }
            }
        }
    }
    let (Some((kp_lo, kp_hi)), Some((kz_lo, kz_hi))) = (kp_range, kz_range) else {
        return Err(CorrectionError::InvalidGeometry(GeometryError::NonPhysical(format!(
            "no sample has positive kinetic energy (Φ = {})",
            g.work_function
        ))));
    };
    let kp_axis = Axis::linspace("kp", kp_lo, kp_hi, grid_size(spec.k_points, angles.len(), "kp")?);
    let kz_axis = Axis::linspace(
        "kz",
        kz_lo,
        kz_hi,
        grid_size(spec.kz_points, photon.len(), "kz")?,
    );

    let mut axes = array.axes().to_vec();
    axes[ka] = kp_axis.clone();
    axes[kh] = kz_axis.clone();
    let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
    let total: usize = shape.iter().product();

    let mut masked = 0;
    let data: Vec<f64> = (0..total)
        .map(|i| {
            let index = unravel(&shape, i);
            let kp = kp_axis.coords()[index[ka]];
            let kz = kz_axis.coords()[index[kh]];
            let e = energies[index[ke]];
            match inverse(kp, kz, g.inner_potential) {
                Some((ek, phi)) => {
                    let hv = ek + g.work_function - e;
                    array.sample_bilinear(kh, ka, hv, spec.from_radians(phi), &index)
                }
                None => {
                    masked += 1;
                    f64::NAN
                }
            }
        })
        .collect();

    let out = LabeledArray::new(axes, data)?;
    debug!(kp_lo, kp_hi, kz_lo, kz_hi, masked, "converted (hν, angle) to (kz, kp)");

    let mut outputs = Params::new();
    outputs.insert("kp_range".into(), vec![kp_lo, kp_hi].into());
    outputs.insert("kz_range".into(), vec![kz_lo, kz_hi].into());
    outputs.insert("masked_samples".into(), ParamValue::from(masked));
    Ok(Corrected {
        array: out,
        outputs,
        failed_channels: Vec::new(),
        masked_samples: masked,
    })
}

fn convert_in_plane(
    array: &LabeledArray,
    spec: &AngleToKSpec,
    g: Geometry,
    ka: usize,
    ke: usize,
    kt: usize,
) -> Result<Corrected, CorrectionError> {
    let hv = g
        .photon_energy
        .ok_or(CorrectionError::missing_geometry("photon_energy"))?;
    let angles = array.axes()[ka].coords();
    let polars = array.axes()[kt].coords();
    let energies = array.axes()[ke].coords();
    let (phi_lo, phi_hi) = angle_extremes(spec, angles);
    let (theta_lo, theta_hi) = extremes(polars.iter().map(|&c| spec.polar_to_radians(c)));
    // |ky| peaks where cos φ does.
    let mut phis = vec![phi_lo, phi_hi];
    if phi_lo < 0.0 && phi_hi > 0.0 {
        phis.push(0.0);
    }

    let mut kx_range: Option<(f64, f64)> = None;
    let mut ky_range: Option<(f64, f64)> = None;
    for &e in energies {
        let ek = kinetic_energy(hv, g.work_function, e);
        for &phi in &phis {
            for theta in [theta_lo, theta_hi] {
                if let Some((kx, ky)) = forward_in_plane(ek, phi, theta) {
                    kx_range = widen(kx_range, kx);
                    ky_range = widen(ky_range, ky);
                }
            }
        }
    }
    let (Some((kx_lo, kx_hi)), Some((ky_lo, ky_hi))) = (kx_range, ky_range) else {
        return Err(CorrectionError::InvalidGeometry(GeometryError::NonPhysical(format!(
            "no sample has positive kinetic energy (hν = {hv}, Φ = {})",
            g.work_function
        ))));
    };
    let kx_axis = Axis::linspace("kx", kx_lo, kx_hi, grid_size(spec.k_points, angles.len(), "kx")?);
    let ky_axis = Axis::linspace("ky", ky_lo, ky_hi, grid_size(spec.ky_points, polars.len(), "ky")?);

    let mut axes = array.axes().to_vec();
    axes[ka] = kx_axis.clone();
    axes[kt] = ky_axis.clone();
    let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
    let total: usize = shape.iter().product();

    let mut masked = 0;
    let data: Vec<f64> = (0..total)
        .map(|i| {
            let index = unravel(&shape, i);
            let kx = kx_axis.coords()[index[ka]];
            let ky = ky_axis.coords()[index[kt]];
            let ek = kinetic_energy(hv, g.work_function, energies[index[ke]]);
            match angles_from_in_plane(ek, kx, ky) {
                Some((phi, theta)) => array.sample_bilinear(
                    ka,
                    kt,
                    spec.from_radians(phi),
                    spec.polar_from_radians(theta),
                    &index,
                ),
                None => {
                    masked += 1;
                    f64::NAN
                }
            }
        })
        .collect();

    let out = LabeledArray::new(axes, data)?;
    debug!(kx_lo, kx_hi, ky_lo, ky_hi, masked, "converted (angle, polar) to (kx, ky)");

    let mut outputs = Params::new();
    outputs.insert("kx_range".into(), vec![kx_lo, kx_hi].into());
    outputs.insert("ky_range".into(), vec![ky_lo, ky_hi].into());
    outputs.insert("masked_samples".into(), ParamValue::from(masked));
    Ok(Corrected {
        array: out,
        outputs,
        failed_channels: Vec::new(),
        masked_samples: masked,
    })
}
