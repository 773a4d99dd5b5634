//! Fermi-edge alignment: Detect, then Fit, then Shift.
//!
//! Every lane along the energy axis is one channel.
//!
//! - Detect: inside the window, smooth with a 5-point moving average and take
//!   the steepest descent of the central-difference derivative, refined to
//!   sub-sample precision by the vertex of a parabola through the derivative
//!   minimum and its neighbours.
//! - Fit: refine with a `fermi_edge` fit, bounded to the window. A channel
//!   whose fit does not converge, or whose edge reaches the window boundary,
//!   keeps its detected edge and is reported as failed.
//! - Shift: the output energy axis is the input axis minus the median edge,
//!   and each channel is resampled so its own edge lands on zero.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::array::{resample, ArrayError, Axis, Interpolation, LabeledArray};
use crate::fit::{fit_slice, FitOptions};
use crate::models::Model;
use crate::provenance::{ParamValue, Params};

use super::{interpolation_param, Corrected, CorrectionError, InstrumentMetadata};

/// Temperature assumed when neither the step nor the metadata gives one.
pub const DEFAULT_TEMPERATURE_K: f64 = 10.0;

const MIN_WINDOW_SAMPLES: usize = 5;
const SMOOTHING_HALF_WIDTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FermiEdgeSpec {
    pub energy_axis: String,
    /// Energy range searched for the edge; the whole axis when absent.
    pub window: Option<[f64; 2]>,
    pub temperature_k: Option<f64>,
    /// Starting Gaussian resolution for the edge fit, eV.
    pub resolution: f64,
    /// Skip the Fit state and shift by the detected edges.
    pub detect_only: bool,
    pub interpolation: Interpolation,
}

impl Default for FermiEdgeSpec {
    fn default() -> Self {
        Self {
            energy_axis: "eV".to_string(),
            window: None,
            temperature_k: None,
            resolution: 0.01,
            detect_only: false,
            interpolation: Interpolation::MonotoneCubic,
        }
    }
}

impl FermiEdgeSpec {
    pub fn temperature(&self, metadata: &InstrumentMetadata) -> f64 {
        self.temperature_k
            .or(metadata.temperature_k)
            .unwrap_or(DEFAULT_TEMPERATURE_K)
    }

    pub(crate) fn params(&self, metadata: &InstrumentMetadata) -> Params {
        let mut p = Params::new();
        p.insert("energy_axis".into(), self.energy_axis.as_str().into());
        if let Some(window) = self.window {
            p.insert("window".into(), window.to_vec().into());
        }
        p.insert("temperature_k".into(), self.temperature(metadata).into());
        p.insert("resolution".into(), self.resolution.into());
        p.insert("detect_only".into(), self.detect_only.into());
        p.insert("interpolation".into(), interpolation_param(self.interpolation));
        p
    }
}

/// Approximate edge position of a falling step.
///
/// Returns `None` with fewer than five finite samples or when the smoothed
/// signal never decreases.
pub fn detect_edge(x: &[f64], y: &[f64]) -> Option<f64> {
    let mut points: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    let n = points.len();
    if n < MIN_WINDOW_SAMPLES {
        return None;
    }

    let smooth: Vec<f64> = (0..n)
        .map(|i| {
            let lo = i.saturating_sub(SMOOTHING_HALF_WIDTH);
            let hi = (i + SMOOTHING_HALF_WIDTH).min(n - 1);
            points[lo..=hi].iter().map(|p| p.1).sum::<f64>() / (hi - lo + 1) as f64
        })
        .collect();

    // deriv[j] belongs to point j + 1.
    let deriv: Vec<f64> = (1..n - 1)
        .map(|i| (smooth[i + 1] - smooth[i - 1]) / (points[i + 1].0 - points[i - 1].0))
        .collect();
    let (j, &steepest) = deriv
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    if !(steepest < 0.0) {
        return None;
    }

    let i = j + 1;
    let mut edge = points[i].0;
    if j > 0 && j + 1 < deriv.len() {
        let (a, b, c) = (deriv[j - 1], deriv[j], deriv[j + 1]);
        let curvature = a - 2.0 * b + c;
        if curvature > 0.0 {
            let offset = (0.5 * (a - c) / curvature).clamp(-0.5, 0.5);
            let h = if offset >= 0.0 {
                points[i + 1].0 - points[i].0
            } else {
                points[i].0 - points[i - 1].0
            };
            edge += offset * h;
        }
    }
    Some(edge)
}

/// Fit state for one channel.
fn refine_edge(
    model: &Model,
    x: &[f64],
    y: &[f64],
    detected: f64,
    resolution: f64,
    (lo, hi): (f64, f64),
    channel: usize,
) -> Result<f64, CorrectionError> {
    let finite: Vec<f64> = y.iter().copied().filter(|v| v.is_finite()).collect();
    let head = finite.len().min(MIN_WINDOW_SAMPLES);
    let below = mean(&finite[..head]);
    let above = mean(&finite[finite.len() - head..]);

    let initial = [detected, resolution, below - above, above];
    let bounds = [
        (lo, hi),
        (0.0, f64::INFINITY),
        (f64::NEG_INFINITY, f64::INFINITY),
        (f64::NEG_INFINITY, f64::INFINITY),
    ];
    let fit = fit_slice(model, x, y, &initial, &bounds, &FitOptions::default());
    if !fit.converged {
        return Err(CorrectionError::EdgeFitDiverged {
            channel,
            reason: format!("optimizer stopped with status {}", fit.status.as_str()),
        });
    }
    let center = fit.params[0];
    if !(center > lo && center < hi) {
        return Err(CorrectionError::EdgeFitDiverged {
            channel,
            reason: format!("fitted edge {center} left the window [{lo}, {hi}]"),
        });
    }
    Ok(center)
}

pub(crate) fn align(
    array: &LabeledArray,
    spec: &FermiEdgeSpec,
    metadata: &InstrumentMetadata,
) -> Result<Corrected, CorrectionError> {
    let k = array.axis_index(&spec.energy_axis)?;
    let axis = &array.axes()[k];
    if !axis.is_strictly_monotonic() {
        return Err(ArrayError::NonMonotonicAxis(spec.energy_axis.clone()).into());
    }
    let coords = axis.coords();
    let (lo, hi) = match spec.window {
        Some([a, b]) => (a.min(b), a.max(b)),
        None => axis
            .span()
            .ok_or_else(|| CorrectionError::InvalidParameter("energy axis is empty".into()))?,
    };

    let mut window: Vec<usize> = (0..coords.len())
        .filter(|&i| coords[i] >= lo && coords[i] <= hi)
        .collect();
    window.sort_by(|&a, &b| coords[a].total_cmp(&coords[b]));
    if window.len() < MIN_WINDOW_SAMPLES {
        return Err(CorrectionError::InvalidParameter(format!(
            "window [{lo}, {hi}] holds {} samples, need at least {MIN_WINDOW_SAMPLES}",
            window.len()
        )));
    }
    let xw: Vec<f64> = window.iter().map(|&i| coords[i]).collect();

    let model = Model::fermi_edge(spec.temperature(metadata));
    let lanes = array.lanes(k);
    let mut failed = Vec::new();
    let mut edges: Vec<Option<f64>> = Vec::with_capacity(lanes.len());

    for (channel, lane) in lanes.iter().enumerate() {
        let yw: Vec<f64> = window.iter().map(|&i| lane[i]).collect();
        let edge = match detect_edge(&xw, &yw) {
            None => {
                warn!(channel, "no Fermi edge detected");
                failed.push(channel);
                None
            }
            Some(detected) if spec.detect_only => Some(detected),
            Some(detected) => {
                match refine_edge(&model, &xw, &yw, detected, spec.resolution, (lo, hi), channel) {
                    Ok(fitted) => Some(fitted),
                    Err(err) => {
                        warn!(%err, detected, "falling back to detected edge");
                        failed.push(channel);
                        Some(detected)
                    }
                }
            }
        };
        edges.push(edge);
    }

    let found: Vec<f64> = edges.iter().flatten().copied().collect();
    if found.is_empty() {
        return Err(CorrectionError::EdgeNotFound);
    }
    let reference = median(found);
    let applied: Vec<f64> = edges.iter().map(|e| e.unwrap_or(reference)).collect();

    let new_coords: Vec<f64> = coords.iter().map(|c| c - reference).collect();
    let shifted: Vec<Vec<f64>> = lanes
        .iter()
        .zip(&applied)
        .map(|(lane, edge)| {
            let targets: Vec<f64> = new_coords.iter().map(|c| c + edge).collect();
            resample(coords, lane, &targets, spec.interpolation)
        })
        .collect();
    let out = LabeledArray::from_lanes(
        array.axes_without(k),
        k,
        Axis::new(axis.name(), new_coords),
        &shifted,
    )?;

    debug!(
        channels = lanes.len(),
        reference_edge = reference,
        fallbacks = failed.len(),
        "Fermi edge aligned"
    );

    let mut outputs = Params::new();
    outputs.insert(
        "edges".into(),
        edges.iter().map(|e| e.unwrap_or(f64::NAN)).collect::<Vec<_>>().into(),
    );
    outputs.insert(
        "shifts".into(),
        applied.iter().map(|e| e - reference).collect::<Vec<_>>().into(),
    );
    outputs.insert("reference_edge".into(), reference.into());
    outputs.insert("fallback_channels".into(), ParamValue::from(failed.len()));

    Ok(Corrected {
        array: out,
        outputs,
        failed_channels: failed,
        masked_samples: 0,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::fermi_step;

    #[test]
    fn detects_a_sharp_step_between_samples() {
        let x: Vec<f64> = (0..21).map(|i| -0.1 + 0.01 * i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| if v < 0.025 { 1.0 } else { 0.0 }).collect();
        let edge = detect_edge(&x, &y).unwrap();
        assert!((edge - 0.025).abs() <= 0.01, "{edge}");
    }

    #[test]
    fn detection_needs_a_falling_signal() {
        let x: Vec<f64> = (0..10).map(f64::from).collect();
        assert_eq!(detect_edge(&x, &x), None);
        assert_eq!(detect_edge(&x[..4], &x[..4]), None);
    }

    #[test]
    fn aligns_channels_with_different_edges() {
        let array = fermi_step(&[-0.01, 0.0, 0.02], 0.02, 10.0, 301).unwrap();
        let spec = FermiEdgeSpec::default();
        let out = align(&array, &spec, &InstrumentMetadata::default()).unwrap();
        assert!(out.failed_channels.is_empty());

        let edges = out.outputs["edges"].as_numbers().unwrap();
        for (got, want) in edges.iter().zip([-0.01, 0.0, 0.02]) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
        assert!((out.outputs["reference_edge"].as_number().unwrap()).abs() < 1e-4);

        // Every shifted channel now has its edge at zero.
        let k = out.array.axis_index("eV").unwrap();
        let x = out.array.coords("eV").unwrap().to_vec();
        for lane in out.array.lanes(k) {
            let e = detect_edge(&x, &lane).unwrap();
            assert!(e.abs() < 0.003, "{e}");
        }
    }

    #[test]
    fn bad_window_is_rejected() {
        let array = fermi_step(&[0.0], 0.02, 10.0, 101).unwrap();
        let spec = FermiEdgeSpec {
            window: Some([0.5, 0.6]),
            ..FermiEdgeSpec::default()
        };
        let err = align(&array, &spec, &InstrumentMetadata::default()).unwrap_err();
        assert!(matches!(err, CorrectionError::InvalidParameter(_)));
    }

    #[test]
    fn flat_channel_falls_back_without_aborting() {
        let step = fermi_step(&[0.0, 0.0], 0.02, 10.0, 201).unwrap();
        let k = step.axis_index("eV").unwrap();
        let mut lanes = step.lanes(k);
        lanes[1] = vec![1.0; lanes[1].len()];
        let array =
            LabeledArray::from_lanes(step.axes_without(k), k, step.axes()[k].clone(), &lanes)
                .unwrap();
        let out = align(&array, &FermiEdgeSpec::default(), &InstrumentMetadata::default()).unwrap();
        assert_eq!(out.failed_channels, vec![1]);
        assert!(out.outputs["edges"].as_numbers().unwrap()[1].is_nan());
    }

    #[test]
    fn median_handles_even_counts() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), 2.5);
    }
}
