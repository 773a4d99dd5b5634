//! One-dimensional resampling kernels.
//!
//! Two policies are supported:
//! - `Linear`: piecewise linear between neighbours.
//! - `MonotoneCubic`: Fritsch–Carlson piecewise cubic Hermite (PCHIP). It never
//!   overshoots the data, which matters for step-like spectra such as a Fermi
//!   edge.
//!
//! Targets outside the source span evaluate to NaN. Source coordinates must be
//! strictly monotonic; decreasing axes are handled by reversing internally.

use serde::{Deserialize, Serialize};

/// Interpolation policy used when resampling an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    #[default]
    Linear,
    MonotoneCubic,
}

/// Direction of a strictly monotonic coordinate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonic {
    Increasing,
    Decreasing,
}

/// Direction of `coords` if it is strictly monotonic and finite.
///
/// Zero- and one-element sequences count as increasing.
pub fn monotonic_direction(coords: &[f64]) -> Option<Monotonic> {
    if coords.iter().any(|c| !c.is_finite()) {
        return None;
    }
    if coords.len() < 2 {
        return Some(Monotonic::Increasing);
    }
    if coords.windows(2).all(|w| w[1] > w[0]) {
        Some(Monotonic::Increasing)
    } else if coords.windows(2).all(|w| w[1] < w[0]) {
        Some(Monotonic::Decreasing)
    } else {
        None
    }
}

/// Locate `x` in an increasing sequence.
///
/// Returns the left segment index and the fractional position inside it.
/// Values within a relative `1e-12` of the span ends snap onto the ends.
pub fn locate(xs: &[f64], x: f64) -> Option<(usize, f64)> {
    let n = xs.len();
    if n == 0 || !x.is_finite() {
        return None;
    }
    let first = xs[0];
    let last = xs[n - 1];
    let tol = 1e-12 * (last - first).abs().max(f64::MIN_POSITIVE);
    if x < first - tol || x > last + tol {
        return None;
    }
    if n == 1 {
        return Some((0, 0.0));
    }
    if x <= first {
        return Some((0, 0.0));
    }
    if x >= last {
        return Some((n - 2, 1.0));
    }
    // Number of coordinates <= x; at least 1 and at most n-1 here.
    let k = xs.partition_point(|&c| c <= x);
    let i = (k - 1).min(n - 2);
    let t = (x - xs[i]) / (xs[i + 1] - xs[i]);
    Some((i, t))
}

/// Resample `ys` (defined on strictly monotonic `xs`) at `targets`.
///
/// Lanes containing non-finite values fall back to linear interpolation so a
/// single masked sample cannot poison cubic slopes across the lane.
pub fn resample(xs: &[f64], ys: &[f64], targets: &[f64], method: Interpolation) -> Vec<f64> {
    debug_assert_eq!(xs.len(), ys.len());
    if xs.is_empty() {
        return vec![f64::NAN; targets.len()];
    }

    // Work on an increasing copy.
    let (xs, ys): (Vec<f64>, Vec<f64>) = match monotonic_direction(xs) {
        Some(Monotonic::Decreasing) => (
            xs.iter().rev().copied().collect(),
            ys.iter().rev().copied().collect(),
        ),
        _ => (xs.to_vec(), ys.to_vec()),
    };

    let method = if ys.iter().all(|y| y.is_finite()) {
        method
    } else {
        Interpolation::Linear
    };

    match method {
        Interpolation::Linear => targets.iter().map(|&x| linear_at(&xs, &ys, x)).collect(),
        Interpolation::MonotoneCubic => {
            let slopes = pchip_slopes(&xs, &ys);
            targets
                .iter()
                .map(|&x| hermite_at(&xs, &ys, &slopes, x))
                .collect()
        }
    }
}

fn linear_at(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let Some((i, t)) = locate(xs, x) else {
        return f64::NAN;
    };
    if xs.len() == 1 || t == 0.0 {
        return ys[i];
    }
    if t == 1.0 {
        return ys[i + 1];
    }
    ys[i] + t * (ys[i + 1] - ys[i])
}

fn hermite_at(xs: &[f64], ys: &[f64], d: &[f64], x: f64) -> f64 {
    let Some((i, t)) = locate(xs, x) else {
        return f64::NAN;
    };
    if xs.len() == 1 || t == 0.0 {
        return ys[i];
    }
    if t == 1.0 {
        return ys[i + 1];
    }
    let h = xs[i + 1] - xs[i];
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * ys[i] + h10 * h * d[i] + h01 * ys[i + 1] + h11 * h * d[i + 1]
}

/// Fritsch–Carlson derivative estimates.
fn pchip_slopes(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / h[i]).collect();

    if n == 2 {
        return vec![delta[0], delta[0]];
    }

    let mut d = vec![0.0; n];
    for i in 1..n - 1 {
        let (d0, d1) = (delta[i - 1], delta[i]);
        if d0 * d1 <= 0.0 {
            d[i] = 0.0;
        } else {
            let w1 = 2.0 * h[i] + h[i - 1];
            let w2 = h[i] + 2.0 * h[i - 1];
            d[i] = (w1 + w2) / (w1 / d0 + w2 / d1);
        }
    }
    d[0] = end_slope(h[0], h[1], delta[0], delta[1]);
    d[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    d
}

/// Shape-preserving three-point end slope.
fn end_slope(h0: f64, h1: f64, d0: f64, d1: f64) -> f64 {
    let s = ((2.0 * h0 + h1) * d0 - h0 * d1) / (h0 + h1);
    if s.signum() != d0.signum() || d0 == 0.0 {
        0.0
    } else if d0.signum() != d1.signum() && s.abs() > 3.0 * d0.abs() {
        3.0 * d0
    } else {
        s
    }
}
