use serde::{Deserialize, Serialize};

use super::interp::{locate, monotonic_direction, Monotonic};

/// A named, ordered coordinate sequence describing one array dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    name: String,
    coords: Vec<f64>,
}

impl Axis {
    pub fn new(name: impl Into<String>, coords: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            coords,
        }
    }

    /// `n` evenly spaced coordinates from `start` to `stop` inclusive.
    pub fn linspace(name: impl Into<String>, start: f64, stop: f64, n: usize) -> Self {
        let coords = match n {
            0 => Vec::new(),
            1 => vec![start],
            _ => {
                let step = (stop - start) / (n as f64 - 1.0);
                (0..n)
                    .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                    .collect()
            }
        };
        Self::new(name, coords)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn direction(&self) -> Option<Monotonic> {
        monotonic_direction(&self.coords)
    }

    pub fn is_strictly_monotonic(&self) -> bool {
        self.direction().is_some()
    }

    /// Minimum and maximum finite coordinate.
    pub fn span(&self) -> Option<(f64, f64)> {
        let mut finite = self.coords.iter().copied().filter(|c| c.is_finite());
        let first = finite.next()?;
        Some(finite.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c))))
    }

    /// Index of the coordinate closest to `value`; ties resolve to the lower index.
    pub fn nearest_index(&self, value: f64) -> Option<usize> {
        self.coords
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_finite())
            .min_by(|(ia, a), (ib, b)| {
                (*a - value)
                    .abs()
                    .total_cmp(&(*b - value).abs())
                    .then(ia.cmp(ib))
            })
            .map(|(i, _)| i)
    }

    /// Segment index and fraction of `value`, for either axis direction.
    ///
    /// Assumes the axis is strictly monotonic; only the end points are used to
    /// tell the direction. The fraction runs along increasing index.
    pub fn locate(&self, value: f64) -> Option<(usize, f64)> {
        let n = self.coords.len();
        if n >= 2 && self.coords[n - 1] < self.coords[0] {
            let reversed: Vec<f64> = self.coords.iter().rev().copied().collect();
            let (i, t) = locate(&reversed, value)?;
            // Reversed segment (i, i+1) is original segment (n-2-i, n-1-i).
            return Some((n - 2 - i, 1.0 - t));
        }
        locate(&self.coords, value)
    }

    /// Mean spacing between consecutive coordinates (signed).
    pub fn mean_step(&self) -> Option<f64> {
        if self.coords.len() < 2 {
            return None;
        }
        let n = self.coords.len();
        Some((self.coords[n - 1] - self.coords[0]) / (n as f64 - 1.0))
    }

    pub(crate) fn renamed(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.coords.clone())
    }
}
