//! Labeled n-dimensional arrays.
//!
//! - `Axis`: a named coordinate sequence.
//! - `LabeledArray<T>`: row-major data plus one `Axis` per dimension.
//! - `interp`: linear and monotone-cubic resampling kernels.
//!
//! Arrays are immutable values. Every operation returns a new array and never
//! attaches provenance; callers that need an audit trail record it themselves.

pub mod axis;
pub mod interp;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorClass;

pub use axis::Axis;
pub use interp::{locate, monotonic_direction, resample, Interpolation, Monotonic};

// ─── Errors ──────────────────────────────────────────────────────────

/// Errors from array construction and axis operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArrayError {
    #[error("axis '{0}' not found")]
    AxisNotFound(String),
    #[error("duplicate axis name '{0}'")]
    DuplicateAxis(String),
    #[error("data length {data} does not match axis shape {shape:?} ({expected} elements)")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        data: usize,
    },
    #[error("selection {requested} lies outside axis '{axis}' span [{min}, {max}]")]
    OutOfRange {
        axis: String,
        requested: String,
        min: f64,
        max: f64,
    },
    #[error("axis '{0}' is not strictly monotonic")]
    NonMonotonicAxis(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl ArrayError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

// ─── Selection ───────────────────────────────────────────────────────

/// What to keep along an axis in `LabeledArray::select`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    /// Nearest coordinate; the axis is dropped from the result.
    Value(f64),
    /// Every coordinate inside the closed interval; the axis is kept.
    Range(f64, f64),
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Value(v) => write!(f, "{v}"),
            Selection::Range(lo, hi) => write!(f, "[{lo}, {hi}]"),
        }
    }
}

/// Multi-index of a row-major flat index into an array of `shape`.
pub fn unravel(shape: &[usize], mut flat: usize) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for (slot, &n) in index.iter_mut().zip(shape).rev() {
        let n = n.max(1);
        *slot = flat % n;
        flat /= n;
    }
    index
}

// ─── Lane layout ─────────────────────────────────────────────────────

/// Index arithmetic for the 1-D lanes running along one axis.
///
/// Lanes are numbered in lexicographic order of the remaining axes, which is
/// also the row-major order of the array obtained by dropping the axis.
#[derive(Debug, Clone, Copy)]
pub struct LaneLayout {
    len: usize,
    stride: usize,
    count: usize,
}

impl LaneLayout {
    fn new(shape: &[usize], axis: usize) -> Self {
        let len = shape[axis];
        let stride: usize = shape[axis + 1..].iter().product();
        let total: usize = shape.iter().product();
        let count = if len == 0 { 0 } else { total / len };
        Self { len, stride, count }
    }

    /// Number of lanes.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Length of each lane.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flat data offset of element `j` of lane `lane`.
    pub fn offset(&self, lane: usize, j: usize) -> usize {
        let hi = lane / self.stride;
        let lo = lane % self.stride;
        hi * self.len * self.stride + j * self.stride + lo
    }
}

// ─── LabeledArray ────────────────────────────────────────────────────

/// An n-dimensional array with named, ordered coordinate axes.
///
/// Invariants (checked on construction and deserialization):
/// - one `Axis` per dimension, names unique;
/// - `data.len()` equals the product of axis lengths (1 for a 0-d array).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "ArrayParts<T>",
    bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>")
)]
pub struct LabeledArray<T = f64> {
    axes: Vec<Axis>,
    data: Vec<T>,
}

/// Unvalidated wire form of a `LabeledArray`.
#[derive(Deserialize)]
struct ArrayParts<T> {
    axes: Vec<Axis>,
    data: Vec<T>,
}

impl<T> TryFrom<ArrayParts<T>> for LabeledArray<T> {
    type Error = ArrayError;

    fn try_from(parts: ArrayParts<T>) -> Result<Self, Self::Error> {
        LabeledArray::new(parts.axes, parts.data)
    }
}

impl<T> LabeledArray<T> {
    pub fn new(axes: Vec<Axis>, data: Vec<T>) -> Result<Self, ArrayError> {
        let mut seen = HashSet::new();
        for axis in &axes {
            if !seen.insert(axis.name()) {
                return Err(ArrayError::DuplicateAxis(axis.name().to_string()));
            }
        }
        let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ArrayError::ShapeMismatch {
                shape,
                expected,
                data: data.len(),
            });
        }
        Ok(Self { axes, data })
    }

    /// A 0-d array holding one value.
    pub fn scalar(value: T) -> Self {
        Self {
            axes: Vec::new(),
            data: vec![value],
        }
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn values(&self) -> &[T] {
        &self.data
    }

    pub fn into_values(self) -> Vec<T> {
        self.data
    }

    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(Axis::len).collect()
    }

    pub fn dims(&self) -> Vec<&str> {
        self.axes.iter().map(Axis::name).collect()
    }

    pub fn has_axis(&self, name: &str) -> bool {
        self.axes.iter().any(|a| a.name() == name)
    }

    pub fn axis_index(&self, name: &str) -> Result<usize, ArrayError> {
        self.axes
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| ArrayError::AxisNotFound(name.to_string()))
    }

    pub fn axis(&self, name: &str) -> Result<&Axis, ArrayError> {
        Ok(&self.axes[self.axis_index(name)?])
    }

    pub fn coords(&self, name: &str) -> Result<&[f64], ArrayError> {
        Ok(self.axis(name)?.coords())
    }

    /// Row-major flat index of a multi-index, or `None` if out of bounds.
    pub fn flat_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.axes.len() {
            return None;
        }
        let mut flat = 0;
        for (axis, &i) in self.axes.iter().zip(index) {
            if i >= axis.len() {
                return None;
            }
            flat = flat * axis.len() + i;
        }
        Some(flat)
    }

    /// Multi-index of a row-major flat index.
    pub fn unravel(&self, flat: usize) -> Vec<usize> {
        unravel(&self.shape(), flat)
    }

    pub fn get(&self, index: &[usize]) -> Option<&T> {
        self.flat_index(index).map(|i| &self.data[i])
    }

    /// Coordinates of every axis at a multi-index.
    pub fn coords_at(&self, index: &[usize]) -> Vec<f64> {
        self.axes
            .iter()
            .zip(index)
            .map(|(axis, &i)| axis.coords().get(i).copied().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn lane_layout(&self, axis: usize) -> LaneLayout {
        LaneLayout::new(&self.shape(), axis)
    }

    /// Axes remaining after dropping `axis`.
    pub fn axes_without(&self, axis: usize) -> Vec<Axis> {
        self.axes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != axis)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Elementwise transform.
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> LabeledArray<U> {
        LabeledArray {
            axes: self.axes.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }

    /// Axis-remapping transform: `f` produces the row-major data for `new_axes`.
    ///
    /// Only the shape is validated; the caller owns the meaning of the mapping.
    pub fn transform<U>(
        &self,
        new_axes: Vec<Axis>,
        f: impl FnOnce(&Self) -> Vec<U>,
    ) -> Result<LabeledArray<U>, ArrayError> {
        let data = f(self);
        LabeledArray::new(new_axes, data)
    }
}

impl<T: Clone> LabeledArray<T> {
    /// Values of lane `lane` along axis `axis`.
    pub fn lane(&self, axis: usize, lane: usize) -> Vec<T> {
        let layout = self.lane_layout(axis);
        (0..layout.len())
            .map(|j| self.data[layout.offset(lane, j)].clone())
            .collect()
    }

    /// All lanes along `axis`, in lexicographic order of the other axes.
    pub fn lanes(&self, axis: usize) -> Vec<Vec<T>> {
        let layout = self.lane_layout(axis);
        (0..layout.count()).map(|l| self.lane(axis, l)).collect()
    }

    /// Rebuild an array from lanes, replacing the axis at position `axis`.
    ///
    /// `others` are the remaining axes in order; `lanes` must be ordered like
    /// `LabeledArray::lanes` and each lane must have `new_axis.len()` values.
    pub fn from_lanes(
        others: Vec<Axis>,
        axis: usize,
        new_axis: Axis,
        lanes: &[Vec<T>],
    ) -> Result<Self, ArrayError> {
        let mut axes = others;
        let position = axis.min(axes.len());
        axes.insert(position, new_axis);
        let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
        let len = shape[position];
        let stride: usize = shape[position + 1..].iter().product();
        let outer: usize = shape[..position].iter().product();
        let expected = outer * len * stride;

        if lanes.len() != outer * stride || lanes.iter().any(|l| l.len() != len) {
            return Err(ArrayError::ShapeMismatch {
                shape,
                expected,
                data: lanes.iter().map(Vec::len).sum(),
            });
        }

        let mut data = Vec::with_capacity(expected);
        for hi in 0..outer {
            for j in 0..len {
                for lo in 0..stride {
                    data.push(lanes[hi * stride + lo][j].clone());
                }
            }
        }
        LabeledArray::new(axes, data)
    }

    /// Sub-array along one axis.
    ///
    /// `Value` picks the nearest coordinate and drops the axis. `Range` keeps the
    /// coordinates inside the interval; when the interval overlaps the span but
    /// holds no sample, the sample nearest its midpoint is kept.
    pub fn select(&self, axis: &str, selection: Selection) -> Result<Self, ArrayError> {
        let k = self.axis_index(axis)?;
        let ax = &self.axes[k];
        let Some((min, max)) = ax.span() else {
            return Err(ArrayError::OutOfRange {
                axis: axis.to_string(),
                requested: selection.to_string(),
                min: f64::NAN,
                max: f64::NAN,
            });
        };
        let out_of_range = || ArrayError::OutOfRange {
            axis: axis.to_string(),
            requested: selection.to_string(),
            min,
            max,
        };

        match selection {
            Selection::Value(v) => {
                if !(v.is_finite() && v >= min && v <= max) {
                    return Err(out_of_range());
                }
                let j = ax.nearest_index(v).ok_or_else(out_of_range)?;
                let layout = self.lane_layout(k);
                let data = (0..layout.count())
                    .map(|l| self.data[layout.offset(l, j)].clone())
                    .collect();
                LabeledArray::new(self.axes_without(k), data)
            }
            Selection::Range(a, b) => {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                if !(lo.is_finite() && hi.is_finite()) || hi < min || lo > max {
                    return Err(out_of_range());
                }
                let mut keep: Vec<usize> = ax
                    .coords()
                    .iter()
                    .enumerate()
                    .filter(|(_, &c)| c >= lo && c <= hi)
                    .map(|(i, _)| i)
                    .collect();
                if keep.is_empty() {
                    keep.push(ax.nearest_index(0.5 * (lo + hi)).ok_or_else(out_of_range)?);
                }
                let new_axis = Axis::new(
                    ax.name(),
                    keep.iter().map(|&i| ax.coords()[i]).collect(),
                );
                let lanes: Vec<Vec<T>> = self
                    .lanes(k)
                    .into_iter()
                    .map(|lane| keep.iter().map(|&i| lane[i].clone()).collect())
                    .collect();
                LabeledArray::from_lanes(self.axes_without(k), k, new_axis, &lanes)
            }
        }
    }

    /// Same data with one axis renamed.
    pub fn rename_axis(&self, from: &str, to: &str) -> Result<Self, ArrayError> {
        let k = self.axis_index(from)?;
        let mut axes = self.axes.clone();
        axes[k] = axes[k].renamed(to);
        LabeledArray::new(axes, self.data.clone())
    }
}

impl LabeledArray<f64> {
    /// Resample along `axis` onto `new_coords`.
    ///
    /// Fails with `NonMonotonicAxis` if the source coordinates are not strictly
    /// monotonic. Targets outside the source span become NaN.
    pub fn interpolate(
        &self,
        axis: &str,
        new_coords: &[f64],
        method: Interpolation,
    ) -> Result<Self, ArrayError> {
        let k = self.axis_index(axis)?;
        let src = &self.axes[k];
        if !src.is_strictly_monotonic() {
            return Err(ArrayError::NonMonotonicAxis(axis.to_string()));
        }
        let lanes: Vec<Vec<f64>> = self
            .lanes(k)
            .iter()
            .map(|lane| resample(src.coords(), lane, new_coords, method))
            .collect();
        LabeledArray::from_lanes(
            self.axes_without(k),
            k,
            Axis::new(axis, new_coords.to_vec()),
            &lanes,
        )
    }

    /// Bilinear sample over axes `a` and `b` at coordinates `(va, vb)`.
    ///
    /// Every other axis is fixed by `index`; its entries for `a` and `b` are
    /// ignored. Both axes must be strictly monotonic. NaN outside the span.
    pub fn sample_bilinear(&self, a: usize, b: usize, va: f64, vb: f64, index: &[usize]) -> f64 {
        let (Some((i, s)), Some((j, t))) = (self.axes[a].locate(va), self.axes[b].locate(vb))
        else {
            return f64::NAN;
        };
        let mut at = index.to_vec();
        let mut corner = |di: usize, dj: usize| {
            at[a] = (i + di).min(self.axes[a].len() - 1);
            at[b] = (j + dj).min(self.axes[b].len() - 1);
            self.get(&at).copied().unwrap_or(f64::NAN)
        };
        let (v00, v01, v10, v11) = (corner(0, 0), corner(0, 1), corner(1, 0), corner(1, 1));
        // Exact hits must not be poisoned by a masked neighbour.
        let w = |v: f64, weight: f64| if weight == 0.0 { 0.0 } else { v * weight };
        w(v00, (1.0 - s) * (1.0 - t)) + w(v01, (1.0 - s) * t) + w(v10, s * (1.0 - t)) + w(v11, s * t)
    }

    /// Sample along a polyline through the plane of axes `a` and `b`.
    ///
    /// `vertices` are `(a, b)` coordinate pairs. The `n` output points are
    /// spaced evenly by arc length, measured in axis units, from the first
    /// vertex to the last. Both axes are replaced by one `name` axis holding
    /// that distance, placed where the earlier of the two stood. Points off
    /// the sampled span are NaN.
    pub fn slice_along_path(
        &self,
        a: &str,
        b: &str,
        vertices: &[(f64, f64)],
        n: usize,
        name: &str,
    ) -> Result<Self, ArrayError> {
        let ka = self.axis_index(a)?;
        let kb = self.axis_index(b)?;
        if ka == kb {
            return Err(ArrayError::InvalidPath(format!("axis '{a}' given twice")));
        }
        for (axis, k) in [(a, ka), (b, kb)] {
            if !self.axes[k].is_strictly_monotonic() {
                return Err(ArrayError::NonMonotonicAxis(axis.to_string()));
            }
        }
        if vertices.len() < 2 || n < 2 {
            return Err(ArrayError::InvalidPath(format!(
                "needs at least 2 vertices and 2 points, got {} and {n}",
                vertices.len()
            )));
        }
        if vertices.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(ArrayError::InvalidPath("vertices must be finite".into()));
        }

        // Arc length at each vertex.
        let mut cumulative = Vec::with_capacity(vertices.len());
        let mut length = 0.0;
        cumulative.push(length);
        for w in vertices.windows(2) {
            length += (w[1].0 - w[0].0).hypot(w[1].1 - w[0].1);
            cumulative.push(length);
        }
        if !(length > 0.0) {
            return Err(ArrayError::InvalidPath("path has zero length".into()));
        }

        let distances: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64 * length).collect();
        let points: Vec<(f64, f64)> = distances
            .iter()
            .map(|&d| {
                // Last segment starting at or before `d`; zero-length ones are skipped.
                let seg = cumulative.partition_point(|&c| c <= d).clamp(1, vertices.len() - 1) - 1;
                let span = cumulative[seg + 1] - cumulative[seg];
                let t = if span > 0.0 { (d - cumulative[seg]) / span } else { 0.0 };
                let (p, q) = (vertices[seg], vertices[seg + 1]);
                (p.0 + t * (q.0 - p.0), p.1 + t * (q.1 - p.1))
            })
            .collect();

        let others: Vec<usize> = (0..self.ndim()).filter(|&k| k != ka && k != kb).collect();
        let position = ka.min(kb);
        let mut axes: Vec<Axis> = others.iter().map(|&k| self.axes[k].clone()).collect();
        axes.insert(position, Axis::new(name, distances));
        let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
        let total: usize = shape.iter().product();

        let mut source = vec![0; self.ndim()];
        let data = (0..total)
            .map(|flat| {
                let index = unravel(&shape, flat);
                let rest = index
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != position)
                    .map(|(_, &v)| v);
                for (&k, v) in others.iter().zip(rest) {
                    source[k] = v;
                }
                let (va, vb) = points[index[position]];
                self.sample_bilinear(ka, kb, va, vb, &source)
            })
            .collect();
        LabeledArray::new(axes, data)
    }

    /// Sum over one axis, skipping non-finite values.
    pub fn sum_over(&self, axis: &str) -> Result<Self, ArrayError> {
        let k = self.axis_index(axis)?;
        let data = self
            .lanes(k)
            .iter()
            .map(|lane| lane.iter().filter(|v| v.is_finite()).sum())
            .collect();
        LabeledArray::new(self.axes_without(k), data)
    }

    /// Count of non-finite (masked) samples.
    pub fn masked_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_finite()).count()
    }

    /// BLAKE3 content hash over axis names, coordinates and data.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.axes.len() as u64).to_le_bytes());
        for axis in &self.axes {
            hasher.update(axis.name().as_bytes());
            hasher.update(&[0]);
            hasher.update(&(axis.len() as u64).to_le_bytes());
            for c in axis.coords() {
                hasher.update(&c.to_le_bytes());
            }
        }
        for v in &self.data {
            // All NaNs hash alike.
            let v = if v.is_nan() { f64::NAN } else { *v };
            hasher.update(&v.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Wire form with NaN mapped to `None` (JSON has no NaN).
    pub fn to_nullable(&self) -> LabeledArray<Option<f64>> {
        self.map(|v| v.is_finite().then_some(*v))
    }

    /// Inverse of `to_nullable`.
    pub fn from_nullable(array: &LabeledArray<Option<f64>>) -> Self {
        array.map(|v| v.unwrap_or(f64::NAN))
    }
}
