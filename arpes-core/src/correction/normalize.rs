//! Intensity normalization.

use serde::{Deserialize, Serialize};

use crate::array::LabeledArray;
use crate::provenance::Params;

use super::{Corrected, CorrectionError};

fn default_sum_axis() -> String {
    "eV".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NormalizeSpec {
    /// Divide every lane along `axis` by its finite sum.
    TotalCounts {
        #[serde(default = "default_sum_axis")]
        axis: String,
    },
    /// Divide by a named reference array, broadcast over missing axes.
    Reference { name: String },
}

impl NormalizeSpec {
    pub(crate) fn params(&self) -> Params {
        let mut p = Params::new();
        match self {
            NormalizeSpec::TotalCounts { axis } => {
                p.insert("method".into(), "total_counts".into());
                p.insert("axis".into(), axis.as_str().into());
            }
            NormalizeSpec::Reference { name } => {
                p.insert("method".into(), "reference".into());
                p.insert("reference".into(), name.as_str().into());
            }
        }
        p
    }
}

fn safe_divide(value: f64, divisor: f64) -> f64 {
    if divisor == 0.0 || !divisor.is_finite() {
        f64::NAN
    } else {
        value / divisor
    }
}

pub(crate) fn total_counts(array: &LabeledArray, axis: &str) -> Result<Corrected, CorrectionError> {
    let k = array.axis_index(axis)?;
    let lanes = array.lanes(k);
    let mut empty = 0usize;
    let normalized: Vec<Vec<f64>> = lanes
        .iter()
        .map(|lane| {
            let total: f64 = lane.iter().filter(|v| v.is_finite()).sum();
            if total == 0.0 {
                empty += 1;
            }
            lane.iter().map(|v| safe_divide(*v, total)).collect()
        })
        .collect();
    let out = LabeledArray::from_lanes(array.axes_without(k), k, array.axes()[k].clone(), &normalized)?;

    let mut corrected = Corrected::new(out);
    corrected.outputs.insert("zero_total_lanes".into(), empty.into());
    Ok(corrected)
}

pub(crate) fn by_reference(
    array: &LabeledArray,
    name: &str,
    reference: &LabeledArray,
) -> Result<Corrected, CorrectionError> {
    let mismatch = |reason: String| CorrectionError::ReferenceShapeMismatch {
        reference: name.to_string(),
        reason,
    };

    // Position in the target of each reference axis.
    let mut positions = Vec::with_capacity(reference.ndim());
    for axis in reference.axes() {
        let k = array
            .axis_index(axis.name())
            .map_err(|_| mismatch(format!("axis '{}' is absent from the target", axis.name())))?;
        if array.axes()[k].coords() != axis.coords() {
            return Err(mismatch(format!("coordinates of axis '{}' differ", axis.name())));
        }
        positions.push(k);
    }

    let out = array.transform(array.axes().to_vec(), |a| {
        (0..a.len())
            .map(|i| {
                let index = a.unravel(i);
                let at: Vec<usize> = positions.iter().map(|&k| index[k]).collect();
                let divisor = reference.get(&at).copied().unwrap_or(f64::NAN);
                safe_divide(a.values()[i], divisor)
            })
            .collect()
    })?;
    Ok(Corrected::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Axis;

    fn grid() -> LabeledArray {
        let phi = Axis::new("phi", vec![0.0, 1.0]);
        let ev = Axis::new("eV", vec![-0.1, 0.0, 0.1]);
        LabeledArray::new(vec![phi, ev], vec![1.0, 2.0, 1.0, 0.0, 0.0, 0.0]).unwrap()
    }

    #[test]
    fn total_counts_divides_each_lane_by_its_sum() {
        let out = total_counts(&grid(), "eV").unwrap();
        assert_eq!(&out.array.values()[..3], &[0.25, 0.5, 0.25]);
        assert!(out.array.values()[3..].iter().all(|v| v.is_nan()));
        assert_eq!(out.outputs["zero_total_lanes"].as_number(), Some(1.0));
    }

    #[test]
    fn reference_broadcasts_over_missing_axes() {
        let reference =
            LabeledArray::new(vec![Axis::new("eV", vec![-0.1, 0.0, 0.1])], vec![2.0, 0.0, 4.0])
                .unwrap();
        let out = by_reference(&grid(), "gain", &reference).unwrap();
        let v = out.array.values();
        assert_eq!(v[0], 0.5);
        assert!(v[1].is_nan());
        assert_eq!(v[2], 0.25);
        assert_eq!(v[5], 0.0);
    }

    #[test]
    fn reference_on_a_different_grid_is_rejected() {
        let reference =
            LabeledArray::new(vec![Axis::new("eV", vec![-0.1, 0.0, 0.2])], vec![1.0; 3]).unwrap();
        let err = by_reference(&grid(), "gain", &reference).unwrap_err();
        assert!(matches!(err, CorrectionError::ReferenceShapeMismatch { .. }));

        let foreign = LabeledArray::new(vec![Axis::new("kz", vec![0.0])], vec![1.0]).unwrap();
        assert!(by_reference(&grid(), "gain", &foreign).is_err());
    }
}
