//! Slice-by-slice fits over a labeled array.
//!
//! Slices are the lanes along the fit axis, ordered lexicographically by the
//! remaining axes. With warm start enabled, the innermost remaining axis forms
//! chains: each slice starts from the last converged parameters earlier in its
//! chain, carried in an explicit accumulator. Chains are independent and run
//! in parallel; without warm start every slice is independent.

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::array::LabeledArray;
use crate::models::{Model, ModelError};
use crate::provenance::NodeId;

use super::lm::fit_slice;
use super::{FitError, FitOptions, FitResult};

/// Per-slice results of `fit_dataset`, indexed by the non-fit axes.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetFit {
    pub param_names: Vec<String>,
    pub fit_axis: String,
    pub results: LabeledArray<FitResult>,
}

impl DatasetFit {
    /// Tag every slice with the provenance node of the fitted array.
    pub fn with_input_node(self, node: NodeId) -> Self {
        let results = self.results.map(|r| FitResult {
            input_node: Some(node),
            ..r.clone()
        });
        Self { results, ..self }
    }

    pub fn param_index(&self, name: &str) -> Result<usize, FitError> {
        self.param_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ModelError::UnknownParameter(name.to_string()).into())
    }

    pub fn converged_count(&self) -> usize {
        self.results.values().iter().filter(|r| r.converged).count()
    }
}

/// Fit `model` along `fit_axis` for every index combination of the other axes.
pub fn fit_dataset(
    model: &Model,
    array: &LabeledArray,
    fit_axis: &str,
    initial: &[f64],
    bounds: &[(f64, f64)],
    options: &FitOptions,
) -> Result<DatasetFit, FitError> {
    let k = array.axis_index(fit_axis)?;
    let param_names = model.param_names()?;
    let n = param_names.len();
    if initial.len() != n {
        return Err(FitError::LengthMismatch {
            what: "initial",
            expected: n,
            got: initial.len(),
        });
    }
    if !bounds.is_empty() && bounds.len() != n {
        return Err(FitError::LengthMismatch {
            what: "bounds",
            expected: n,
            got: bounds.len(),
        });
    }

    let x = array.axes()[k].coords();
    let lanes = array.lanes(k);
    let others = array.axes_without(k);
    let chain_len = match others.last() {
        Some(axis) if options.warm_start && !axis.is_empty() => axis.len(),
        _ => 1,
    };
    debug!(
        slices = lanes.len(),
        chain_len,
        fit_axis,
        model = %model,
        "fitting dataset"
    );

    let chains: Vec<Vec<FitResult>> = lanes
        .par_chunks(chain_len)
        .map(|chain| {
            let mut last_converged: Option<Vec<f64>> = None;
            chain
                .iter()
                .map(|y| {
                    let start = last_converged.as_deref().unwrap_or(initial);
                    let result = fit_slice(model, x, y, start, bounds, options);
                    if result.converged {
                        last_converged = Some(result.params.clone());
                    }
                    result
                })
                .collect()
        })
        .collect();
    let results: Vec<FitResult> = chains.into_iter().flatten().collect();

    let failed = results.iter().filter(|r| !r.converged).count();
    if failed > 0 {
        warn!(failed, total = results.len(), fit_axis, "slices did not converge");
    }

    let results = LabeledArray::new(others, results)?;
    Ok(DatasetFit {
        param_names,
        fit_axis: fit_axis.to_string(),
        results,
    })
}

/// Multi-indices (over the non-fit axes) of slices that did not converge.
pub fn failed_slices(results: &LabeledArray<FitResult>) -> Vec<Vec<usize>> {
    results
        .values()
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.converged)
        .map(|(i, _)| results.unravel(i))
        .collect()
}

/// One fitted parameter as an array over the non-fit axes.
pub fn parameter_map(fit: &DatasetFit, name: &str) -> Result<LabeledArray, FitError> {
    let j = fit.param_index(name)?;
    Ok(fit.results.map(|r| r.params[j]))
}
