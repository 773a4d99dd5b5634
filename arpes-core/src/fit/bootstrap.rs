//! Residual bootstrap for fit uncertainties.
//!
//! A base fit gives fitted values `ŷ` and residuals `e = y - ŷ`. Each
//! resample builds `y* = ŷ + e*`, with `e*` drawn from `e` with replacement,
//! and is refit from the base parameters. Resamples are independent, seeded
//! through the RNG hierarchy and run in parallel; results do not depend on
//! the thread count.
//!
//! Residual resampling keeps the energy/momentum sampling fixed, which matters
//! for edge-like models where dropping points near the step would bias the fit.

use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::array::LabeledArray;
use crate::models::Model;
use crate::rng::RngHierarchy;

use super::dataset::DatasetFit;
use super::lm::fit_slice;
use super::{ErrorSource, FitError, FitOptions, FitResult};

// ─── Result types ────────────────────────────────────────────────────

/// Empirical distribution of one parameter over converged resamples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterDistribution {
    pub mean: f64,
    pub std: f64,
    pub p2_5: f64,
    pub p97_5: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootstrapResult {
    pub base: FitResult,
    pub distributions: Vec<ParameterDistribution>,
    pub n_resamples: usize,
    /// Resamples whose refit converged; only these enter the statistics.
    pub n_successful: usize,
}

impl BootstrapResult {
    /// The base fit with bootstrap errors and percentile intervals.
    pub fn into_fit_result(self) -> FitResult {
        if self.n_successful < 2 {
            return self.base;
        }
        FitResult {
            stderr: self.distributions.iter().map(|d| d.std).collect(),
            interval: Some(self.distributions.iter().map(|d| [d.p2_5, d.p97_5]).collect()),
            error_source: ErrorSource::Bootstrap,
            ..self.base
        }
    }
}

// ─── Single slice ────────────────────────────────────────────────────

/// Bootstrap one slice. `stream` names the seed stream (unique per slice).
#[allow(clippy::too_many_arguments)]
fn bootstrap_with_stream(
    model: &Model,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    bounds: &[(f64, f64)],
    n_resamples: usize,
    rng: &RngHierarchy,
    stream: &str,
    options: &FitOptions,
) -> BootstrapResult {
    let base = fit_slice(model, x, y, initial, bounds, options);
    let n = base.params.len();

    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .unzip();
    let fitted: Vec<f64> = xs.iter().map(|&xi| model.value_at(xi, &base.params)).collect();
    let residuals: Vec<f64> = ys.iter().zip(&fitted).map(|(o, f)| o - f).collect();

    let samples: Vec<Vec<f64>> = if residuals.is_empty() || fitted.iter().any(|v| !v.is_finite()) {
        Vec::new()
    } else {
        (0..n_resamples)
            .into_par_iter()
            .filter_map(|b| {
                let mut r = rng.rng_for(stream, b as u64);
                let resampled: Vec<f64> = fitted
                    .iter()
                    .map(|f| f + residuals[r.gen_range(0..residuals.len())])
                    .collect();
                let refit = fit_slice(model, &xs, &resampled, &base.params, bounds, options);
                refit.converged.then_some(refit.params)
            })
            .collect()
    };

    let distributions = (0..n)
        .map(|j| {
            let column: Vec<f64> = samples.iter().map(|s| s[j]).collect();
            distribution(column)
        })
        .collect();

    debug!(stream, n_resamples, n_successful = samples.len(), "bootstrap finished");
    BootstrapResult {
        base,
        distributions,
        n_resamples,
        n_successful: samples.len(),
    }
}

/// Residual bootstrap of one slice with `n_resamples` refits.
#[allow(clippy::too_many_arguments)]
pub fn bootstrap(
    model: &Model,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    bounds: &[(f64, f64)],
    n_resamples: usize,
    seed: u64,
    options: &FitOptions,
) -> BootstrapResult {
    let rng = RngHierarchy::new(seed);
    bootstrap_with_stream(model, x, y, initial, bounds, n_resamples, &rng, "slice", options)
}

// ─── Dataset ─────────────────────────────────────────────────────────

/// Replace covariance errors of every slice in `fit` with bootstrap errors.
///
/// Each slice is refit from its converged parameters; unconverged slices are
/// left untouched. Slice `l` uses seed stream `slice-{l}`.
pub fn bootstrap_dataset(
    model: &Model,
    array: &LabeledArray,
    fit: &DatasetFit,
    bounds: &[(f64, f64)],
    n_resamples: usize,
    seed: u64,
    options: &FitOptions,
) -> Result<DatasetFit, FitError> {
    let k = array.axis_index(&fit.fit_axis)?;
    let x = array.axes()[k].coords();
    let lanes = array.lanes(k);
    if lanes.len() != fit.results.len() {
        return Err(FitError::LengthMismatch {
            what: "dataset slices",
            expected: fit.results.len(),
            got: lanes.len(),
        });
    }
    let rng = RngHierarchy::new(seed);

    let updated: Vec<FitResult> = fit
        .results
        .values()
        .iter()
        .zip(&lanes)
        .enumerate()
        .map(|(l, (result, y))| {
            if !result.converged {
                return result.clone();
            }
            let stream = format!("slice-{l}");
            let boot = bootstrap_with_stream(
                model,
                x,
                y,
                &result.params,
                bounds,
                n_resamples,
                &rng,
                &stream,
                options,
            );
            FitResult {
                input_node: result.input_node,
                ..boot.into_fit_result()
            }
        })
        .collect();

    let results = LabeledArray::new(fit.results.axes().to_vec(), updated)?;
    Ok(DatasetFit {
        results,
        ..fit.clone()
    })
}

// ─── Statistics ──────────────────────────────────────────────────────

fn distribution(mut values: Vec<f64>) -> ParameterDistribution {
    let n = values.len();
    if n == 0 {
        return ParameterDistribution {
            mean: f64::NAN,
            std: f64::NAN,
            p2_5: f64::NAN,
            p97_5: f64::NAN,
        };
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let std = if n > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        f64::NAN
    };
    values.sort_by(f64::total_cmp);
    ParameterDistribution {
        mean,
        std,
        p2_5: percentile_sorted(&values, 2.5),
        p97_5: percentile_sorted(&values, 97.5),
    }
}

/// Percentile of a sorted slice using linear interpolation.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noisy_line(seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.05).unwrap();
        let x: Vec<f64> = (0..60).map(|i| i as f64 / 59.0).collect();
        let y = x.iter().map(|v| 1.5 * v + 0.2 + noise.sample(&mut rng)).collect();
        (x, y)
    }

    #[test]
    fn percentiles_interpolate() {
        let sorted = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_sorted(&sorted, 50.0), 2.0);
        assert_eq!(percentile_sorted(&sorted, 0.0), 0.0);
        assert_eq!(percentile_sorted(&sorted, 100.0), 4.0);
        assert!((percentile_sorted(&sorted, 12.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn bootstrap_brackets_the_base_fit() {
        let (x, y) = noisy_line(3);
        let model = Model::linear();
        let boot = bootstrap(&model, &x, &y, &[0.0, 0.0], &[], 200, 42, &FitOptions::default());
        assert_eq!(boot.n_resamples, 200);
        assert_eq!(boot.n_successful, 200);
        for (d, p) in boot.distributions.iter().zip(&boot.base.params) {
            assert!(d.p2_5 < *p && *p < d.p97_5);
            assert!(d.std > 0.0);
        }
        // Bootstrap and covariance errors agree to within a factor of two.
        for (d, se) in boot.distributions.iter().zip(&boot.base.stderr) {
            assert!(d.std < 2.0 * se && d.std > 0.5 * se, "{} vs {se}", d.std);
        }
    }

    #[test]
    fn bootstrap_is_reproducible_for_a_seed() {
        let (x, y) = noisy_line(4);
        let model = Model::linear();
        let opts = FitOptions::default();
        let a = bootstrap(&model, &x, &y, &[0.0, 0.0], &[], 50, 9, &opts);
        let b = bootstrap(&model, &x, &y, &[0.0, 0.0], &[], 50, 9, &opts);
        let c = bootstrap(&model, &x, &y, &[0.0, 0.0], &[], 50, 10, &opts);
        assert_eq!(a.distributions, b.distributions);
        assert_ne!(a.distributions, c.distributions);
    }

    #[test]
    fn into_fit_result_switches_error_source() {
        let (x, y) = noisy_line(5);
        let model = Model::linear();
        let fit = bootstrap(&model, &x, &y, &[0.0, 0.0], &[], 30, 1, &FitOptions::default())
            .into_fit_result();
        assert_eq!(fit.error_source, ErrorSource::Bootstrap);
        assert_eq!(fit.interval.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn degenerate_slice_yields_no_samples() {
        let x: Vec<f64> = (0..10).map(f64::from).collect();
        let boot = bootstrap(
            &Model::linear(),
            &x,
            &[0.0; 10],
            &[0.0, 0.0],
            &[],
            20,
            1,
            &FitOptions::default(),
        );
        // Constant data: base fit is degenerate but residuals are all zero,
        // so every resample is constant too.
        assert_eq!(boot.n_successful, 0);
        assert!(boot.distributions[0].mean.is_nan());
        assert_eq!(boot.into_fit_result().error_source, ErrorSource::Covariance);
    }
}
