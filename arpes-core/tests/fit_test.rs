//! Fitting scenarios: composite recovery, pathological slices, bootstrap.

use std::collections::BTreeMap;

use arpes_core::array::{Axis, LabeledArray};
use arpes_core::fit::{
    bootstrap_dataset, failed_slices, fit_dataset, fit_slice, parameter_map, ErrorSource,
    FitOptions, FitStatus,
};
use arpes_core::models::{Bounds, Model};
use arpes_core::synthetic::{add_noise, gaussian_peaks};

#[test]
fn gaussian_plus_linear_recovers_parameters_within_one_percent() {
    // GIVEN a Gaussian peak on a sloped background, generated without noise
    let peak = Model::gaussian().labeled("peak");
    let background = Model::linear().labeled("bg");
    let model = peak + background;
    let truth = [1.3, -0.05, 0.04, 0.6, 0.2];
    let x: Vec<f64> = (0..241).map(|i| -0.3 + 0.5 * i as f64 / 240.0).collect();
    let y = model.evaluate(&x, &truth).unwrap();

    // WHEN it is fitted from a rough guess resolved by name
    let mut overrides = BTreeMap::new();
    overrides.insert("peak.amplitude".to_string(), 1.0);
    overrides.insert("peak.center".to_string(), -0.02);
    overrides.insert("peak.sigma".to_string(), 0.06);
    let initial = model.resolve_initial(&overrides).unwrap();
    let fit = fit_slice(&model, &x, &y, &initial, &[], &FitOptions::default());

    // THEN every parameter is within 1%
    assert!(fit.converged, "{:?}", fit.status);
    for (got, want) in fit.params.iter().zip(truth) {
        assert!((got - want).abs() <= 0.01 * want.abs(), "{got} vs {want}");
    }
    assert_eq!(
        model.param_names().unwrap(),
        vec!["peak.amplitude", "peak.center", "peak.sigma", "bg.slope", "bg.intercept"]
    );
}

#[test]
fn zero_slice_is_flagged_and_the_batch_completes() {
    // GIVEN peaks over 7 channels, with channel 3 replaced by zeros
    let centers: Vec<f64> = (0..7).map(|i| -0.1 + 0.02 * i as f64).collect();
    let clean = gaussian_peaks(&centers, 1.0, 0.03, (0.0, 0.1), 150).unwrap();
    let k = clean.axis_index("eV").unwrap();
    let mut lanes = clean.lanes(k);
    lanes[3] = vec![0.0; lanes[3].len()];
    let array =
        LabeledArray::from_lanes(clean.axes_without(k), k, clean.axes()[k].clone(), &lanes)
            .unwrap();

    // WHEN the dataset is fitted
    let model = Model::gaussian() + Model::linear();
    let fit = fit_dataset(
        &model,
        &array,
        "eV",
        &[0.8, -0.1, 0.05, 0.0, 0.05],
        &[],
        &FitOptions::default(),
    )
    .unwrap();

    // THEN the result covers every channel, only channel 3 failed
    assert_eq!(fit.results.len(), 7);
    assert_eq!(failed_slices(&fit.results), vec![vec![3]]);
    assert_eq!(fit.results.values()[3].status, FitStatus::Degenerate);
    assert_eq!(fit.converged_count(), 6);

    // AND the center map follows the dispersion elsewhere
    let centers_fit = parameter_map(&fit, "gaussian.center").unwrap();
    for (i, want) in centers.iter().enumerate() {
        if i != 3 {
            assert!((centers_fit.values()[i] - want).abs() < 1e-6);
        }
    }
}

#[test]
fn noise_to_zero_recovers_truth() {
    let model = Model::gaussian() + Model::linear();
    let truth = [1.0, 0.0, 0.03, 0.0, 0.1];
    let clean = gaussian_peaks(&[0.0], 1.0, 0.03, (0.0, 0.1), 200).unwrap();
    let mut previous = f64::INFINITY;
    for sigma in [0.05, 0.01, 0.001] {
        let noisy = add_noise(&clean, sigma, 11);
        let fit = fit_dataset(&model, &noisy, "eV", &[0.8, 0.02, 0.05, 0.0, 0.0], &[], &FitOptions::default())
            .unwrap();
        let got = &fit.results.values()[0].params;
        let err = (got[1] - truth[1]).abs();
        assert!(err < previous + 1e-6, "error grew at sigma {sigma}");
        assert!(err < 5.0 * sigma, "center error {err} at sigma {sigma}");
        previous = err;
    }
}

#[test]
fn bounds_by_name_constrain_the_fit() {
    let model = Model::gaussian() + Model::linear();
    let mut bounds = BTreeMap::new();
    bounds.insert("gaussian.center".to_string(), Bounds::new(0.0, 0.2));
    let resolved = model.resolve_bounds(&bounds).unwrap();

    // Peak truly sits at -0.1; the bound keeps the center at or above zero.
    let data = gaussian_peaks(&[-0.1], 1.0, 0.03, (0.0, 0.0), 150).unwrap();
    let x = data.coords("eV").unwrap().to_vec();
    let fit = fit_slice(
        &model,
        &x,
        data.values(),
        &[1.0, 0.05, 0.05, 0.0, 0.0],
        &resolved,
        &FitOptions::default(),
    );
    assert!(fit.params[1] >= 0.0);
}

#[test]
fn bootstrap_dataset_is_seeded_and_skips_failures() {
    let centers = [-0.05, 0.0, 0.05];
    let noisy = add_noise(
        &gaussian_peaks(&centers, 1.0, 0.03, (0.0, 0.1), 120).unwrap(),
        0.02,
        5,
    );
    let model = Model::gaussian() + Model::linear();
    let options = FitOptions::default();
    let base = fit_dataset(&model, &noisy, "eV", &[0.8, 0.0, 0.05, 0.0, 0.1], &[], &options)
        .unwrap();

    let a = bootstrap_dataset(&model, &noisy, &base, &[], 40, 3, &options).unwrap();
    let b = bootstrap_dataset(&model, &noisy, &base, &[], 40, 3, &options).unwrap();
    assert_eq!(a, b);
    for result in a.results.values() {
        assert_eq!(result.error_source, ErrorSource::Bootstrap);
        let interval = result.interval.as_ref().unwrap();
        assert!(interval[1][0] <= result.params[1] && result.params[1] <= interval[1][1]);
    }

    let mismatched = LabeledArray::new(
        vec![Axis::linspace("phi", 0.0, 1.0, 2), noisy.axes()[1].clone()],
        vec![0.0; 240],
    )
    .unwrap();
    assert!(bootstrap_dataset(&model, &mismatched, &base, &[], 10, 3, &options).is_err());
}
