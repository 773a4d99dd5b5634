//! Bounded Levenberg–Marquardt.
//!
//! Minimizes `0.5 * Σ (f(x_i; p) - y_i)^2` with
//! - forward-difference Jacobian (backward at an upper bound),
//! - Marquardt damping `JᵀJ + λ diag(JᵀJ)` solved by Cholesky,
//! - every trial point projected onto the box `[lower, upper]`.
//!
//! A step is accepted only if it lowers the cost; λ shrinks by 10 after an
//! accepted step and grows by 10 after a rejected one. When λ overflows no
//! descent direction is left inside the box and the iterate is a (possibly
//! bound-constrained) minimum.

use nalgebra::{DMatrix, DVector};

use crate::models::Model;

use super::{ErrorSource, FitOptions, FitResult, FitStatus};

const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_MAX: f64 = 1e16;
/// Smallest eigenvalue of the scaled curvature matrix still considered regular.
const RCOND: f64 = 1e-10;

struct Problem<'a> {
    model: &'a Model,
    x: Vec<f64>,
    y: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Problem<'_> {
    fn residuals(&self, p: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.x.len(),
            self.x
                .iter()
                .zip(&self.y)
                .map(|(&xi, &yi)| self.model.value_at(xi, p) - yi),
        )
    }

    fn project(&self, p: &mut [f64]) {
        for ((v, &lo), &hi) in p.iter_mut().zip(&self.lower).zip(&self.upper) {
            *v = v.clamp(lo, hi);
        }
    }

    fn jacobian(&self, p: &[f64], r0: &DVector<f64>) -> DMatrix<f64> {
        let m = self.x.len();
        let n = p.len();
        let mut jac = DMatrix::zeros(m, n);
        let mut q = p.to_vec();
        for j in 0..n {
            let mut h = f64::EPSILON.sqrt() * p[j].abs().max(1e-3);
            if p[j] + h > self.upper[j] {
                h = -h;
            }
            q[j] = p[j] + h;
            let r = self.residuals(&q);
            for i in 0..m {
                jac[(i, j)] = (r[i] - r0[i]) / h;
            }
            q[j] = p[j];
        }
        jac
    }
}

fn cost_of(r: &DVector<f64>) -> f64 {
    0.5 * r.norm_squared()
}

/// Fit `model` to `(x, y)` starting from `initial`.
///
/// `bounds` holds `(lower, upper)` per parameter, or is empty for an
/// unbounded fit. Non-finite points are dropped before fitting. Length
/// mismatches between `initial`, `bounds` and the model are reported as
/// `Degenerate`, like every other input the optimizer cannot work with.
pub fn fit_slice(
    model: &Model,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    bounds: &[(f64, f64)],
    options: &FitOptions,
) -> FitResult {
    let n = model.n_params();
    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .unzip();
    let m = xs.len();

    if n == 0 || initial.len() != n || !(bounds.is_empty() || bounds.len() == n) {
        return FitResult::unfitted(initial.to_vec(), FitStatus::Degenerate, m);
    }
    let (lower, upper): (Vec<f64>, Vec<f64>) = if bounds.is_empty() {
        (vec![f64::NEG_INFINITY; n], vec![f64::INFINITY; n])
    } else {
        bounds.iter().copied().unzip()
    };
    let problem = Problem {
        model,
        x: xs,
        y: ys,
        lower,
        upper,
    };

    let mut p = initial.to_vec();
    problem.project(&mut p);

    if m < n || is_constant(&problem.y) {
        return FitResult::unfitted(p, FitStatus::Degenerate, m);
    }

    let mut r = problem.residuals(&p);
    let mut cost = cost_of(&r);
    if !cost.is_finite() {
        return FitResult::unfitted(p, FitStatus::NonFinite, m);
    }

    let zero_cost = 1e-30 * (1.0 + problem.y.iter().map(|v| v * v).sum::<f64>());
    let mut lambda = options.initial_lambda;
    let mut status = FitStatus::MaxIterations;
    let mut iterations = 0;

    'outer: while iterations < options.max_iterations {
        if cost <= zero_cost {
            status = FitStatus::Converged;
            break;
        }
        iterations += 1;

        let jac = problem.jacobian(&p, &r);
        let jtj = jac.tr_mul(&jac);
        let neg_grad = -jac.tr_mul(&r);
        let diag_floor = 1e-12 * jtj.diagonal().amax().max(f64::MIN_POSITIVE);

        loop {
            let mut damped = jtj.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * jtj[(i, i)].max(diag_floor);
            }

            if let Some(chol) = damped.cholesky() {
                let delta = chol.solve(&neg_grad);
                let mut trial: Vec<f64> = p.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
                problem.project(&mut trial);

                let r_trial = problem.residuals(&trial);
                let cost_trial = cost_of(&r_trial);
                if cost_trial.is_finite() && cost_trial < cost {
                    let reduction = (cost - cost_trial) / cost;
                    let step = norm(trial.iter().zip(&p).map(|(a, b)| a - b));
                    let scale = norm(p.iter().copied());

                    p = trial;
                    r = r_trial;
                    cost = cost_trial;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);

                    if reduction < options.ftol
                        || step <= options.xtol * (scale + options.xtol)
                        || cost <= zero_cost
                    {
                        status = FitStatus::Converged;
                        break 'outer;
                    }
                    break;
                }
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                status = FitStatus::Converged;
                break 'outer;
            }
        }
    }

    let jac = problem.jacobian(&p, &r);
    let stderr = match standard_errors(&jac, cost, m, n) {
        Some(se) => se,
        None => {
            if status == FitStatus::Converged {
                status = FitStatus::Singular;
            }
            vec![f64::NAN; n]
        }
    };

    FitResult {
        params: p,
        stderr,
        error_source: ErrorSource::Covariance,
        interval: None,
        rss: 2.0 * cost,
        iterations,
        n_points: m,
        converged: status == FitStatus::Converged,
        status,
        input_node: None,
    }
}

/// `sqrt(diag(s² (JᵀJ)⁻¹))`, or `None` if `JᵀJ` is numerically singular.
///
/// Singularity is judged on the unit-diagonal scaling of `JᵀJ` so parameter
/// units do not matter. With no residual degrees of freedom the errors are
/// NaN but the curvature is still checked.
fn standard_errors(jac: &DMatrix<f64>, cost: f64, m: usize, n: usize) -> Option<Vec<f64>> {
    let jtj = jac.tr_mul(jac);
    let d: Vec<f64> = jtj.diagonal().iter().map(|v| v.sqrt()).collect();
    if d.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
        return None;
    }
    let scaled = DMatrix::from_fn(n, n, |i, j| jtj[(i, j)] / (d[i] * d[j]));
    let min_eigenvalue = scaled.symmetric_eigenvalues().min();
    if !(min_eigenvalue > RCOND) {
        return None;
    }
    let inv = scaled.cholesky()?.inverse();

    let dof = m.saturating_sub(n);
    let s2 = if dof > 0 { 2.0 * cost / dof as f64 } else { f64::NAN };
    Some(
        (0..n)
            .map(|i| (s2 * inv[(i, i)]).sqrt() / d[i])
            .collect(),
    )
}

fn norm(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

fn is_constant(y: &[f64]) -> bool {
    let (lo, hi) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    hi - lo <= f64::EPSILON * lo.abs().max(hi.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, lo: f64, hi: f64) -> Vec<f64> {
        (0..n)
            .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
            .collect()
    }

    #[test]
    fn linear_fit_is_exact() {
        let model = Model::linear();
        let x = grid(20, -1.0, 1.0);
        let y: Vec<f64> = x.iter().map(|v| 2.5 * v - 0.75).collect();
        let r = fit_slice(&model, &x, &y, &[0.0, 0.0], &[], &FitOptions::default());
        assert!(r.converged, "{:?}", r.status);
        assert!((r.params[0] - 2.5).abs() < 1e-8);
        assert!((r.params[1] + 0.75).abs() < 1e-8);
        assert!(r.rss < 1e-12);
    }

    #[test]
    fn gaussian_recovers_parameters_from_offset_start() {
        let model = Model::gaussian();
        let x = grid(200, -1.0, 1.0);
        let truth = [3.0, 0.12, 0.2];
        let y = model.evaluate(&x, &truth).unwrap();
        let bounds = model.resolve_bounds(&Default::default()).unwrap();
        let r = fit_slice(&model, &x, &y, &[2.0, 0.0, 0.3], &bounds, &FitOptions::default());
        assert!(r.converged, "{:?}", r.status);
        for (got, want) in r.params.iter().zip(truth) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn bounds_are_respected() {
        let model = Model::linear();
        let x = grid(10, 0.0, 1.0);
        let y: Vec<f64> = x.iter().map(|v| 5.0 * v).collect();
        let bounds = [(-1.0, 2.0), (f64::NEG_INFINITY, f64::INFINITY)];
        let r = fit_slice(&model, &x, &y, &[0.0, 0.0], &bounds, &FitOptions::default());
        assert!(r.params[0] <= 2.0 + 1e-12);
        assert!((r.params[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn all_zero_data_is_degenerate() {
        let model = Model::gaussian();
        let x = grid(50, -1.0, 1.0);
        let r = fit_slice(&model, &x, &[0.0; 50], &[1.0, 0.0, 0.1], &[], &FitOptions::default());
        assert!(!r.converged);
        assert_eq!(r.status, FitStatus::Degenerate);
        assert_eq!(r.params, vec![1.0, 0.0, 0.1]);
    }

    #[test]
    fn too_few_finite_points_is_degenerate() {
        let model = Model::gaussian();
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, f64::NAN, 2.0, f64::NAN];
        let r = fit_slice(&model, &x, &y, &[1.0, 0.0, 0.1], &[], &FitOptions::default());
        assert_eq!(r.status, FitStatus::Degenerate);
        assert_eq!(r.n_points, 2);
    }

    #[test]
    fn non_finite_points_are_ignored() {
        let model = Model::linear();
        let x = grid(10, 0.0, 1.0);
        let mut y: Vec<f64> = x.iter().map(|v| v + 1.0).collect();
        y[3] = f64::NAN;
        let r = fit_slice(&model, &x, &y, &[0.0, 0.0], &[], &FitOptions::default());
        assert!(r.converged);
        assert_eq!(r.n_points, 9);
        assert!((r.params[0] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn iteration_cap_reports_best_iterate() {
        let model = Model::gaussian();
        let x = grid(100, -1.0, 1.0);
        let y = model.evaluate(&x, &[1.0, 0.3, 0.1]).unwrap();
        let opts = FitOptions {
            max_iterations: 1,
            ..FitOptions::default()
        };
        let r = fit_slice(&model, &x, &y, &[0.5, 0.2, 0.15], &[], &opts);
        assert!(!r.converged);
        assert_eq!(r.status, FitStatus::MaxIterations);
        assert_eq!(r.iterations, 1);
        assert!(r.rss.is_finite());
    }

    #[test]
    fn uninformative_parameter_is_singular() {
        // Two constants summed: only their sum is identifiable.
        let model = Model::constant() + Model::constant() + Model::linear();
        let x = grid(10, 0.0, 1.0);
        let y: Vec<f64> = x.iter().map(|v| v + 1.0).collect();
        let r = fit_slice(&model, &x, &y, &[0.0, 0.0, 0.0, 0.0], &[], &FitOptions::default());
        assert!(!r.converged);
        assert_eq!(r.status, FitStatus::Singular);
        assert!(r.rss < 1e-10);
    }

    #[test]
    fn standard_errors_scale_with_noise() {
        let model = Model::linear();
        let x = grid(40, 0.0, 1.0);
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 2.0 * v + if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        let r = fit_slice(&model, &x, &y, &[0.0, 0.0], &[], &FitOptions::default());
        assert!(r.converged);
        assert!(r.stderr.iter().all(|s| s.is_finite() && *s > 0.0));
    }
}
