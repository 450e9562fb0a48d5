//! Levenberg-Marquardt for small dense least-squares problems
//!
//! Minimizes 0.5 ||r(x)||² for a residual closure with a handful of
//! parameters. The Jacobian is taken by central differences and the damping
//! is Marquardt's diagonal scaling of JᵀJ.

use nalgebra::{DMatrix, DVector};

/// LM tuning
#[derive(Clone, Copy, Debug)]
pub struct LmSettings {
    pub max_iterations: usize,
    /// Central-difference step
    pub step: f64,
    pub initial_lambda: f64,
    /// Relative cost decrease / step size considered converged
    pub tolerance: f64,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self { max_iterations: 20, step: 1e-4, initial_lambda: 1e-3, tolerance: 1e-8 }
    }
}

#[derive(Clone, Debug)]
pub struct LmOutcome {
    pub params: Vec<f64>,
    pub initial_cost: f64,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

const MIN_LAMBDA: f64 = 1e-7;
const MAX_LAMBDA: f64 = 1e10;

fn cost_of(r: &[f64]) -> f64 {
    0.5 * r.iter().map(|v| v * v).sum::<f64>()
}

fn jacobian<F>(residual: &F, x: &[f64], m: usize, h: f64) -> Option<DMatrix<f64>>
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    let n = x.len();
    let mut jac = DMatrix::<f64>::zeros(m, n);
    let mut shifted = x.to_vec();
    for j in 0..n {
        shifted[j] = x[j] + h;
        let plus = residual(&shifted)?;
        shifted[j] = x[j] - h;
        let minus = residual(&shifted)?;
        shifted[j] = x[j];
        if plus.len() != m || minus.len() != m {
            return None;
        }
        for i in 0..m {
            jac[(i, j)] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }
    Some(jac)
}

/// Run LM from `x0`
///
/// Returns `None` when the residual cannot be evaluated at the start point
/// or along its Jacobian stencil; later stencil failures stop the run at
/// the current iterate. Steps that fail to evaluate or do not
/// decrease the cost are rejected, so the returned cost never exceeds the
/// initial one.
pub fn levenberg_marquardt<F>(residual: F, x0: &[f64], settings: &LmSettings) -> Option<LmOutcome>
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    let n = x0.len();
    let mut x = x0.to_vec();
    let mut r = residual(&x)?;
    let m = r.len();
    let mut cost = cost_of(&r);
    if !cost.is_finite() {
        return None;
    }
    let initial_cost = cost;

    let mut lambda = settings.initial_lambda;
    let mut jac = jacobian(&residual, &x, m, settings.step)?;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;

        let jt = jac.transpose();
        let jtj = &jt * &jac;
        let g = &jt * DVector::from_column_slice(&r);
        if g.norm() <= 1e-14 {
            converged = true;
            break;
        }

        let max_diag = (0..n).map(|i| jtj[(i, i)]).fold(0.0, f64::max);
        let mut h = jtj.clone();
        for i in 0..n {
            h[(i, i)] += lambda * jtj[(i, i)].max(1e-6 * max_diag).max(1e-12);
        }

        let rhs = -&g;
        let delta = match h.clone().cholesky() {
            Some(chol) => Some(chol.solve(&rhs)),
            None => h.lu().solve(&rhs),
        };
        let Some(delta) = delta.filter(|d| d.iter().all(|v| v.is_finite())) else {
            lambda = (lambda * 10.0).min(MAX_LAMBDA);
            continue;
        };

        let candidate: Vec<f64> = x.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
        let trial = residual(&candidate).filter(|rc| rc.len() == m);
        let trial_cost = trial.as_deref().map(cost_of).unwrap_or(f64::INFINITY);

        if trial_cost.is_finite() && trial_cost < cost {
            let decrease = cost - trial_cost;
            let step_norm = delta.norm();
            let x_norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();

            x = candidate;
            r = trial.unwrap_or_default();
            cost = trial_cost;
            lambda = (lambda / 10.0).max(MIN_LAMBDA);

            if decrease <= settings.tolerance * cost.max(1e-300) || step_norm <= settings.tolerance * (x_norm + settings.tolerance) {
                converged = true;
                break;
            }
            match jacobian(&residual, &x, m, settings.step) {
                Some(j) => jac = j,
                None => break,
            }
        } else {
            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                converged = true;
                break;
            }
        }
    }

    Some(LmOutcome { params: x, initial_cost, cost, iterations, converged })
}
