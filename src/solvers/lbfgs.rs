//! Projected L-BFGS solver
//!
//! Limited-memory quasi-Newton minimization of a smooth objective with an
//! optional uniform lower bound (x >= lb). Variables sitting on the bound
//! with a gradient pushing outward are frozen for the step; the step is
//! projected back onto the feasible set and accepted by Armijo backtracking.

use std::collections::VecDeque;

use crate::utils::simd_ops::{axpy, dot, norm};

const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

/// Outcome of an L-BFGS solve
#[derive(Clone, Debug)]
pub struct LbfgsResult {
    pub x: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// Objective value at `x`
    pub value: f64,
}

struct CurvaturePair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

fn project(x: &mut [f64], lower_bound: Option<f64>) {
    if let Some(lb) = lower_bound {
        for xi in x.iter_mut() {
            if *xi < lb {
                *xi = lb;
            }
        }
    }
}

/// Mark variables pinned at the bound whose gradient points out of the box
fn active_set(x: &[f64], g: &[f64], lower_bound: Option<f64>) -> Vec<bool> {
    match lower_bound {
        Some(lb) => x.iter().zip(g.iter()).map(|(&xi, &gi)| xi <= lb && gi > 0.0).collect(),
        None => vec![false; x.len()],
    }
}

/// Infinity norm of the projected gradient step P(x - g) - x
fn projected_gradient_norm(x: &[f64], g: &[f64], lower_bound: Option<f64>) -> f64 {
    x.iter()
        .zip(g.iter())
        .map(|(&xi, &gi)| {
            let stepped = match lower_bound {
                Some(lb) => (xi - gi).max(lb),
                None => xi - gi,
            };
            (stepped - xi).abs()
        })
        .fold(0.0, f64::max)
}

/// Two-loop recursion: returns the quasi-Newton direction -H·g on the free variables
fn two_loop_direction(g: &[f64], active: &[bool], history: &VecDeque<CurvaturePair>) -> Vec<f64> {
    let mut q: Vec<f64> = g.iter().zip(active.iter())
        .map(|(&gi, &a)| if a { 0.0 } else { gi })
        .collect();

    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let a = pair.rho * dot(&pair.s, &q);
        axpy(&mut q, -a, &pair.y);
        alphas.push(a);
    }

    let gamma = match history.back() {
        Some(last) => dot(&last.s, &last.y) / dot(&last.y, &last.y),
        None => 1.0,
    };
    for qi in q.iter_mut() {
        *qi *= gamma;
    }

    for (pair, &a) in history.iter().zip(alphas.iter().rev()) {
        let b = pair.rho * dot(&pair.y, &q);
        axpy(&mut q, a - b, &pair.s);
    }

    q.iter().zip(active.iter())
        .map(|(&qi, &a)| if a { 0.0 } else { -qi })
        .collect()
}

/// Minimize `objective` starting at `x0`
///
/// # Arguments
/// * `objective` - Closure returning (value, gradient)
/// * `x0` - Initial guess (projected onto the feasible set first)
/// * `lower_bound` - Optional uniform lower bound
/// * `memory` - Number of stored curvature pairs
/// * `tol` - Tolerance on the projected gradient and the relative decrease
/// * `max_iter` - Maximum iterations
pub fn lbfgs_solve<F>(
    objective: F,
    x0: &[f64],
    lower_bound: Option<f64>,
    memory: usize,
    tol: f64,
    max_iter: usize,
) -> LbfgsResult
where
    F: Fn(&[f64]) -> (f64, Vec<f64>),
{
    let mut x = x0.to_vec();
    project(&mut x, lower_bound);
    let (mut f, mut g) = objective(&x);

    let mut history: VecDeque<CurvaturePair> = VecDeque::with_capacity(memory.max(1));
    let mut iterations = 0;
    let mut converged = projected_gradient_norm(&x, &g, lower_bound) <= tol;

    while !converged && iterations < max_iter {
        iterations += 1;

        let active = active_set(&x, &g, lower_bound);
        let mut d = two_loop_direction(&g, &active, &history);
        let mut slope = dot(&g, &d);
        if slope >= 0.0 || slope.is_nan() {
            // Lost descent: restart from steepest descent
            history.clear();
            d = g.iter().zip(active.iter())
                .map(|(&gi, &a)| if a { 0.0 } else { -gi })
                .collect();
            slope = dot(&g, &d);
            if slope >= 0.0 || slope.is_nan() {
                converged = true;
                break;
            }
        }

        let mut t = if history.is_empty() { (1.0 / norm(&d)).min(1.0) } else { 1.0 };
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let mut x_new = x.clone();
            axpy(&mut x_new, t, &d);
            project(&mut x_new, lower_bound);
            let step: Vec<f64> = x_new.iter().zip(x.iter()).map(|(a, b)| a - b).collect();
            let (f_new, g_new) = objective(&x_new);
            if f_new.is_finite() && f_new <= f + ARMIJO_C1 * dot(&g, &step) {
                accepted = Some((x_new, step, f_new, g_new));
                break;
            }
            t *= 0.5;
        }

        let Some((x_new, s, f_new, g_new)) = accepted else {
            tracing::debug!(iterations, "L-BFGS line search failed");
            break;
        };

        let y: Vec<f64> = g_new.iter().zip(g.iter()).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-10 * dot(&y, &y) {
            if history.len() == memory.max(1) {
                history.pop_front();
            }
            history.push_back(CurvaturePair { s, y, rho: 1.0 / sy });
        }

        let rel_decrease = (f - f_new) / f.abs().max(f_new.abs()).max(1.0);
        x = x_new;
        f = f_new;
        g = g_new;

        tracing::debug!(iteration = iterations, value = f, "L-BFGS iteration");

        if rel_decrease <= tol * 1e-3 || projected_gradient_norm(&x, &g, lower_bound) <= tol {
            converged = true;
        }
    }

    LbfgsResult { x, iterations, converged, value: f }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lbfgs_bounded_quadratic() {
        // min 0.5 ||x - c||² subject to x >= 0 -> x = max(c, 0)
        let c = vec![1.0, -2.0, 3.0, -0.5];
        let objective = |x: &[f64]| {
            let r: Vec<f64> = x.iter().zip(c.iter()).map(|(a, b)| a - b).collect();
            (0.5 * dot(&r, &r), r)
        };

        let result = lbfgs_solve(objective, &[0.5; 4], Some(0.0), 5, 1e-10, 100);

        assert!(result.converged);
        let expected = [1.0, 0.0, 3.0, 0.0];
        for (xi, ei) in result.x.iter().zip(expected.iter()) {
            assert!((xi - ei).abs() < 1e-6, "Expected {}, got {}", ei, xi);
        }
    }

    #[test]
    fn test_lbfgs_rosenbrock() {
        let objective = |x: &[f64]| {
            let (a, b) = (x[0], x[1]);
            let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
            let g = vec![
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ];
            (f, g)
        };

        let result = lbfgs_solve(objective, &[-1.2, 1.0], None, 10, 1e-10, 500);

        assert!((result.x[0] - 1.0).abs() < 1e-3, "x0 = {}", result.x[0]);
        assert!((result.x[1] - 1.0).abs() < 1e-3, "x1 = {}", result.x[1]);
        assert!(result.value < 1e-6);
    }

    #[test]
    fn test_lbfgs_respects_cap_and_bound() {
        let objective = |x: &[f64]| {
            let f: f64 = x.iter().map(|v| (v + 1.0).powi(2)).sum();
            let g = x.iter().map(|v| 2.0 * (v + 1.0)).collect();
            (f, g)
        };
        let result = lbfgs_solve(objective, &[5.0, 3.0, 1.0], Some(0.0), 3, 1e-12, 2);
        assert!(result.iterations <= 2);
        assert!(result.x.iter().all(|&v| v >= 0.0));
    }
}
