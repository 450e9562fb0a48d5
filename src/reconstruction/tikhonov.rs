//! Penalized least-squares solve shared by Tikhonov and the ADMM inner step
//!
//! Minimizes
//!
//! 0.5 Σ ρ((y - Ax)²) + w ||Dx - t||₂²
//!
//! For the linear loss this is the stacked least-squares system
//! `[A; √(2w)D] x ≈ [y; √(2w)t]`, solved for the update from the warm start
//! with LSMR or CG on the normal equations. Robust losses go through the
//! bounded (x ≥ 0) L-BFGS solver.

use super::loss::DataLoss;
use super::regularizer::DifferentialOperator;
use super::Minimizer;
use crate::operator::ForwardOperator;
use crate::solvers::{cg_solve, lbfgs_solve, lsmr_solve};
use crate::utils::simd_ops::{axpy, dot};

/// Relative tolerance of the inner Krylov / quasi-Newton solvers
pub const SOLVER_TOLERANCE: f64 = 1e-6;

/// Curvature pairs kept by L-BFGS
const LBFGS_MEMORY: usize = 10;

/// One penalized problem instance
pub struct PenalizedProblem<'a> {
    pub op: &'a ForwardOperator,
    pub reg: &'a DifferentialOperator,
    /// Weight `w` of the penalty term
    pub weight: f64,
    /// Penalty target `t`; zero when absent
    pub target: Option<&'a [f64]>,
    pub loss: DataLoss,
}

/// Result of a penalized solve
#[derive(Clone, Debug)]
pub struct PenalizedSolve {
    pub x: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
}

impl<'a> PenalizedProblem<'a> {
    /// D·x - t
    fn penalty_residual(&self, x: &[f64]) -> Vec<f64> {
        let mut dx = self.reg.apply(x);
        if let Some(t) = self.target {
            axpy(&mut dx, -1.0, t);
        }
        dx
    }

    /// Objective value at `x`
    pub fn objective(&self, x: &[f64]) -> f64 {
        let r = self.op.residual(x);
        let p = self.penalty_residual(x);
        self.loss.cost(&r) + self.weight * dot(&p, &p)
    }

    /// Objective value and gradient at `x`
    pub fn objective_and_gradient(&self, x: &[f64]) -> (f64, Vec<f64>) {
        let r = self.op.residual(x);
        let p = self.penalty_residual(x);
        let value = self.loss.cost(&r) + self.weight * dot(&p, &p);

        // -Aᵀ(ρ'·r) + 2w Dᵀ(Dx - t)
        let mut grad = self.op.apply_adjoint(&self.loss.weighted_residual(&r));
        for g in grad.iter_mut() {
            *g = -*g;
        }
        axpy(&mut grad, 2.0 * self.weight, &self.reg.apply_adjoint(&p));
        (value, grad)
    }

    /// Solve from the warm start `x0` with at most `max_iter` iterations
    ///
    /// The returned iterate never has a larger objective than `x0`.
    pub fn solve(&self, x0: &[f64], minimizer: Minimizer, max_iter: usize) -> PenalizedSolve {
        let candidate = match (self.loss.is_linear(), minimizer) {
            (true, Minimizer::Lsmr) => self.solve_lsmr(x0, max_iter),
            (true, Minimizer::Cg) => self.solve_cg(x0, max_iter),
            _ => self.solve_lbfgs(x0, max_iter),
        };

        if self.objective(&candidate.x) > self.objective(x0) {
            tracing::debug!("penalized solve did not improve on the warm start");
            return PenalizedSolve { x: x0.to_vec(), converged: false, iterations: candidate.iterations };
        }
        candidate
    }

    fn solve_lsmr(&self, x0: &[f64], max_iter: usize) -> PenalizedSolve {
        let n = x0.len();
        let m = self.op.n_observations();
        let s = (2.0 * self.weight).sqrt();

        // Right-hand side for the update dx: [y - Ax0; s(t - Dx0)]
        let mut rhs = self.op.residual(x0);
        rhs.extend(self.penalty_residual(x0).into_iter().map(|p| -s * p));

        let a_op = |v: &[f64]| {
            let mut out = self.op.apply(v);
            out.extend(self.reg.apply(v).into_iter().map(|d| s * d));
            out
        };
        let at_op = |u: &[f64]| {
            let mut out = self.op.apply_adjoint(&u[..m]);
            axpy(&mut out, s, &self.reg.apply_adjoint(&u[m..]));
            out
        };

        let result = lsmr_solve(a_op, at_op, &rhs, 0.0, SOLVER_TOLERANCE, max_iter);
        let mut x = x0.to_vec();
        debug_assert_eq!(result.x.len(), n);
        axpy(&mut x, 1.0, &result.x);
        tracing::debug!(iterations = result.iterations, residual = result.residual_norm, "LSMR solve");
        PenalizedSolve { x, converged: result.converged, iterations: result.iterations }
    }

    fn solve_cg(&self, x0: &[f64], max_iter: usize) -> PenalizedSolve {
        let two_w = 2.0 * self.weight;

        // (AᵀA + 2w DᵀD) dx = Aᵀ(y - Ax0) - 2w Dᵀ(Dx0 - t)
        let mut b = self.op.apply_adjoint(&self.op.residual(x0));
        axpy(&mut b, -two_w, &self.reg.apply_adjoint(&self.penalty_residual(x0)));

        let normal_op = |v: &[f64]| {
            let mut out = self.op.apply_adjoint(&self.op.apply(v));
            axpy(&mut out, two_w, &self.reg.apply_adjoint(&self.reg.apply(v)));
            out
        };

        let result = cg_solve(normal_op, &b, &vec![0.0; x0.len()], SOLVER_TOLERANCE, max_iter);
        let mut x = x0.to_vec();
        axpy(&mut x, 1.0, &result.x);
        tracing::debug!(iterations = result.iterations, "CG solve");
        PenalizedSolve { x, converged: result.converged, iterations: result.iterations }
    }

    fn solve_lbfgs(&self, x0: &[f64], max_iter: usize) -> PenalizedSolve {
        let result = lbfgs_solve(
            |x| self.objective_and_gradient(x),
            x0,
            Some(0.0),
            LBFGS_MEMORY,
            SOLVER_TOLERANCE,
            max_iter,
        );
        tracing::debug!(iterations = result.iterations, value = result.value, "L-BFGS solve");
        PenalizedSolve { x: result.x, converged: result.converged, iterations: result.iterations }
    }
}
