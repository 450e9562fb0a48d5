//! Conjugate Gradient solver
//!
//! Solves Ax = b for symmetric positive (semi-)definite A, used on the
//! normal equations of the reconstruction problem.

use crate::utils::simd_ops::{axpy, dot, norm, sub_from, xpby};

/// Outcome of a CG solve
#[derive(Clone, Debug)]
pub struct CgResult {
    pub x: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Conjugate gradient on `A x = b` with `A` given as a closure
///
/// Starts from `x0` and stops once `‖b - A x‖ < tol·‖b‖` or after
/// `max_iter` iterations. A vanishing curvature `pᵀAp` ends the solve early
/// without convergence.
pub fn cg_solve<F>(a_op: F, b: &[f64], x0: &[f64], tol: f64, max_iter: usize) -> CgResult
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let mut x = x0.to_vec();
    let mut r = sub_from(b, &a_op(&x));
    let threshold = tol * norm(b);

    let mut rr = dot(&r, &r);
    if threshold == 0.0 || rr.sqrt() <= threshold {
        return CgResult { x, iterations: 0, converged: true };
    }

    let mut p = r.clone();
    let mut iterations = 0;
    let mut converged = false;
    while iterations < max_iter {
        iterations += 1;
        let ap = a_op(&p);
        let curvature = dot(&p, &ap);
        if curvature.abs() < 1e-20 {
            break;
        }

        let step = rr / curvature;
        axpy(&mut x, step, &p);
        axpy(&mut r, -step, &ap);

        let rr_next = dot(&r, &r);
        if rr_next.sqrt() < threshold {
            converged = true;
            break;
        }
        xpby(&mut p, &r, rr_next / rr);
        rr = rr_next;
    }

    CgResult { x, iterations, converged }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cg_identity() {
        let b = [1.0, 2.0, 3.0];
        let result = cg_solve(|v| v.to_vec(), &b, &[0.0; 3], 1e-10, 100);

        assert!(result.converged);
        for (xi, bi) in result.x.iter().zip(b.iter()) {
            assert!((xi - bi).abs() < 1e-8);
        }
    }

    #[test]
    fn test_cg_diagonal() {
        let diag = [2.0, 3.0, 4.0];
        let result = cg_solve(
            |v| v.iter().zip(diag.iter()).map(|(vi, di)| vi * di).collect(),
            &[2.0, 6.0, 12.0],
            &[0.0; 3],
            1e-10,
            100,
        );

        for (xi, ei) in result.x.iter().zip([1.0, 2.0, 3.0].iter()) {
            assert!((xi - ei).abs() < 1e-8, "expected {}, got {}", ei, xi);
        }
    }

    #[test]
    fn test_cg_warm_start_at_solution() {
        let b = vec![2.0, 4.0];
        let result = cg_solve(|v| v.iter().map(|x| 2.0 * x).collect(), &b, &[1.0, 2.0], 1e-10, 10);
        assert_eq!(result.iterations, 0);
        assert!(result.converged);
    }
}
