//! LSMR solver
//!
//! Least Squares Minimal Residual algorithm for solving
//! min ||Ax - b||₂² + damp²||x||₂²
//! through products with A and Aᵀ only.
//!
//! Reference:
//! Fong & Saunders, "LSMR: An iterative algorithm for sparse
//! least-squares problems", SISC 2011.

use crate::utils::simd_ops::{axpy, norm, scale_inplace, xpby};

/// Outcome of an LSMR solve
#[derive(Clone, Debug)]
pub struct LsmrResult {
    pub x: Vec<f64>,
    pub iterations: usize,
    /// A stopping test was met before the iteration cap
    pub converged: bool,
    /// Estimate of ||b - Ax|| (including the damping term)
    pub residual_norm: f64,
}

/// Stable Givens rotation: returns (c, s, r) with [c s; -s c]ᵀ[a; b] = [r; 0]
fn sym_ortho(a: f64, b: f64) -> (f64, f64, f64) {
    if b == 0.0 {
        let c = if a == 0.0 { 1.0 } else { a.signum() };
        (c, 0.0, a.abs())
    } else if a == 0.0 {
        (0.0, b.signum(), b.abs())
    } else if b.abs() > a.abs() {
        let tau = a / b;
        let s = b.signum() / (1.0 + tau * tau).sqrt();
        let c = s * tau;
        (c, s, b / s)
    } else {
        let tau = b / a;
        let c = a.signum() / (1.0 + tau * tau).sqrt();
        let s = c * tau;
        (c, s, a / c)
    }
}

/// LSMR solver
///
/// # Arguments
/// * `a_op` - Closure that computes A*x
/// * `at_op` - Closure that computes Aᵀ*y
/// * `b` - Right-hand side vector
/// * `damp` - Damping parameter (0 for standard least squares)
/// * `tol` - Relative tolerance used for both the residual and normal-equation tests
/// * `max_iter` - Maximum iterations
pub fn lsmr_solve<F, G>(
    a_op: F,
    at_op: G,
    b: &[f64],
    damp: f64,
    tol: f64,
    max_iter: usize,
) -> LsmrResult
where
    F: Fn(&[f64]) -> Vec<f64>,
    G: Fn(&[f64]) -> Vec<f64>,
{
    let atol = tol;
    let btol = tol;

    let mut u = b.to_vec();
    let normb = norm(&u);
    let mut beta = normb;
    if beta > 0.0 {
        scale_inplace(&mut u, 1.0 / beta);
    }

    let mut v = at_op(&u);
    let n = v.len();
    let mut alpha = norm(&v);
    if alpha > 0.0 {
        scale_inplace(&mut v, 1.0 / alpha);
    }

    let mut x = vec![0.0; n];
    if alpha * beta == 0.0 {
        return LsmrResult { x, iterations: 0, converged: true, residual_norm: beta };
    }

    let mut zetabar = alpha * beta;
    let mut alphabar = alpha;
    let mut rho = 1.0;
    let mut rhobar = 1.0;
    let mut cbar = 1.0;
    let mut sbar = 0.0;

    let mut h = v.clone();
    let mut hbar = vec![0.0; n];

    // Residual norm estimation
    let mut betadd = beta;
    let mut betad = 0.0;
    let mut rhodold = 1.0;
    let mut tautildeold = 0.0;
    let mut thetatilde = 0.0;
    let mut zeta = 0.0;
    let mut d = 0.0;

    let mut norm_a2 = alpha * alpha;
    let mut normr = beta;
    let mut converged = false;
    let mut iterations = 0;

    for _iter in 0..max_iter {
        iterations += 1;

        // Bidiagonalization
        let mut u_new = a_op(&v);
        axpy(&mut u_new, -alpha, &u);
        u = u_new;
        beta = norm(&u);
        if beta > 0.0 {
            scale_inplace(&mut u, 1.0 / beta);
            let mut v_new = at_op(&u);
            axpy(&mut v_new, -beta, &v);
            v = v_new;
            alpha = norm(&v);
            if alpha > 0.0 {
                scale_inplace(&mut v, 1.0 / alpha);
            }
        }

        // Rotation eliminating the damping term
        let (chat, shat, alphahat) = sym_ortho(alphabar, damp);

        // Plane rotation Q_i
        let rhoold = rho;
        let (c, s, rho_new) = sym_ortho(alphahat, beta);
        rho = rho_new;
        let thetanew = s * alpha;
        alphabar = c * alpha;

        // Plane rotation Qbar_i
        let rhobarold = rhobar;
        let zetaold = zeta;
        let thetabar = sbar * rho;
        let (cbar_new, sbar_new, rhobar_new) = sym_ortho(cbar * rho, thetanew);
        cbar = cbar_new;
        sbar = sbar_new;
        rhobar = rhobar_new;
        zeta = cbar * zetabar;
        zetabar = -sbar * zetabar;

        // Update h, hbar, x
        xpby(&mut hbar, &h, -(thetabar * rho / (rhoold * rhobarold)));
        axpy(&mut x, zeta / (rho * rhobar), &hbar);
        xpby(&mut h, &v, -(thetanew / rho));

        // Estimate ||r||
        let betaacute = chat * betadd;
        let betacheck = -shat * betadd;
        let betahat = c * betaacute;
        betadd = -s * betaacute;

        let thetatildeold = thetatilde;
        let (ctildeold, stildeold, rhotildeold) = sym_ortho(rhodold, thetabar);
        thetatilde = stildeold * rhobar;
        rhodold = ctildeold * rhobar;
        betad = -stildeold * betad + ctildeold * betahat;

        tautildeold = (zetaold - thetatildeold * tautildeold) / rhotildeold;
        let taud = (zeta - thetatilde * tautildeold) / rhodold;
        d += betacheck * betacheck;
        normr = (d + (betad - taud).powi(2) + betadd * betadd).sqrt();

        // Estimate ||A||
        norm_a2 += beta * beta;
        let norm_a = norm_a2.sqrt();
        norm_a2 += alpha * alpha;

        let normar = zetabar.abs();
        let normx = norm(&x);

        // Stopping tests
        let test1 = normr / normb;
        let test2 = if norm_a * normr > 0.0 { normar / (norm_a * normr) } else { 0.0 };
        let rtol = btol + atol * norm_a * normx / normb;

        if test1 <= rtol || test2 <= atol || !normr.is_finite() {
            converged = normr.is_finite();
            break;
        }
    }

    LsmrResult { x, iterations, converged, residual_norm: normr }
}
