//! Iterative solvers for the reconstruction problem
//!
//! - CG: Conjugate gradient on normal equations
//! - LSMR: Least squares minimal residual
//! - L-BFGS: Projected limited-memory quasi-Newton (bounded, smooth losses)

pub mod cg;
pub mod lbfgs;
pub mod lsmr;

pub use cg::*;
pub use lbfgs::*;
pub use lsmr::*;
