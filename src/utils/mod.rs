//! Utility functions shared by the solvers
//!
//! - Finite-difference gradient and its transpose
//! - Separable Gaussian smoothing
//! - SIMD-accelerated vector kernels (optional, with `simd` feature)

pub mod gradient;
pub mod simd_ops;
pub mod smoothing;

pub use gradient::*;
pub use simd_ops::*;
pub use smoothing::*;
