//! Differential operators behind the regularization terms
//!
//! - Identity: D = I (TK0)
//! - Gradient: D = ∇, forward differences stacked as [gx; gy; gz] (TK1, TV)

use crate::utils::gradient::{forward_gradient, gradient_adjoint};
use crate::volume::GridSpec;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DifferentialOperator {
    Identity,
    Gradient {
        dims: (usize, usize, usize),
        spacing: (f64, f64, f64),
    },
}

impl DifferentialOperator {
    pub fn gradient(grid: &GridSpec) -> Self {
        DifferentialOperator::Gradient { dims: grid.dims, spacing: grid.spacing }
    }

    /// Length of D·x for a volume of `n` voxels
    pub fn output_len(&self, n: usize) -> usize {
        match self {
            DifferentialOperator::Identity => n,
            DifferentialOperator::Gradient { .. } => 3 * n,
        }
    }

    /// D·x
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        match *self {
            DifferentialOperator::Identity => x.to_vec(),
            DifferentialOperator::Gradient { dims, spacing } => {
                let mut out = vec![0.0; 3 * x.len()];
                forward_gradient(&mut out, x, dims, spacing);
                out
            }
        }
    }

    /// Dᵀ·g
    pub fn apply_adjoint(&self, g: &[f64]) -> Vec<f64> {
        match *self {
            DifferentialOperator::Identity => g.to_vec(),
            DifferentialOperator::Gradient { dims, spacing } => {
                let mut out = vec![0.0; g.len() / 3];
                gradient_adjoint(&mut out, g, dims, spacing);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::simd_ops::dot;

    #[test]
    fn test_gradient_adjoint_identity() {
        let grid = GridSpec::axis_aligned((5, 4, 3), (1.0, 2.0, 0.5), [0.0; 3]).unwrap();
        let d = DifferentialOperator::gradient(&grid);
        let n = grid.len();
        let x: Vec<f64> = (0..n).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
        let g: Vec<f64> = (0..3 * n).map(|i| ((i * 5) % 13) as f64 * 0.1).collect();

        let lhs = dot(&d.apply(&x), &g);
        let rhs = dot(&x, &d.apply_adjoint(&g));
        assert!((lhs - rhs).abs() < 1e-9 * lhs.abs().max(1.0), "{} vs {}", lhs, rhs);
    }

    #[test]
    fn test_output_len() {
        let grid = GridSpec::axis_aligned((2, 2, 2), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        assert_eq!(DifferentialOperator::Identity.output_len(8), 8);
        assert_eq!(DifferentialOperator::gradient(&grid).output_len(8), 24);
        assert_eq!(DifferentialOperator::gradient(&grid).apply(&[1.0; 8]), vec![0.0; 24]);
    }
}
