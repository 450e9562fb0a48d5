//! Robust data losses on squared residuals
//!
//! Each loss is a function ρ(z) of the squared residual z = r², with unit
//! scale, so that `0.5 Σ ρ(r²)` reduces to ordinary least squares for
//! `Linear`.

use serde::{Deserialize, Serialize};

/// Data loss applied to each squared slice residual
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLoss {
    /// ρ(z) = z
    #[default]
    Linear,
    /// ρ(z) = 2(√(1+z) - 1)
    SoftL1,
    /// ρ(z) = z for z ≤ 1, 2√z - 1 otherwise
    Huber,
    /// ρ(z) = arctan(z)
    Arctan,
    /// ρ(z) = ln(1 + z)
    Cauchy,
}

impl DataLoss {
    /// Whether the loss needs a non-linear minimizer
    pub fn is_linear(self) -> bool {
        matches!(self, DataLoss::Linear)
    }

    /// ρ(z) and ρ'(z)
    #[inline]
    pub fn evaluate(self, z: f64) -> (f64, f64) {
        match self {
            DataLoss::Linear => (z, 1.0),
            DataLoss::SoftL1 => {
                let t = (1.0 + z).sqrt();
                (2.0 * (t - 1.0), 1.0 / t)
            }
            DataLoss::Huber => {
                if z <= 1.0 {
                    (z, 1.0)
                } else {
                    let s = z.sqrt();
                    (2.0 * s - 1.0, 1.0 / s)
                }
            }
            DataLoss::Arctan => (z.atan(), 1.0 / (1.0 + z * z)),
            DataLoss::Cauchy => ((1.0 + z).ln(), 1.0 / (1.0 + z)),
        }
    }

    /// 0.5 Σ ρ(r²)
    pub fn cost(self, residual: &[f64]) -> f64 {
        0.5 * residual.iter().map(|&r| self.evaluate(r * r).0).sum::<f64>()
    }

    /// Residuals reweighted by ρ'(r²), the factor entering the gradient
    pub fn weighted_residual(self, residual: &[f64]) -> Vec<f64> {
        residual.iter().map(|&r| self.evaluate(r * r).1 * r).collect()
    }
}
