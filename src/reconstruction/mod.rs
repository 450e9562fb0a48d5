//! Regularized inverse problem for the high-resolution volume
//!
//! Solves min_V 0.5 Σ ρ((y - AV)²) + α R(V) with
//! - TK0: R = ||V||₂²
//! - TK1: R = ||∇V||₂²
//! - TV:  R = ||∇V||₁ (ADMM)
//!
//! The regularization / loss / minimizer combination is resolved once per
//! run into a `SolverStrategy`.

pub mod loss;
pub mod regularizer;
pub mod tikhonov;
pub mod tv;

pub use loss::DataLoss;
pub use regularizer::DifferentialOperator;
pub use tikhonov::{PenalizedProblem, PenalizedSolve, SOLVER_TOLERANCE};
pub use tv::{shrink, tv_admm, tv_admm_with_progress, tv_objective, TvSettings, TvSolve};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::operator::ForwardOperator;
use crate::utils::simd_ops::{dot, norm};
use crate::volume::Volume;

/// Regularization functional
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegularizationType {
    /// Zeroth-order Tikhonov: ||V||₂²
    #[serde(rename = "TK0")]
    Tk0,
    /// First-order Tikhonov: ||∇V||₂²
    #[default]
    #[serde(rename = "TK1")]
    Tk1,
    /// Total variation: ||∇V||₁
    #[serde(rename = "TV")]
    Tv,
}

/// Inner minimizer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Minimizer {
    /// LSMR on the stacked least-squares system (linear loss only)
    #[default]
    Lsmr,
    /// Conjugate gradient on the normal equations (linear loss only)
    Cg,
    /// Bounded L-BFGS (any loss, V ≥ 0)
    Lbfgs,
}

/// Weight and iteration cap of one solve
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverProfile {
    pub alpha: f64,
    pub iter_max: usize,
}

/// Solver resolved from the configuration
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SolverStrategy {
    Tikhonov {
        regularization: RegularizationType,
        loss: DataLoss,
        minimizer: Minimizer,
    },
    TotalVariation {
        loss: DataLoss,
        minimizer: Minimizer,
        rho: f64,
        admm_iterations: usize,
    },
}

/// Result of one reconstruction solve
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    /// Best iterate, on the input grid
    pub volume: Volume,
    pub converged: bool,
    pub iterations: usize,
    /// ||y - AV||₂
    pub data_residual: f64,
    /// Objective value of the returned volume
    pub objective: f64,
}

impl SolverStrategy {
    pub fn new(
        regularization: RegularizationType,
        loss: DataLoss,
        minimizer: Minimizer,
        rho: f64,
        admm_iterations: usize,
    ) -> Self {
        match regularization {
            RegularizationType::Tv => SolverStrategy::TotalVariation { loss, minimizer, rho, admm_iterations },
            _ => SolverStrategy::Tikhonov { regularization, loss, minimizer },
        }
    }

    pub fn loss(&self) -> DataLoss {
        match *self {
            SolverStrategy::Tikhonov { loss, .. } | SolverStrategy::TotalVariation { loss, .. } => loss,
        }
    }

    /// Full objective 0.5 Σ ρ(r²) + α R(V)
    pub fn objective(&self, op: &ForwardOperator, volume: &Volume, alpha: f64) -> f64 {
        match *self {
            SolverStrategy::Tikhonov { regularization, loss, .. } => {
                let reg = tikhonov_operator(regularization, volume);
                let d = reg.apply(&volume.data);
                loss.cost(&op.residual(&volume.data)) + alpha * dot(&d, &d)
            }
            SolverStrategy::TotalVariation { loss, .. } => {
                tv_objective(op, &DifferentialOperator::gradient(&volume.grid), loss, alpha, &volume.data)
            }
        }
    }

    /// Reconstruct from the warm start `volume`
    pub fn solve(&self, op: &ForwardOperator, volume: Volume, profile: SolverProfile) -> Result<SolveOutcome> {
        if volume.len() != op.n_voxels() {
            return Err(SrrError::GridMismatch {
                expected: volume.dims(),
                actual: (op.n_voxels(), 1, 1),
            });
        }

        let (x, converged, iterations) = match *self {
            SolverStrategy::Tikhonov { regularization, loss, minimizer } => {
                let reg = tikhonov_operator(regularization, &volume);
                let problem = PenalizedProblem {
                    op,
                    reg: &reg,
                    weight: profile.alpha,
                    target: None,
                    loss,
                };
                let result = problem.solve(&volume.data, minimizer, profile.iter_max);
                (result.x, result.converged, result.iterations)
            }
            SolverStrategy::TotalVariation { loss, minimizer, rho, admm_iterations } => {
                let grad = DifferentialOperator::gradient(&volume.grid);
                let settings = TvSettings {
                    alpha: profile.alpha,
                    rho,
                    admm_iterations,
                    inner_iterations: profile.iter_max,
                    loss,
                    minimizer,
                };
                let result = tv_admm(op, &grad, &volume.data, &settings);
                (result.x, result.converged, result.iterations)
            }
        };

        let mut volume = volume;
        volume.data = x;
        let data_residual = norm(&op.residual(&volume.data));
        let objective = self.objective(op, &volume, profile.alpha);

        tracing::info!(
            converged,
            iterations,
            data_residual,
            objective,
            alpha = profile.alpha,
            "reconstruction solve finished"
        );

        Ok(SolveOutcome { volume, converged, iterations, data_residual, objective })
    }
}

fn tikhonov_operator(regularization: RegularizationType, volume: &Volume) -> DifferentialOperator {
    match regularization {
        RegularizationType::Tk0 => DifferentialOperator::Identity,
        _ => DifferentialOperator::gradient(&volume.grid),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::operator::ForwardOperator;
    use crate::transform::TransformType;
    use crate::volume::phantom::{blob_volume, simulate_stack};
    use crate::volume::GridSpec;

    /// Operator of one thick-slice stack over an 8³ blob; returns the
    /// operator, the volume grid and the ground truth data
    pub(crate) fn single_stack_operator() -> (ForwardOperator, GridSpec, Vec<f64>) {
        let truth = blob_volume(8, 6.0).unwrap();
        let grid = GridSpec::axis_aligned((8, 8, 4), (1.0, 1.0, 2.0), [0.0, 0.0, 0.5]).unwrap();
        let stack = simulate_stack(&truth, "axial", grid, TransformType::Rigid).unwrap();
        let (op, failures) = ForwardOperator::new(&truth.grid, &[stack]);
        assert!(failures.is_empty());
        (op, truth.grid.clone(), truth.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixtures::single_stack_operator;

    fn volume_from(grid: &crate::volume::GridSpec, data: Vec<f64>) -> Volume {
        Volume::new(data, grid.clone()).unwrap()
    }

    #[test]
    fn test_idempotent_without_regularization() {
        // Observations generated by the truth with identity poses: the
        // truth is already optimal and stays put
        let (op, grid, truth) = single_stack_operator();
        let strategy = SolverStrategy::new(RegularizationType::Tk1, DataLoss::Linear, Minimizer::Lsmr, 0.5, 10);
        let outcome = strategy
            .solve(&op, volume_from(&grid, truth.clone()), SolverProfile { alpha: 0.0, iter_max: 10 })
            .unwrap();

        for (a, b) in outcome.volume.data.iter().zip(truth.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        assert!(outcome.data_residual < 1e-9);
    }

    #[test]
    fn test_tikhonov_reduces_objective() {
        let (op, grid, _) = single_stack_operator();
        let start = volume_from(&grid, vec![0.0; grid.len()]);
        for reg in [RegularizationType::Tk0, RegularizationType::Tk1] {
            let strategy = SolverStrategy::new(reg, DataLoss::Linear, Minimizer::Lsmr, 0.5, 10);
            let profile = SolverProfile { alpha: 0.03, iter_max: 10 };
            let before = strategy.objective(&op, &start, profile.alpha);
            let outcome = strategy.solve(&op, start.clone(), profile).unwrap();
            assert!(outcome.objective < before, "{:?}", reg);
            assert!(outcome.iterations <= 10);
            assert_eq!(outcome.volume.dims(), grid.dims);
        }
    }

    #[test]
    fn test_tv_strategy_runs() {
        let (op, grid, _) = single_stack_operator();
        let strategy = SolverStrategy::new(RegularizationType::Tv, DataLoss::Linear, Minimizer::Lsmr, 0.5, 3);
        assert!(matches!(strategy, SolverStrategy::TotalVariation { admm_iterations: 3, .. }));
        let outcome = strategy
            .solve(&op, volume_from(&grid, vec![0.0; grid.len()]), SolverProfile { alpha: 0.01, iter_max: 5 })
            .unwrap();
        assert!(outcome.objective.is_finite());
        assert!(outcome.volume.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_robust_loss_keeps_nonnegative() {
        let (op, grid, _) = single_stack_operator();
        let strategy = SolverStrategy::new(RegularizationType::Tk1, DataLoss::SoftL1, Minimizer::Lbfgs, 0.5, 10);
        let outcome = strategy
            .solve(&op, volume_from(&grid, vec![0.0; grid.len()]), SolverProfile { alpha: 0.03, iter_max: 20 })
            .unwrap();
        assert!(outcome.volume.data.iter().all(|&v| v >= 0.0));
        assert_eq!(strategy.loss(), DataLoss::SoftL1);
    }

    #[test]
    fn test_grid_mismatch() {
        let (op, _, _) = single_stack_operator();
        let grid = crate::volume::GridSpec::axis_aligned((2, 2, 2), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        let strategy = SolverStrategy::new(RegularizationType::Tk0, DataLoss::Linear, Minimizer::Cg, 0.5, 10);
        let result = strategy.solve(&op, Volume::zeros(grid), SolverProfile { alpha: 0.1, iter_max: 5 });
        assert!(matches!(result, Err(SrrError::GridMismatch { .. })));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&RegularizationType::Tk1).unwrap(), "\"TK1\"");
        let parsed: RegularizationType = serde_json::from_str("\"TV\"").unwrap();
        assert_eq!(parsed, RegularizationType::Tv);
        assert_eq!(serde_json::to_string(&Minimizer::Lbfgs).unwrap(), "\"lbfgs\"");
    }
}
