//! Run configuration
//!
//! One immutable record for the whole reconstruction, loaded from JSON with
//! defaults for every missing field and validated once before any
//! optimization starts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::reconstruction::{DataLoss, Minimizer, RegularizationType, SolverProfile, SolverStrategy};
use crate::registration::RegistrationSettings;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Stack that defines the reconstruction space; never registered
    pub target_stack_index: usize,
    pub reg_type: RegularizationType,
    /// Regularization weight for the cycles after the first estimate
    pub alpha: f64,
    /// Regularization weight for the first estimate
    pub alpha_first: f64,
    pub iter_max: usize,
    pub iter_max_first: usize,
    /// ADMM penalty (TV only)
    pub rho: f64,
    /// ADMM outer iterations (TV only)
    pub admm_iterations: usize,
    pub two_step_cycles: usize,
    pub data_loss: DataLoss,
    pub minimizer: Minimizer,
    /// Isotropic voxel size of the reconstruction grid (mm); target
    /// in-plane spacing when absent
    pub isotropic_resolution: Option<f64>,
    /// Margin added around the target stack field of view (mm)
    pub extra_frame_target: f64,
    /// Scale every stack linearly to the target stack's intensities
    pub intensity_correction: bool,
    /// Gaussian standard deviation (mm) of the scattered data approximation
    /// that builds the first estimate from all stacks; `None` starts from
    /// the target stack alone
    pub sigma: Option<f64>,
    pub registration: RegistrationSettings,
    /// Directory for per-cycle checkpoints
    pub dir_output: Option<PathBuf>,
    pub write_motion_correction: bool,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            target_stack_index: 0,
            reg_type: RegularizationType::Tk1,
            alpha: 0.03,
            alpha_first: 0.1,
            iter_max: 10,
            iter_max_first: 5,
            rho: 0.5,
            admm_iterations: 10,
            two_step_cycles: 3,
            data_loss: DataLoss::Linear,
            minimizer: Minimizer::Lsmr,
            isotropic_resolution: None,
            extra_frame_target: 0.0,
            intensity_correction: false,
            sigma: Some(0.9),
            registration: RegistrationSettings::default(),
            dir_output: None,
            write_motion_correction: false,
        }
    }
}

fn config_error(msg: impl Into<String>) -> SrrError {
    SrrError::Config(msg.into())
}

impl ReconstructionConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| config_error(format!("invalid configuration: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration against `n_stacks` input stacks
    pub fn validate(&self, n_stacks: usize) -> Result<()> {
        if n_stacks == 0 {
            return Err(config_error("at least one stack is required"));
        }
        if self.target_stack_index >= n_stacks {
            return Err(config_error(format!(
                "target_stack_index {} out of range for {} stacks",
                self.target_stack_index, n_stacks
            )));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(config_error("alpha must be positive"));
        }
        if !(self.alpha_first.is_finite() && self.alpha_first > 0.0) {
            return Err(config_error("alpha_first must be positive"));
        }
        if self.iter_max == 0 || self.iter_max_first == 0 {
            return Err(config_error("iteration caps must be positive"));
        }
        if self.reg_type == RegularizationType::Tv {
            if !(self.rho.is_finite() && self.rho > 0.0) {
                return Err(config_error("rho must be positive for TV"));
            }
            if self.admm_iterations == 0 {
                return Err(config_error("admm_iterations must be positive for TV"));
            }
        }
        if !self.data_loss.is_linear() && self.minimizer != Minimizer::Lbfgs {
            return Err(config_error(format!(
                "data loss {:?} requires the lbfgs minimizer",
                self.data_loss
            )));
        }
        if let Some(res) = self.isotropic_resolution {
            if !(res.is_finite() && res > 0.0) {
                return Err(config_error("isotropic_resolution must be positive"));
            }
        }
        if let Some(sigma) = self.sigma {
            if !(sigma.is_finite() && sigma >= 0.0) {
                return Err(config_error("sigma must be non-negative"));
            }
        }
        if !(self.extra_frame_target.is_finite() && self.extra_frame_target >= 0.0) {
            return Err(config_error("extra_frame_target must be non-negative"));
        }
        if self.registration.max_iterations == 0 {
            return Err(config_error("registration max_iterations must be positive"));
        }
        if self.write_motion_correction && self.dir_output.is_none() {
            return Err(config_error("write_motion_correction requires dir_output"));
        }
        Ok(())
    }

    /// Profile of the initial reconstruction
    pub fn first_profile(&self) -> SolverProfile {
        SolverProfile { alpha: self.alpha_first, iter_max: self.iter_max_first }
    }

    /// Profile of the reconstructions inside the cycles
    pub fn subsequent_profile(&self) -> SolverProfile {
        SolverProfile { alpha: self.alpha, iter_max: self.iter_max }
    }

    pub fn solver_strategy(&self) -> SolverStrategy {
        SolverStrategy::new(self.reg_type, self.data_loss, self.minimizer, self.rho, self.admm_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformType;

    #[test]
    fn test_defaults() {
        let config = ReconstructionConfig::default();
        assert_eq!(config.reg_type, RegularizationType::Tk1);
        assert_eq!(config.alpha, 0.03);
        assert_eq!(config.alpha_first, 0.1);
        assert_eq!(config.iter_max, 10);
        assert_eq!(config.iter_max_first, 5);
        assert_eq!(config.two_step_cycles, 3);
        assert_eq!(config.sigma, Some(0.9));
        assert_eq!(config.registration.transform_type, TransformType::Rigid);
        assert!(config.validate(1).is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = ReconstructionConfig::from_json(
            r#"{"reg_type": "TV", "alpha": 0.01, "registration": {"intensity_correction": "affine"}}"#,
        )
        .unwrap();
        assert_eq!(config.reg_type, RegularizationType::Tv);
        assert_eq!(config.alpha, 0.01);
        assert_eq!(config.rho, 0.5);
        assert_eq!(config.registration.max_iterations, 20);
        assert!(matches!(config.solver_strategy(), SolverStrategy::TotalVariation { .. }));

        let round_trip = ReconstructionConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(round_trip, config);
    }

    #[test]
    fn test_validation_errors() {
        let bad = [
            ReconstructionConfig { alpha: 0.0, ..Default::default() },
            ReconstructionConfig { alpha_first: -1.0, ..Default::default() },
            ReconstructionConfig { iter_max: 0, ..Default::default() },
            ReconstructionConfig { reg_type: RegularizationType::Tv, rho: 0.0, ..Default::default() },
            ReconstructionConfig { data_loss: DataLoss::Huber, ..Default::default() },
            ReconstructionConfig { target_stack_index: 3, ..Default::default() },
            ReconstructionConfig { write_motion_correction: true, ..Default::default() },
            ReconstructionConfig { isotropic_resolution: Some(0.0), ..Default::default() },
            ReconstructionConfig { sigma: Some(-0.5), ..Default::default() },
        ];
        for config in bad.iter() {
            assert!(matches!(config.validate(2), Err(SrrError::Config(_))), "{:?}", config);
        }
        assert!(ReconstructionConfig::default().validate(0).is_err());

        let robust = ReconstructionConfig { data_loss: DataLoss::Huber, minimizer: Minimizer::Lbfgs, ..Default::default() };
        assert!(robust.validate(2).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(ReconstructionConfig::from_json("{"), Err(SrrError::Config(_))));
        assert!(matches!(
            ReconstructionConfig::from_json(r#"{"reg_type": "TK2"}"#),
            Err(SrrError::Config(_))
        ));
    }
}
