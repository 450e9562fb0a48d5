//! Slice-to-volume registration
//!
//! Estimates one rigid or affine pose per slice (and optionally an affine
//! intensity correction) by minimizing the squared difference between the
//! slice and the volume sampled through the forward operator:
//!
//! r(θ, s, b) = s · A(θ)V + b - y
//!
//! Parameters are z-score normalized over the stack before optimization
//! (`normalization`) and solved with Levenberg-Marquardt (`optimizer`).
//! Slices are optimized in parallel; poses are committed once all slices of
//! the stack have finished.

pub mod moments;
pub mod normalization;
pub mod optimizer;

pub use moments::moments_translation;
pub use normalization::ParameterNormalization;
pub use optimizer::{levenberg_marquardt, LmOutcome, LmSettings};

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::operator::{PointSpreadFunction, SliceSampler};
use crate::transform::{is_invertible, params_to_matrix, SlicePose, TransformType};
use crate::volume::{SliceStack, Volume};

/// Start-pose strategy applied before the first optimization of a slice
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializerType {
    Identity,
    #[default]
    Moments,
}

/// Per-slice intensity model fitted alongside the pose
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityCorrectionType {
    #[default]
    None,
    /// y ≈ s · prediction + b
    Affine,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    pub transform_type: TransformType,
    pub initializer: InitializerType,
    pub intensity_correction: IntensityCorrectionType,
    pub max_iterations: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            transform_type: TransformType::Rigid,
            initializer: InitializerType::Moments,
            intensity_correction: IntensityCorrectionType::None,
            max_iterations: 20,
        }
    }
}

/// Why a slice kept its previous pose
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceFailure {
    TooFewPixels,
    Degenerate,
    NonFinite,
    CostIncrease,
}

/// Successful per-slice estimate, committed after the barrier
#[derive(Clone, Debug)]
struct SliceEstimate {
    pose: SlicePose,
    intensity: [f64; 2],
    initial_cost: f64,
    cost: f64,
}

/// Outcome of registering one stack
#[derive(Clone, Debug, Default)]
pub struct StackRegistrationReport {
    pub registered: usize,
    pub failed: usize,
    /// Sum of final per-slice costs
    pub cost: f64,
    /// Sum of per-slice costs at the start poses
    pub initial_cost: f64,
}

/// Registers the slices of a stack against the current volume estimate
#[derive(Clone, Debug, Default)]
pub struct SliceToVolumeRegistration {
    settings: RegistrationSettings,
}

/// Smallest in-mask pixel count that constrains a pose
fn min_pixels(n_params: usize) -> usize {
    (2 * n_params).max(16)
}

impl SliceToVolumeRegistration {
    pub fn new(settings: RegistrationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RegistrationSettings {
        &self.settings
    }

    /// Number of optimized parameters per slice
    fn n_params(&self) -> usize {
        let extra = match self.settings.intensity_correction {
            IntensityCorrectionType::None => 0,
            IntensityCorrectionType::Affine => 2,
        };
        self.settings.transform_type.n_params() + extra
    }

    /// Parameter row of every slice (pose, then intensity if fitted)
    fn parameter_matrix(&self, poses: &[SlicePose], stack: &SliceStack) -> Array2<f64> {
        let n = self.n_params();
        let n_spatial = self.settings.transform_type.n_params();
        let mut m = Array2::zeros((poses.len(), n));
        for (k, (pose, slice)) in poses.iter().zip(stack.slices.iter()).enumerate() {
            for (c, &v) in pose.params.iter().take(n_spatial).enumerate() {
                m[[k, c]] = v;
            }
            if n > n_spatial {
                m[[k, n_spatial]] = slice.intensity[0];
                m[[k, n_spatial + 1]] = slice.intensity[1];
            }
        }
        m
    }

    /// Register every slice of `stack` to `volume` and commit the new poses
    ///
    /// Slices whose optimization fails keep their previous pose. Fails with
    /// `StackRegistrationFailed` when no slice of the stack succeeds.
    pub fn register_stack(&self, volume: &Volume, stack: &mut SliceStack, stack_index: usize) -> Result<StackRegistrationReport> {
        // Previous poses in the current motion model, and the start poses
        // derived from them; neither touches the stack before the barrier
        let tt = self.settings.transform_type;
        let previous: Vec<SlicePose> = stack.slices.iter().map(|s| convert_pose(&s.pose, tt)).collect();
        let mut starts = previous.clone();
        if self.settings.initializer == InitializerType::Moments {
            for (k, start) in starts.iter_mut().enumerate() {
                if !start.is_identity() {
                    continue;
                }
                if let Some(shift) = moments_translation(volume, stack, stack_index, k) {
                    start.translate(&shift);
                }
            }
        }

        let start_params = self.parameter_matrix(&starts, stack);
        let previous_params = self.parameter_matrix(&previous, stack);
        let mut normalization = ParameterNormalization::new(start_params.clone());
        normalization.compute_normalization_coefficients();

        let shared: &SliceStack = stack;
        let estimates: Vec<std::result::Result<SliceEstimate, SliceFailure>> = (0..shared.n_slices())
            .into_par_iter()
            .map(|k| {
                let x0 = normalization.normalize_row(start_params.row(k));
                let x_prev = normalization.normalize_row(previous_params.row(k));
                self.register_slice(volume, shared, stack_index, k, &normalization, x0, x_prev)
            })
            .collect();

        // Barrier: commit only after every slice has finished
        let mut report = StackRegistrationReport::default();
        for (k, estimate) in estimates.into_iter().enumerate() {
            match estimate {
                Ok(est) => {
                    report.registered += 1;
                    report.cost += est.cost;
                    report.initial_cost += est.initial_cost;
                    stack.slices[k].pose = est.pose;
                    stack.slices[k].intensity = est.intensity;
                }
                Err(reason) => {
                    tracing::debug!(stack = stack_index, slice = k, ?reason, "slice registration failed");
                    report.failed += 1;
                }
            }
        }

        if report.registered == 0 && report.failed > 0 {
            return Err(SrrError::StackRegistrationFailed { stack: stack_index });
        }
        if report.failed > 0 {
            tracing::warn!(stack = stack_index, failed = report.failed, "slices kept their previous pose");
        }
        tracing::info!(
            stack = stack_index,
            registered = report.registered,
            cost = report.cost,
            initial_cost = report.initial_cost,
            "stack registered"
        );
        Ok(report)
    }

    fn register_slice(
        &self,
        volume: &Volume,
        stack: &SliceStack,
        stack_index: usize,
        k: usize,
        normalization: &ParameterNormalization,
        x0: Array1<f64>,
        x_prev: Array1<f64>,
    ) -> std::result::Result<SliceEstimate, SliceFailure> {
        let tt = self.settings.transform_type;
        let n_spatial = tt.n_params();
        let fit_intensity = self.settings.intensity_correction == IntensityCorrectionType::Affine;
        let center = stack.slices[k].pose.center;
        let psf = PointSpreadFunction::from_spacing(stack.image.grid.spacing);
        let data = stack.slice_data(k);

        let mask_count = stack.slice_mask(k).iter().filter(|&&m| m != 0).count();
        if mask_count < min_pixels(self.n_params()) {
            return Err(SliceFailure::TooFewPixels);
        }

        let residual = |z: &[f64]| -> Option<Vec<f64>> {
            let p = normalization.denormalize_row(Array1::from_vec(z.to_vec()).view());
            let pose = params_to_matrix(tt, &p.as_slice()?[..n_spatial], &center);
            let sampler = SliceSampler::new(stack, stack_index, k, &pose, &volume.grid, &psf).ok()?;
            let mut predicted = vec![0.0; sampler.len()];
            sampler.forward(&volume.data, &mut predicted);
            let (s, b) = if fit_intensity { (p[n_spatial], p[n_spatial + 1]) } else { (1.0, 0.0) };
            let r: Vec<f64> = sampler
                .pixel_indices()
                .zip(predicted)
                .map(|(px, pred)| s * pred + b - data[px])
                .collect();
            r.iter().all(|v| v.is_finite()).then_some(r)
        };

        let settings = LmSettings { max_iterations: self.settings.max_iterations, ..Default::default() };
        let outcome = levenberg_marquardt(&residual, x0.as_slice().ok_or(SliceFailure::NonFinite)?, &settings)
            .ok_or(SliceFailure::Degenerate)?;

        if !outcome.cost.is_finite() {
            return Err(SliceFailure::NonFinite);
        }
        // A start shift is only kept if it beats the previous pose
        let previous_cost = x_prev
            .as_slice()
            .and_then(|z| residual(z))
            .map(|r| 0.5 * r.iter().map(|v| v * v).sum::<f64>())
            .unwrap_or(f64::INFINITY);
        let initial_cost = if previous_cost.is_finite() { previous_cost } else { outcome.initial_cost };
        if outcome.cost > outcome.initial_cost || outcome.cost > previous_cost {
            return Err(SliceFailure::CostIncrease);
        }

        let p = normalization.denormalize_row(Array1::from_vec(outcome.params).view());
        let spatial: Vec<f64> = p.iter().take(n_spatial).copied().collect();
        if !is_invertible(&params_to_matrix(tt, &spatial, &center)) {
            return Err(SliceFailure::Degenerate);
        }
        let intensity = if fit_intensity {
            if p[n_spatial].abs() < 1e-12 {
                return Err(SliceFailure::Degenerate);
            }
            [p[n_spatial], p[n_spatial + 1]]
        } else {
            stack.slices[k].intensity
        };

        Ok(SliceEstimate {
            pose: SlicePose { transform_type: tt, params: spatial, center },
            intensity,
            initial_cost,
            cost: outcome.cost,
        })
    }
}

/// Re-express a pose in another motion model
///
/// Rigid → affine is exact; affine → rigid keeps only the translation.
fn convert_pose(pose: &SlicePose, target: TransformType) -> SlicePose {
    if pose.transform_type == target {
        return pose.clone();
    }
    let mut converted = SlicePose {
        transform_type: target,
        params: target.identity_params(),
        center: pose.center,
    };
    if target == TransformType::Affine {
        let linear = crate::transform::linear_part(pose.transform_type, &pose.params);
        for r in 0..3 {
            for c in 0..3 {
                converted.params[3 * r + c] = linear[(r, c)];
            }
        }
    }
    converted.translate(&pose.translation());
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::phantom::{acquire, asymmetric_volume};
    use crate::volume::GridSpec;

    fn single_slice_stack(truth: &Volume, tt: TransformType) -> SliceStack {
        let n = truth.dims().0;
        let grid = GridSpec::axis_aligned((n, n, 1), (1.0, 1.0, 1.0), [0.0, 0.0, (n / 2) as f64]).unwrap();
        SliceStack::new("single", Volume::zeros(grid), tt)
    }

    #[test]
    fn test_recovers_rigid_motion() {
        let truth = asymmetric_volume(32).unwrap();
        let mut stack = single_slice_stack(&truth, TransformType::Rigid);
        let rz = 15f64.to_radians();
        stack.slices[0].pose.params = vec![0.0, 0.0, rz, 3.0, 0.0, 0.0];
        acquire(&truth, &mut stack).unwrap();
        stack.reset_poses(TransformType::Rigid);

        let settings = RegistrationSettings { max_iterations: 60, ..Default::default() };
        let registration = SliceToVolumeRegistration::new(settings);
        let report = registration.register_stack(&truth, &mut stack, 1).unwrap();

        assert_eq!(report.registered, 1);
        let p = &stack.slices[0].pose.params;
        assert!((p[2] - rz).abs() < 1f64.to_radians(), "rz = {}", p[2].to_degrees());
        assert!((p[3] - 3.0).abs() < 0.5, "tx = {}", p[3]);
        assert!(p[4].abs() < 0.5, "ty = {}", p[4]);
        assert!(report.cost < 0.1 * report.initial_cost);
    }

    #[test]
    fn test_affine_intensity_correction() {
        let truth = asymmetric_volume(24).unwrap();
        let mut stack = single_slice_stack(&truth, TransformType::Rigid);
        acquire(&truth, &mut stack).unwrap();
        for v in stack.image.data.iter_mut() {
            *v = 2.0 * *v + 0.1;
        }

        let settings = RegistrationSettings {
            initializer: InitializerType::Identity,
            intensity_correction: IntensityCorrectionType::Affine,
            max_iterations: 40,
            ..Default::default()
        };
        SliceToVolumeRegistration::new(settings).register_stack(&truth, &mut stack, 1).unwrap();

        let [s, b] = stack.slices[0].intensity;
        assert!((s - 2.0).abs() < 0.05, "scale = {}", s);
        assert!((b - 0.1).abs() < 0.02, "offset = {}", b);
    }

    #[test]
    fn test_all_slices_failing_aborts() {
        let truth = asymmetric_volume(16).unwrap();
        let mut stack = single_slice_stack(&truth, TransformType::Rigid);
        stack.image.mask.iter_mut().for_each(|m| *m = 0);
        let previous = stack.slices[0].pose.clone();

        let result = SliceToVolumeRegistration::default().register_stack(&truth, &mut stack, 2);
        assert!(matches!(result, Err(SrrError::StackRegistrationFailed { stack: 2 })));
        assert_eq!(stack.slices[0].pose, previous);
    }

    #[test]
    fn test_failed_slice_keeps_previous_pose() {
        let truth = asymmetric_volume(24).unwrap();
        let grid = GridSpec::axis_aligned((24, 24, 2), (1.0, 1.0, 1.0), [0.0, 0.0, 11.0]).unwrap();
        let mut stack = SliceStack::new("partial", Volume::zeros(grid), TransformType::Rigid);
        stack.slices[0].pose.params = vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0];
        stack.slices[1].pose.params = vec![0.0, 0.0, 0.0, 3.0, 0.0, 0.0];
        acquire(&truth, &mut stack).unwrap();
        stack.reset_poses(TransformType::Rigid);

        // Slice 1 keeps only a short row of pixels, too few to constrain a pose
        let plane = 24 * 24;
        for (p, m) in stack.image.mask[plane..].iter_mut().enumerate() {
            *m = u8::from(p / 24 == 12 && (7..17).contains(&(p % 24)));
        }
        let previous = stack.slices[1].clone();

        let settings = RegistrationSettings { max_iterations: 40, ..Default::default() };
        let report = SliceToVolumeRegistration::new(settings).register_stack(&truth, &mut stack, 1).unwrap();

        assert_eq!(report.registered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(stack.slices[1].pose, previous.pose);
        assert_eq!(stack.slices[1].intensity, previous.intensity);
        assert!((stack.slices[0].pose.params[3] - 2.0).abs() < 0.5);
    }

    #[test]
    fn test_pose_conversion_to_affine_is_exact() {
        let mut rigid = SlicePose::identity(TransformType::Rigid, nalgebra::Point3::new(1.0, 2.0, 3.0));
        rigid.params = vec![0.1, -0.2, 0.3, 1.0, 2.0, -1.0];
        let affine = convert_pose(&rigid, TransformType::Affine);
        let diff = rigid.matrix() - affine.matrix();
        assert!(diff.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_settings_defaults_from_json() {
        let s: RegistrationSettings = serde_json::from_str(r#"{"transform_type": "affine"}"#).unwrap();
        assert_eq!(s.transform_type, TransformType::Affine);
        assert_eq!(s.initializer, InitializerType::Moments);
        assert_eq!(s.max_iterations, 20);
    }
}
