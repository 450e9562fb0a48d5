//! Reconstruction space and stack intensity correction

use nalgebra::{Matrix3, Vector3};

use crate::error::Result;
use crate::operator::ForwardOperator;
use crate::utils::smoothing::gaussian_smooth;
use crate::volume::{resample, GridSpec, Interpolation, SliceStack, Volume};

/// Coverage below this fraction of the peak is treated as unobserved
const MIN_RELATIVE_COVERAGE: f64 = 1e-3;

/// Grid of the reconstructed volume
///
/// Shares orientation and centre with the target stack. Voxels are
/// isotropic with size `isotropic_resolution` (target in-plane spacing when
/// absent) and the field of view grows by `extra_frame` mm on every side.
pub fn reconstruction_grid(target: &GridSpec, isotropic_resolution: Option<f64>, extra_frame: f64) -> Result<GridSpec> {
    let resolution = isotropic_resolution.unwrap_or(target.spacing.0);
    let (nx, ny, nz) = target.dims;
    let (sx, sy, sz) = target.spacing;

    let extent = |n: usize, s: f64| -> usize {
        (((n as f64) * s + 2.0 * extra_frame) / resolution).round().max(1.0) as usize
    };
    let dims = (extent(nx, sx), extent(ny, sy), extent(nz, sz));

    let linear = target.direction() * Matrix3::from_diagonal_element(resolution);
    let half = Vector3::new(
        (dims.0 as f64 - 1.0) / 2.0,
        (dims.1 as f64 - 1.0) / 2.0,
        (dims.2 as f64 - 1.0) / 2.0,
    );
    let origin = target.center().coords - linear * half;

    let mut affine = *target.affine();
    affine.fixed_view_mut::<3, 3>(0, 0).copy_from(&linear);
    affine.fixed_view_mut::<3, 1>(0, 3).copy_from(&origin);
    GridSpec::new(dims, (resolution, resolution, resolution), affine)
}

/// Initial estimate: the target stack resampled onto the reconstruction grid
pub fn initial_volume(target: &SliceStack, grid: &GridSpec) -> Volume {
    resample(&target.image, grid, Interpolation::Linear)
}

/// Initial estimate from every stack by scattered data approximation
///
/// Each in-mask slice pixel is scattered onto `grid` with its PSF weights
/// under the current pose. Scattered intensities and weights are both
/// smoothed with a Gaussian of standard deviation `sigma` (mm) and divided
/// voxel-wise; voxels no slice reaches are zero. Returns `None` when no
/// slice overlaps the grid.
pub fn scattered_data_approximation(grid: &GridSpec, stacks: &[SliceStack], sigma: f64) -> Option<Volume> {
    let (op, skipped) = ForwardOperator::new(grid, stacks);

    let numerator = op.apply_adjoint(op.observations());
    let coverage = op.apply_adjoint(&vec![1.0; op.n_observations()]);
    let numerator = gaussian_smooth(&numerator, grid.dims, grid.spacing, sigma);
    let coverage = gaussian_smooth(&coverage, grid.dims, grid.spacing, sigma);

    let peak = coverage.iter().cloned().fold(0.0, f64::max);
    if peak <= 0.0 {
        return None;
    }
    let floor = MIN_RELATIVE_COVERAGE * peak;
    let data = numerator
        .iter()
        .zip(coverage.iter())
        .map(|(&n, &w)| if w > floor { n / w } else { 0.0 })
        .collect();
    tracing::debug!(slices = op.n_slices(), skipped = skipped.len(), sigma, "scattered data approximation");
    Volume::new(data, grid.clone()).ok()
}

/// Scale every stack so its intensities match the target stack in the
/// least-squares sense over their joint mask
///
/// Each stack is resampled onto the target grid; the scale is
/// Σ t·s / Σ s². Stacks without overlap keep scale 1. Returns the applied
/// scales, one per stack.
pub fn correct_stack_intensities(stacks: &mut [SliceStack], target_index: usize) -> Vec<f64> {
    let target = stacks[target_index].image.clone();
    let mut scales = vec![1.0; stacks.len()];

    for (s, stack) in stacks.iter_mut().enumerate() {
        if s == target_index {
            continue;
        }
        let resampled = resample(&stack.image, &target.grid, Interpolation::Linear);
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..target.len() {
            if target.mask[i] == 0 || resampled.mask[i] == 0 {
                continue;
            }
            num += target.data[i] * resampled.data[i];
            den += resampled.data[i] * resampled.data[i];
        }
        if den > 1e-12 && num > 0.0 {
            let scale = num / den;
            for v in stack.image.data.iter_mut() {
                *v *= scale;
            }
            scales[s] = scale;
            tracing::debug!(stack = s, scale, "stack intensity corrected");
        }
    }
    scales
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformType;
    use crate::volume::phantom::{asymmetric_volume, oriented_stack_grid, simulate_stack};
    use approx::assert_relative_eq;

    #[test]
    fn test_grid_keeps_centre_and_direction() {
        let target = GridSpec::axis_aligned((16, 16, 5), (2.0, 2.0, 6.0), [1.0, 1.0, 3.0]).unwrap();
        let grid = reconstruction_grid(&target, Some(1.0), 2.0).unwrap();

        assert_eq!(grid.dims, (36, 36, 34));
        assert_eq!(grid.spacing, (1.0, 1.0, 1.0));
        assert_relative_eq!(grid.center(), target.center(), epsilon = 1e-9);
        assert_relative_eq!(grid.direction(), target.direction(), epsilon = 1e-12);
    }

    #[test]
    fn test_grid_defaults_to_in_plane_spacing() {
        let target = GridSpec::axis_aligned((8, 8, 4), (1.5, 1.5, 3.0), [0.0; 3]).unwrap();
        let grid = reconstruction_grid(&target, None, 0.0).unwrap();
        assert_eq!(grid.spacing, (1.5, 1.5, 1.5));
        assert_eq!(grid.dims, (8, 8, 8));
    }

    /// 16 x 16 x 4 stack of 4 mm slices with the given axes
    fn thick_stack(truth: &Volume, name: &str, axes: [[f64; 3]; 3], origin: [f64; 3]) -> SliceStack {
        let grid = oriented_stack_grid(16, 4, 4.0, axes, origin).unwrap();
        simulate_stack(truth, name, grid, TransformType::Rigid).unwrap()
    }

    #[test]
    fn test_scattered_data_beats_target_only_start() {
        let truth = asymmetric_volume(16).unwrap();
        let (x, y, z) = ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]);
        // The target stack only observes the half-space x < 8
        let mut axial = thick_stack(&truth, "axial", [x, y, z], [0.0, 0.0, 1.5]);
        for idx in 0..axial.image.len() {
            if idx % 16 >= 8 {
                axial.image.data[idx] = 0.0;
                axial.image.mask[idx] = 0;
            }
        }
        let stacks = vec![
            axial,
            thick_stack(&truth, "coronal", [x, z, [0.0, -1.0, 0.0]], [0.0, 13.5, 0.0]),
            thick_stack(&truth, "sagittal", [y, z, x], [1.5, 0.0, 0.0]),
        ];
        let grid = reconstruction_grid(&stacks[0].image.grid, Some(1.0), 0.0).unwrap();
        assert_eq!(grid.dims, (16, 16, 16));

        let target_only = initial_volume(&stacks[0], &grid).rms_difference(&truth).unwrap();
        let sda = scattered_data_approximation(&grid, &stacks, 0.9).unwrap();
        let sda_error = sda.rms_difference(&truth).unwrap();

        assert!(sda.data.iter().all(|v| v.is_finite()));
        assert!(sda_error < target_only, "sda {} vs target only {}", sda_error, target_only);
    }

    #[test]
    fn test_scattered_data_without_overlap() {
        let truth = asymmetric_volume(16).unwrap();
        let far = thick_stack(&truth, "far", [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], [500.0, 0.0, 0.0]);
        let grid = GridSpec::axis_aligned((8, 8, 8), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        assert!(scattered_data_approximation(&grid, &[far], 0.9).is_none());
    }

    #[test]
    fn test_intensity_correction_scales_to_target() {
        let grid = GridSpec::axis_aligned((6, 6, 3), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        let data: Vec<f64> = (0..grid.len()).map(|i| 1.0 + (i % 5) as f64).collect();
        let target = Volume::new(data.clone(), grid.clone()).unwrap();
        let other = Volume::new(data.iter().map(|v| 0.5 * v).collect(), grid).unwrap();

        let mut stacks = vec![
            SliceStack::new("target", target, TransformType::Rigid),
            SliceStack::new("other", other, TransformType::Rigid),
        ];
        let scales = correct_stack_intensities(&mut stacks, 0);

        assert_eq!(scales[0], 1.0);
        assert_relative_eq!(scales[1], 2.0, epsilon = 1e-9);
        assert_relative_eq!(stacks[1].image.data[7], data[7], epsilon = 1e-9);
    }
}
