//! Synthetic phantoms and simulated slice acquisitions
//!
//! Used by the tests and the scenario checks: smooth Gaussian blobs on a
//! grid, and stacks acquired from a known volume through the forward
//! operator.

use nalgebra::Matrix4;

use super::{flat_index, GridSpec, SliceStack, Volume};
use crate::error::Result;
use crate::operator::{PointSpreadFunction, SliceSampler};
use crate::transform::TransformType;

/// Add exp(-|p - centre|² / width) to `data`, with `centre` in voxel indices
pub fn add_gaussian_blob(data: &mut [f64], dims: (usize, usize, usize), centre: [f64; 3], width: f64, amplitude: f64) {
    let (nx, ny, nz) = dims;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let r2 = (i as f64 - centre[0]).powi(2)
                    + (j as f64 - centre[1]).powi(2)
                    + (k as f64 - centre[2]).powi(2);
                data[flat_index(i, j, k, nx, ny)] += amplitude * (-r2 / width).exp();
            }
        }
    }
}

/// Isotropic cube of side `n` (1 mm voxels) holding one centred blob
pub fn blob_volume(n: usize, width: f64) -> Result<Volume> {
    let grid = GridSpec::axis_aligned((n, n, n), (1.0, 1.0, 1.0), [0.0; 3])?;
    let mut data = vec![0.0; grid.len()];
    let c = (n as f64 - 1.0) / 2.0;
    add_gaussian_blob(&mut data, grid.dims, [c, c, c], width, 1.0);
    Volume::new(data, grid)
}

/// Isotropic cube with two blobs of different size, so no rotation or
/// translation maps it onto itself
pub fn asymmetric_volume(n: usize) -> Result<Volume> {
    let grid = GridSpec::axis_aligned((n, n, n), (1.0, 1.0, 1.0), [0.0; 3])?;
    let mut data = vec![0.0; grid.len()];
    let s = n as f64;
    add_gaussian_blob(&mut data, grid.dims, [0.38 * s, 0.45 * s, 0.5 * s], 0.06 * s * s, 1.0);
    add_gaussian_blob(&mut data, grid.dims, [0.68 * s, 0.6 * s, 0.48 * s], 0.015 * s * s, 0.7);
    Volume::new(data, grid)
}

/// Stack grid of `n` x `n` one-millimetre pixels and `n_slices` slices of
/// `thickness` mm
///
/// `axes` are the in-plane x, in-plane y and slice-normal directions in
/// physical space; `origin` is the physical position of pixel (0, 0) of
/// slice 0.
pub fn oriented_stack_grid(n: usize, n_slices: usize, thickness: f64, axes: [[f64; 3]; 3], origin: [f64; 3]) -> Result<GridSpec> {
    let mut affine = Matrix4::identity();
    for r in 0..3 {
        affine[(r, 0)] = axes[0][r];
        affine[(r, 1)] = axes[1][r];
        affine[(r, 2)] = thickness * axes[2][r];
        affine[(r, 3)] = origin[r];
    }
    GridSpec::new((n, n, n_slices), (1.0, 1.0, thickness), affine)
}

/// Acquire a stack on `grid` from `truth` with identity poses and the
/// default PSF
pub fn simulate_stack(truth: &Volume, name: &str, grid: GridSpec, transform_type: TransformType) -> Result<SliceStack> {
    let mut stack = SliceStack::new(name, Volume::zeros(grid), transform_type);
    acquire(truth, &mut stack)?;
    Ok(stack)
}

/// Overwrite the in-mask pixels of every slice with `truth` sampled under
/// the slice's current pose
pub fn acquire(truth: &Volume, stack: &mut SliceStack) -> Result<()> {
    let psf = PointSpreadFunction::from_spacing(stack.image.grid.spacing);
    let n = stack.pixels_per_slice();

    for k in 0..stack.n_slices() {
        let pose = stack.slices[k].pose.matrix();
        let sampler = SliceSampler::new(stack, 0, k, &pose, &truth.grid, &psf)?;
        let mut predicted = vec![0.0; sampler.len()];
        sampler.forward(&truth.data, &mut predicted);
        let pixels: Vec<usize> = sampler.pixel_indices().collect();
        for (p, v) in pixels.into_iter().zip(predicted) {
            stack.image.data[k * n + p] = v;
        }
    }
    Ok(())
}
