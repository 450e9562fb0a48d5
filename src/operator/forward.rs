//! Oriented Gaussian forward operator and its adjoint
//!
//! Each slice pixel predicts a PSF-weighted average of the volume around the
//! pixel centre mapped through the slice pose. Weights are evaluated on the
//! volume lattice within a box of `PSF_CUTOFF_SIGMAS` standard deviations and
//! normalised over the whole box; lattice points outside the volume count as
//! background zero. The adjoint scatters with the same weights, so the pair
//! is an exact transpose and AᵀA is positive semi-definite.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use rayon::prelude::*;

use super::psf::PointSpreadFunction;
use crate::error::{Result, SrrError};
use crate::transform::is_invertible;
use crate::utils::simd_ops::axpy;
use crate::volume::{flat_index, GridSpec, SliceStack};

/// Box half-width of the PSF kernel in standard deviations
pub const PSF_CUTOFF_SIGMAS: f64 = 3.0;

/// Sampling of a volume grid along one posed slice
#[derive(Clone, Debug)]
pub struct SliceSampler {
    /// In-mask pixel indices of the slice and their centres in volume index space
    pixels: Vec<(usize, Point3<f64>)>,
    precision: Matrix3<f64>,
    half_width: Vector3<f64>,
    volume_dims: (usize, usize, usize),
}

impl SliceSampler {
    /// Build the sampler for slice `k` of `stack` under `pose`
    ///
    /// Fails with `DegenerateTransform` when the pose or the resulting PSF
    /// covariance cannot be inverted.
    pub fn new(
        stack: &SliceStack,
        stack_index: usize,
        k: usize,
        pose: &Matrix4<f64>,
        volume: &GridSpec,
        psf: &PointSpreadFunction,
    ) -> Result<Self> {
        let degenerate = SrrError::DegenerateTransform { stack: stack_index, slice: k };
        if !is_invertible(pose) {
            return Err(degenerate);
        }

        let to_index = volume.inverse_affine() * pose * stack.image.grid.affine();
        let linear = to_index.fixed_view::<3, 3>(0, 0).into_owned();
        let cov = psf.index_covariance(&linear, stack.image.grid.spacing);
        let precision = cov.try_inverse().ok_or(degenerate)?;
        if !precision.iter().all(|v| v.is_finite()) {
            return Err(SrrError::DegenerateTransform { stack: stack_index, slice: k });
        }
        let half_width = Vector3::new(
            PSF_CUTOFF_SIGMAS * cov[(0, 0)].sqrt(),
            PSF_CUTOFF_SIGMAS * cov[(1, 1)].sqrt(),
            PSF_CUTOFF_SIGMAS * cov[(2, 2)].sqrt(),
        );

        let (nx, ny, _) = stack.image.grid.dims;
        let mask = stack.slice_mask(k);
        let mut pixels = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                let p = i + j * nx;
                if mask[p] == 0 {
                    continue;
                }
                let q = to_index.transform_point(&Point3::new(i as f64, j as f64, k as f64));
                pixels.push((p, q));
            }
        }

        Ok(Self { pixels, precision, half_width, volume_dims: volume.dims })
    }

    /// Number of in-mask pixels (rows of this slice's operator)
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Slice-local pixel indices in row order
    pub fn pixel_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.pixels.iter().map(|&(p, _)| p)
    }

    /// Fill `weights` with the in-bounds (voxel, weight) pairs for centre `q`
    fn kernel(&self, q: &Point3<f64>, weights: &mut Vec<(usize, f64)>) {
        weights.clear();
        let (nx, ny, nz) = self.volume_dims;

        let mut lo = [0i64; 3];
        let mut hi = [0i64; 3];
        for a in 0..3 {
            let nearest = q[a].round() as i64;
            lo[a] = ((q[a] - self.half_width[a]).ceil() as i64).min(nearest);
            hi[a] = ((q[a] + self.half_width[a]).floor() as i64).max(nearest);
        }

        let mut total = 0.0;
        for k in lo[2]..=hi[2] {
            let dz = k as f64 - q.z;
            let k_in = k >= 0 && k < nz as i64;
            for j in lo[1]..=hi[1] {
                let dy = j as f64 - q.y;
                let j_in = j >= 0 && j < ny as i64;
                for i in lo[0]..=hi[0] {
                    let dx = i as f64 - q.x;
                    let d = Vector3::new(dx, dy, dz);
                    let w = (-0.5 * d.dot(&(self.precision * d))).exp();
                    total += w;
                    if k_in && j_in && i >= 0 && i < nx as i64 {
                        weights.push((flat_index(i as usize, j as usize, k as usize, nx, ny), w));
                    }
                }
            }
        }

        if total > 0.0 {
            for (_, w) in weights.iter_mut() {
                *w /= total;
            }
        }
    }

    /// Predicted intensities of the slice's in-mask pixels
    pub fn forward(&self, volume: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.pixels.len());
        let mut weights = Vec::new();
        for (o, (_, q)) in out.iter_mut().zip(self.pixels.iter()) {
            self.kernel(q, &mut weights);
            *o = weights.iter().map(|&(idx, w)| w * volume[idx]).sum();
        }
    }

    /// Accumulate Aᵀ·residual into `acc`
    pub fn adjoint_add(&self, residual: &[f64], acc: &mut [f64]) {
        debug_assert_eq!(residual.len(), self.pixels.len());
        let mut weights = Vec::new();
        for (&r, (_, q)) in residual.iter().zip(self.pixels.iter()) {
            if r == 0.0 {
                continue;
            }
            self.kernel(q, &mut weights);
            for &(idx, w) in weights.iter() {
                acc[idx] += w * r;
            }
        }
    }
}

/// Identifies a slice as (stack index, slice index)
pub type SliceId = (usize, usize);

/// Stacked forward operator over every included slice of all stacks
///
/// Never materialized: rows are generated on the fly from each slice's
/// pose and PSF.
#[derive(Clone, Debug)]
pub struct ForwardOperator {
    samplers: Vec<SliceSampler>,
    slice_ids: Vec<SliceId>,
    /// Start of each slice's rows; one extra entry for the total
    offsets: Vec<usize>,
    observations: Vec<f64>,
    n_voxels: usize,
}

impl ForwardOperator {
    /// Build the operator for `grid` from all non-excluded slices
    ///
    /// Slices with a degenerate pose are skipped and returned as errors so
    /// the caller can flag them.
    pub fn new(grid: &GridSpec, stacks: &[SliceStack]) -> (Self, Vec<SrrError>) {
        let jobs: Vec<SliceId> = stacks
            .iter()
            .enumerate()
            .flat_map(|(s, stack)| {
                stack.slices.iter().filter(|sl| !sl.excluded).map(move |sl| (s, sl.index))
            })
            .collect();

        let built: Vec<(SliceId, Result<SliceSampler>)> = jobs
            .par_iter()
            .map(|&(s, k)| {
                let stack = &stacks[s];
                let psf = PointSpreadFunction::from_spacing(stack.image.grid.spacing);
                let pose = stack.slices[k].pose.matrix();
                ((s, k), SliceSampler::new(stack, s, k, &pose, grid, &psf))
            })
            .collect();

        let mut samplers = Vec::with_capacity(built.len());
        let mut slice_ids = Vec::with_capacity(built.len());
        let mut offsets = vec![0];
        let mut observations = Vec::new();
        let mut failures = Vec::new();

        for ((s, k), sampler) in built {
            match sampler {
                Ok(sampler) if !sampler.is_empty() => {
                    let data = stacks[s].slice_data(k);
                    let [scale, offset] = stacks[s].slices[k].intensity;
                    let scale = if scale.abs() > 1e-12 { scale } else { 1.0 };
                    observations.extend(sampler.pixel_indices().map(|p| (data[p] - offset) / scale));
                    offsets.push(observations.len());
                    samplers.push(sampler);
                    slice_ids.push((s, k));
                }
                Ok(_) => {}
                Err(e) => failures.push(e),
            }
        }

        let op = Self { samplers, slice_ids, offsets, observations, n_voxels: grid.len() };
        (op, failures)
    }

    /// Number of rows (observed in-mask slice pixels)
    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    /// Number of columns (volume voxels)
    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    pub fn n_slices(&self) -> usize {
        self.samplers.len()
    }

    pub fn slice_ids(&self) -> &[SliceId] {
        &self.slice_ids
    }

    /// Stacked observations y, intensity-corrected
    pub fn observations(&self) -> &[f64] {
        &self.observations
    }

    /// A·x
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.n_voxels);
        let mut out = vec![0.0; self.n_observations()];
        let mut chunks: Vec<&mut [f64]> = Vec::with_capacity(self.samplers.len());
        let mut rest = out.as_mut_slice();
        for sampler in &self.samplers {
            let (head, tail) = rest.split_at_mut(sampler.len());
            chunks.push(head);
            rest = tail;
        }
        self.samplers
            .par_iter()
            .zip(chunks.into_par_iter())
            .for_each(|(sampler, chunk)| sampler.forward(x, chunk));
        out
    }

    /// Aᵀ·r, summed over slices as a parallel reduction
    pub fn apply_adjoint(&self, r: &[f64]) -> Vec<f64> {
        debug_assert_eq!(r.len(), self.n_observations());
        let n = self.n_voxels;
        self.samplers
            .par_iter()
            .enumerate()
            .fold(
                || vec![0.0; n],
                |mut acc, (s, sampler)| {
                    sampler.adjoint_add(&r[self.offsets[s]..self.offsets[s + 1]], &mut acc);
                    acc
                },
            )
            .reduce(
                || vec![0.0; n],
                |mut a, b| {
                    axpy(&mut a, 1.0, &b);
                    a
                },
            )
    }

    /// y - A·x
    pub fn residual(&self, x: &[f64]) -> Vec<f64> {
        let ax = self.apply(x);
        self.observations.iter().zip(ax.iter()).map(|(&y, &a)| y - a).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformType;
    use crate::volume::Volume;

    fn test_volume(n: usize, width: f64) -> Volume {
        let grid = GridSpec::axis_aligned((n, n, n), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        let c = (n as f64 - 1.0) / 2.0;
        let mut data = vec![0.0; n * n * n];
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let r2 = (i as f64 - c).powi(2) + (j as f64 - c).powi(2) + (k as f64 - c).powi(2);
                    data[flat_index(i, j, k, n, n)] = (-r2 / width).exp();
                }
            }
        }
        Volume::new(data, grid).unwrap()
    }

    fn stack_on(grid: &GridSpec) -> SliceStack {
        let image = Volume::zeros(grid.clone());
        SliceStack::new("stack", image, TransformType::Rigid)
    }

    #[test]
    fn test_adjoint_identity() {
        let volume = test_volume(10, 8.0);
        let grid = GridSpec::axis_aligned((5, 5, 3), (2.0, 2.0, 3.0), [0.5, 0.5, 1.0]).unwrap();
        let mut stack = stack_on(&grid);
        stack.slices[1].pose.params = vec![0.1, -0.05, 0.2, 0.5, -0.3, 0.2];

        let (op, failures) = ForwardOperator::new(&volume.grid, &[stack]);
        assert!(failures.is_empty());

        let r: Vec<f64> = (0..op.n_observations()).map(|i| ((i as f64) * 0.7).sin()).collect();
        let ax = op.apply(&volume.data);
        let atr = op.apply_adjoint(&r);

        let lhs: f64 = ax.iter().zip(r.iter()).map(|(a, b)| a * b).sum();
        let rhs: f64 = volume.data.iter().zip(atr.iter()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0), "<Ax,r>={} <x,Aᵀr>={}", lhs, rhs);
    }

    #[test]
    fn test_normal_operator_preserves_intensity() {
        let volume = test_volume(16, 4.0);
        let stack = stack_on(&volume.grid);
        let (op, _) = ForwardOperator::new(&volume.grid, &[stack]);

        let ata = op.apply_adjoint(&op.apply(&volume.data));
        let before: f64 = volume.data.iter().sum();
        let after: f64 = ata.iter().sum();
        assert!((before - after).abs() < 1e-5 * before, "before={} after={}", before, after);
    }

    #[test]
    fn test_normal_operator_is_psd() {
        let volume = test_volume(8, 8.0);
        let grid = GridSpec::axis_aligned((4, 4, 2), (2.0, 2.0, 4.0), [0.0; 3]).unwrap();
        let (op, _) = ForwardOperator::new(&volume.grid, &[stack_on(&grid)]);

        let x: Vec<f64> = (0..volume.len()).map(|i| ((i as f64) * 1.3).cos()).collect();
        let ax = op.apply(&x);
        let xtatax: f64 = x.iter().zip(op.apply_adjoint(&ax).iter()).map(|(a, b)| a * b).sum();
        assert!(xtatax >= 0.0);
    }

    #[test]
    fn test_outside_support_is_background() {
        let volume = test_volume(6, 8.0);
        let grid = GridSpec::axis_aligned((3, 3, 1), (1.0, 1.0, 1.0), [100.0, 100.0, 100.0]).unwrap();
        let (op, _) = ForwardOperator::new(&volume.grid, &[stack_on(&grid)]);
        assert!(op.apply(&volume.data).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_masked_pixels_excluded() {
        let volume = test_volume(6, 8.0);
        let grid = GridSpec::axis_aligned((3, 3, 1), (1.0, 1.0, 1.0), [1.0, 1.0, 2.0]).unwrap();
        let mut mask = vec![1u8; 9];
        mask[0] = 0;
        mask[4] = 0;
        let image = Volume::zeros(grid).with_mask(mask).unwrap();
        let stack = SliceStack::new("masked", image, TransformType::Rigid);
        let (op, _) = ForwardOperator::new(&volume.grid, &[stack]);
        assert_eq!(op.n_observations(), 7);
    }

    #[test]
    fn test_degenerate_pose_reported() {
        let volume = test_volume(6, 8.0);
        let grid = GridSpec::axis_aligned((3, 3, 2), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        let image = Volume::zeros(grid);
        let mut stack = SliceStack::new("affine", image, TransformType::Affine);
        stack.slices[1].pose.params[0] = 0.0;
        stack.slices[1].pose.params[4] = 0.0;

        let (op, failures) = ForwardOperator::new(&volume.grid, &[stack]);
        assert_eq!(op.n_slices(), 1);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], SrrError::DegenerateTransform { stack: 0, slice: 1 }));
    }
}
