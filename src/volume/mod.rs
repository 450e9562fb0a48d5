//! Volumetric data containers
//!
//! - `Volume`: 3D scalar grid with spacing, index-to-physical affine and mask
//! - `SliceStack`: a stack image whose z-planes are individually posed slices
//! - `resample`: resampling onto another grid
//! - `phantom`: synthetic volumes and simulated acquisitions

pub mod phantom;
pub mod resample;

pub use resample::*;

use nalgebra::{Matrix3, Matrix4, Point3};

use crate::error::{Result, SrrError};
use crate::transform::{is_invertible, SlicePose, TransformType};

/// Geometry of a voxel grid without data
#[derive(Clone, Debug, PartialEq)]
pub struct GridSpec {
    pub dims: (usize, usize, usize),
    pub spacing: (f64, f64, f64),
    /// Voxel index to physical coordinates
    affine: Matrix4<f64>,
    inverse: Matrix4<f64>,
}

impl GridSpec {
    pub fn new(dims: (usize, usize, usize), spacing: (f64, f64, f64), affine: Matrix4<f64>) -> Result<Self> {
        if dims.0 == 0 || dims.1 == 0 || dims.2 == 0 {
            return Err(SrrError::Config(format!("empty grid {:?}", dims)));
        }
        if !(spacing.0 > 0.0 && spacing.1 > 0.0 && spacing.2 > 0.0) {
            return Err(SrrError::Config(format!("non-positive voxel spacing {:?}", spacing)));
        }
        let inverse = affine
            .try_inverse()
            .filter(|_| is_invertible(&affine))
            .ok_or_else(|| SrrError::Config("grid affine is not invertible".into()))?;
        Ok(Self { dims, spacing, affine, inverse })
    }

    /// Axis-aligned grid with the given spacing and origin
    pub fn axis_aligned(dims: (usize, usize, usize), spacing: (f64, f64, f64), origin: [f64; 3]) -> Result<Self> {
        let mut affine = Matrix4::from_diagonal(&nalgebra::Vector4::new(spacing.0, spacing.1, spacing.2, 1.0));
        affine[(0, 3)] = origin[0];
        affine[(1, 3)] = origin[1];
        affine[(2, 3)] = origin[2];
        Self::new(dims, spacing, affine)
    }

    pub fn len(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Voxel index to physical coordinates
    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    /// Physical to voxel-index coordinates
    pub fn inverse_affine(&self) -> Matrix4<f64> {
        self.inverse
    }

    /// Orthonormal direction cosines (columns)
    pub fn direction(&self) -> Matrix3<f64> {
        let mut d = self.affine.fixed_view::<3, 3>(0, 0).into_owned();
        let s = [self.spacing.0, self.spacing.1, self.spacing.2];
        for (c, &sc) in s.iter().enumerate() {
            let col = d.column(c) / sc;
            d.set_column(c, &col);
        }
        d
    }

    pub fn index_to_physical(&self, i: f64, j: f64, k: f64) -> Point3<f64> {
        self.affine.transform_point(&Point3::new(i, j, k))
    }

    /// Physical centre of the grid
    pub fn center(&self) -> Point3<f64> {
        let (nx, ny, nz) = self.dims;
        self.index_to_physical(
            (nx as f64 - 1.0) / 2.0,
            (ny as f64 - 1.0) / 2.0,
            (nz as f64 - 1.0) / 2.0,
        )
    }

    pub fn is_orientation_preserving(&self) -> bool {
        self.affine.fixed_view::<3, 3>(0, 0).determinant() > 0.0
    }
}

/// Flat index in x-fastest order: i + j*nx + k*nx*ny
#[inline]
pub fn flat_index(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// A 3D image with mask
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Vec<f64>,
    pub grid: GridSpec,
    /// 1 = inside, 0 = outside; same shape as `data`
    pub mask: Vec<u8>,
}

impl Volume {
    pub fn new(data: Vec<f64>, grid: GridSpec) -> Result<Self> {
        if data.len() != grid.len() {
            return Err(SrrError::Config(format!(
                "data length {} does not match grid {:?}",
                data.len(),
                grid.dims
            )));
        }
        let mask = vec![1u8; data.len()];
        Ok(Self { data, grid, mask })
    }

    pub fn zeros(grid: GridSpec) -> Self {
        let n = grid.len();
        Self { data: vec![0.0; n], grid, mask: vec![1u8; n] }
    }

    /// Attach a binary mask; nonzero values count as inside
    pub fn with_mask(mut self, mask: Vec<u8>) -> Result<Self> {
        if mask.len() != self.data.len() {
            return Err(SrrError::GridMismatch {
                expected: self.grid.dims,
                actual: (mask.len(), 1, 1),
            });
        }
        self.mask = mask.into_iter().map(|m| u8::from(m != 0)).collect();
        Ok(self)
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.grid.dims
    }

    pub fn spacing(&self) -> (f64, f64, f64) {
        self.grid.spacing
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize, k: usize) -> f64 {
        let (nx, ny, _) = self.grid.dims;
        self.data[flat_index(i, j, k, nx, ny)]
    }

    pub fn is_orientation_preserving(&self) -> bool {
        self.grid.is_orientation_preserving()
    }

    pub fn mask_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }

    /// Root-mean-square difference to another volume on the same grid
    pub fn rms_difference(&self, other: &Volume) -> Result<f64> {
        if self.grid.dims != other.grid.dims {
            return Err(SrrError::GridMismatch { expected: self.grid.dims, actual: other.grid.dims });
        }
        let sum_sq: f64 = self.data.iter().zip(other.data.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
        Ok((sum_sq / self.data.len().max(1) as f64).sqrt())
    }
}

/// One 2D slice of a stack together with its estimated pose
#[derive(Clone, Debug, PartialEq)]
pub struct Slice {
    /// Position within the stack (z index)
    pub index: usize,
    pub pose: SlicePose,
    /// Affine intensity correction `[scale, offset]` applied as `(y - offset) / scale`
    pub intensity: [f64; 2],
    /// Excluded from the current solve after a numerical failure
    pub excluded: bool,
}

/// Ordered stack of 2D slices with shared in-plane and through-plane spacing
#[derive(Clone, Debug)]
pub struct SliceStack {
    pub name: String,
    /// Stack image; z-plane `k` holds slice `k`
    pub image: Volume,
    pub slices: Vec<Slice>,
}

impl SliceStack {
    /// Wrap a stack image, starting every slice at the identity pose
    pub fn new(name: impl Into<String>, image: Volume, transform_type: TransformType) -> Self {
        let nz = image.grid.dims.2;
        let slices = (0..nz)
            .map(|k| Slice {
                index: k,
                pose: SlicePose::identity(transform_type, slice_center(&image.grid, k)),
                intensity: [1.0, 0.0],
                excluded: false,
            })
            .collect();
        Self { name: name.into(), image, slices }
    }

    pub fn n_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn pixels_per_slice(&self) -> usize {
        let (nx, ny, _) = self.image.grid.dims;
        nx * ny
    }

    /// Intensities of slice `k`
    pub fn slice_data(&self, k: usize) -> &[f64] {
        let n = self.pixels_per_slice();
        &self.image.data[k * n..(k + 1) * n]
    }

    /// Mask of slice `k`
    pub fn slice_mask(&self, k: usize) -> &[u8] {
        let n = self.pixels_per_slice();
        &self.image.mask[k * n..(k + 1) * n]
    }

    /// Change the motion model of every slice back to the identity
    pub fn reset_poses(&mut self, transform_type: TransformType) {
        for k in 0..self.slices.len() {
            self.slices[k].pose = SlicePose::identity(transform_type, slice_center(&self.image.grid, k));
            self.slices[k].intensity = [1.0, 0.0];
            self.slices[k].excluded = false;
        }
    }
}

/// Physical centre of slice `k` of a stack grid
pub fn slice_center(grid: &GridSpec, k: usize) -> Point3<f64> {
    let (nx, ny, _) = grid.dims;
    grid.index_to_physical((nx as f64 - 1.0) / 2.0, (ny as f64 - 1.0) / 2.0, k as f64)
}
