//! NIfTI image I/O
//!
//! Byte-level loading and saving (used by the WASM surface, where there is no
//! filesystem) plus path-based adapters producing `Volume`s and
//! `SliceStack`s. Both `.nii` and `.nii.gz` are accepted; gzip is detected
//! from the magic bytes on load and from the file extension on save.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use ndarray::{Array, Axis, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{Result, SrrError};
use crate::transform::{matrix_from_row_major, matrix_to_row_major, TransformType};
use crate::volume::{GridSpec, SliceStack, Volume};

/// NIfTI data loaded from bytes
pub struct NiftiData {
    /// Volume data as f64, x fastest
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz); higher dimensions keep the first volume
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

const HEADER_SIZE: usize = 348;
/// Header plus the empty 4-byte extension block
const VOX_OFFSET: usize = 352;
const DT_FLOAT32: i16 = 16;

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x1f, 0x8b])
}

fn nifti_error(context: &str, e: impl std::fmt::Display) -> SrrError {
    SrrError::Nifti(format!("{}: {}", context, e))
}

/// Load a NIfTI file from bytes
///
/// Supports both .nii and .nii.gz files (gzip is auto-detected). Scaling
/// (`scl_slope`, `scl_inter`) is applied by the reader.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
            .map_err(|e| nifti_error("failed to read gzipped NIfTI", e))?
    } else {
        if bytes.len() < HEADER_SIZE {
            return Err(SrrError::Nifti(format!("{} bytes is smaller than a NIfTI-1 header", bytes.len())));
        }
        InMemNiftiObject::from_reader(Cursor::new(bytes)).map_err(|e| nifti_error("failed to read NIfTI", e))?
    };

    let header = obj.header().clone();
    if header.dim[0] < 3 {
        return Err(SrrError::Nifti(format!("expected at least a 3D image, got {}D", header.dim[0])));
    }
    // qfac-signed entries are taken by magnitude
    let voxel_size = (
        f64::from(header.pixdim[1]).abs(),
        f64::from(header.pixdim[2]).abs(),
        f64::from(header.pixdim[3]).abs(),
    );

    let array: Array<f64, IxDyn> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| nifti_error("failed to convert image data", e))?;
    if array.ndim() < 3 {
        return Err(SrrError::Nifti(format!("expected at least a 3D array, got {}D", array.ndim())));
    }

    let mut view = array.view();
    while view.ndim() > 3 {
        view = view.index_axis_move(Axis(3), 0);
    }
    let shape = view.shape();
    let dims = (shape[0], shape[1], shape[2]);
    // Reversed axes iterate with x fastest
    let data: Vec<f64> = view.t().iter().copied().collect();

    Ok(NiftiData { data, dims, voxel_size, affine: header_affine(&header) })
}

/// Index-to-physical affine (row-major): sform when present, then qform,
/// otherwise voxel scaling only
fn header_affine(header: &NiftiHeader) -> [f64; 16] {
    let mut affine = [0.0; 16];
    affine[15] = 1.0;
    if header.sform_code > 0 {
        for (r, row) in [&header.srow_x, &header.srow_y, &header.srow_z].iter().enumerate() {
            for c in 0..4 {
                affine[4 * r + c] = f64::from(row[c]);
            }
        }
    } else if header.qform_code > 0 {
        let linear = qform_linear(header);
        let offset = [header.quatern_x, header.quatern_y, header.quatern_z];
        for r in 0..3 {
            for c in 0..3 {
                affine[4 * r + c] = linear[(r, c)];
            }
            affine[4 * r + 3] = f64::from(offset[r]);
        }
    } else {
        for a in 0..3 {
            affine[5 * a] = f64::from(header.pixdim[a + 1]);
        }
    }
    affine
}

/// Rotation from the quaternion (b, c, d) times the voxel scaling, with the
/// third axis flipped when qfac (`pixdim[0]`) is negative
fn qform_linear(header: &NiftiHeader) -> Matrix3<f64> {
    let (b, c, d) = (
        f64::from(header.quatern_b),
        f64::from(header.quatern_c),
        f64::from(header.quatern_d),
    );
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(a, b, c, d)).to_rotation_matrix();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = Vector3::new(
        f64::from(header.pixdim[1]).abs(),
        f64::from(header.pixdim[2]).abs(),
        qfac * f64::from(header.pixdim[3]).abs(),
    );
    rotation.matrix() * Matrix3::from_diagonal(&scale)
}

/// Little-endian writer over a fixed header buffer
struct HeaderWriter([u8; HEADER_SIZE]);

impl HeaderWriter {
    fn put(&mut self, offset: usize, bytes: &[u8]) {
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn put_i16s(&mut self, offset: usize, values: &[i16]) {
        for (n, v) in values.iter().enumerate() {
            self.put(offset + 2 * n, &v.to_le_bytes());
        }
    }

    fn put_f32s(&mut self, offset: usize, values: &[f32]) {
        for (n, v) in values.iter().enumerate() {
            self.put(offset + 4 * n, &v.to_le_bytes());
        }
    }
}

/// Save data as NIfTI bytes
///
/// Writes an uncompressed single-file NIfTI-1 image with float32 voxels and
/// the affine stored as sform.
pub fn save_nifti(
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    let (nx, ny, nz) = dims;
    let limit = i16::MAX as usize;
    if nx > limit || ny > limit || nz > limit {
        return Err(SrrError::Nifti(format!("dimensions {:?} exceed the NIfTI-1 limit", dims)));
    }
    if data.len() != nx * ny * nz {
        return Err(SrrError::Nifti(format!("{} values do not fill {:?}", data.len(), dims)));
    }

    let mut header = HeaderWriter([0u8; HEADER_SIZE]);
    header.put(0, &(HEADER_SIZE as i32).to_le_bytes());
    header.put_i16s(40, &[3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1]);
    header.put_i16s(70, &[DT_FLOAT32, 32]);
    let (vsx, vsy, vsz) = voxel_size;
    header.put_f32s(76, &[1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0]);
    // vox_offset, scl_slope, scl_inter
    header.put_f32s(108, &[VOX_OFFSET as f32, 1.0, 0.0]);
    // sform_code = scanner anat
    header.put_i16s(254, &[1]);
    let srows: Vec<f32> = affine[..12].iter().map(|&v| v as f32).collect();
    header.put_f32s(280, &srows);
    header.put(344, b"n+1\0");

    let mut buffer = Vec::with_capacity(VOX_OFFSET + 4 * data.len());
    buffer.extend_from_slice(&header.0);
    buffer.extend_from_slice(&[0u8; VOX_OFFSET - HEADER_SIZE]);
    for &v in data {
        buffer.extend_from_slice(&(v as f32).to_le_bytes());
    }
    Ok(buffer)
}

/// Save data as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&save_nifti(data, dims, voxel_size, affine)?)?;
    Ok(encoder.finish()?)
}

impl NiftiData {
    /// Grid geometry of the image
    pub fn grid(&self) -> Result<GridSpec> {
        GridSpec::new(self.dims, self.voxel_size, matrix_from_row_major(&self.affine))
    }

    pub fn into_volume(self) -> Result<Volume> {
        let grid = self.grid()?;
        Volume::new(self.data, grid)
    }
}

/// Serialize a volume to NIfTI bytes, gzipped when `gzip` is set
pub fn volume_to_nifti_bytes(volume: &Volume, gzip: bool) -> Result<Vec<u8>> {
    let affine = matrix_to_row_major(volume.grid.affine());
    if gzip {
        save_nifti_gz(&volume.data, volume.dims(), volume.spacing(), &affine)
    } else {
        save_nifti(&volume.data, volume.dims(), volume.spacing(), &affine)
    }
}

/// Volume from a file and an optional mask on the same grid
pub fn volume_from_bytes(image: &[u8], mask: Option<&[u8]>) -> Result<Volume> {
    let volume = load_nifti(image)?.into_volume()?;
    match mask {
        Some(bytes) => {
            let mask = load_nifti(bytes)?;
            if mask.dims != volume.dims() {
                return Err(SrrError::GridMismatch { expected: volume.dims(), actual: mask.dims });
            }
            volume.with_mask(mask.data.iter().map(|&v| u8::from(v != 0.0)).collect())
        }
        None => Ok(volume),
    }
}

pub fn load_volume(path: impl AsRef<Path>) -> Result<Volume> {
    let bytes = std::fs::read(path.as_ref())?;
    load_nifti(&bytes)?.into_volume()
}

/// Write `volume` to `path`; `.gz` paths are compressed
pub fn save_volume(volume: &Volume, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let gzip = path.extension().map_or(false, |e| e == "gz");
    std::fs::write(path, volume_to_nifti_bytes(volume, gzip)?)?;
    Ok(())
}

/// Load a stack image (slices along its third axis) and optional mask
pub fn load_slice_stack(
    path: impl AsRef<Path>,
    mask_path: Option<&Path>,
    transform_type: TransformType,
) -> Result<SliceStack> {
    let path = path.as_ref();
    let image = std::fs::read(path)?;
    let mask = mask_path.map(std::fs::read).transpose()?;
    let volume = volume_from_bytes(&image, mask.as_deref())?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(".gz").trim_end_matches(".nii").to_string())
        .unwrap_or_default();
    Ok(SliceStack::new(name, volume, transform_type))
}
