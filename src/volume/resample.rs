//! Resampling of volumes onto another grid
//!
//! Points falling outside the source grid take the background value zero.

use nalgebra::{Matrix4, Point3};
use serde::{Deserialize, Serialize};

use super::{flat_index, GridSpec, Volume};

/// Interpolation scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// Resample `source` onto `target`
///
/// The mask is always resampled with nearest neighbour.
pub fn resample(source: &Volume, target: &GridSpec, interpolation: Interpolation) -> Volume {
    resample_with_transform(source, target, &Matrix4::identity(), interpolation)
}

/// Resample `source` onto `target`, with `transform` mapping target physical
/// points into source physical space
pub fn resample_with_transform(
    source: &Volume,
    target: &GridSpec,
    transform: &Matrix4<f64>,
    interpolation: Interpolation,
) -> Volume {
    let (tx, ty, tz) = target.dims;
    let to_source = source.grid.inverse_affine() * transform * target.affine();

    let mut out = Volume::zeros(target.clone());
    for k in 0..tz {
        for j in 0..ty {
            for i in 0..tx {
                let p = to_source.transform_point(&Point3::new(i as f64, j as f64, k as f64));
                let idx = flat_index(i, j, k, tx, ty);
                out.data[idx] = match interpolation {
                    Interpolation::Nearest => sample_nearest(&source.data, source.grid.dims, &p),
                    Interpolation::Linear => sample_linear(&source.data, source.grid.dims, &p),
                };
                out.mask[idx] = nearest_mask(&source.mask, source.grid.dims, &p);
            }
        }
    }
    out
}

fn nearest_index(dims: (usize, usize, usize), p: &Point3<f64>) -> Option<usize> {
    let (nx, ny, nz) = dims;
    let i = p.x.round();
    let j = p.y.round();
    let k = p.z.round();
    if i < 0.0 || j < 0.0 || k < 0.0 || i >= nx as f64 || j >= ny as f64 || k >= nz as f64 {
        return None;
    }
    Some(flat_index(i as usize, j as usize, k as usize, nx, ny))
}

fn sample_nearest(data: &[f64], dims: (usize, usize, usize), p: &Point3<f64>) -> f64 {
    nearest_index(dims, p).map_or(0.0, |idx| data[idx])
}

fn nearest_mask(mask: &[u8], dims: (usize, usize, usize), p: &Point3<f64>) -> u8 {
    nearest_index(dims, p).map_or(0, |idx| mask[idx])
}

/// Trilinear interpolation at continuous index `p`
pub fn sample_linear(data: &[f64], dims: (usize, usize, usize), p: &Point3<f64>) -> f64 {
    let (nx, ny, nz) = dims;
    let x0 = p.x.floor();
    let y0 = p.y.floor();
    let z0 = p.z.floor();
    let fx = p.x - x0;
    let fy = p.y - y0;
    let fz = p.z - z0;

    let mut value = 0.0;
    for dz in 0..2 {
        let k = z0 as i64 + dz;
        let wz = if dz == 0 { 1.0 - fz } else { fz };
        if k < 0 || k >= nz as i64 || wz == 0.0 {
            continue;
        }
        for dy in 0..2 {
            let j = y0 as i64 + dy;
            let wy = if dy == 0 { 1.0 - fy } else { fy };
            if j < 0 || j >= ny as i64 || wy == 0.0 {
                continue;
            }
            for dx in 0..2 {
                let i = x0 as i64 + dx;
                let wx = if dx == 0 { 1.0 - fx } else { fx };
                if i < 0 || i >= nx as i64 || wx == 0.0 {
                    continue;
                }
                value += wx * wy * wz * data[flat_index(i as usize, j as usize, k as usize, nx, ny)];
            }
        }
    }
    value
}
