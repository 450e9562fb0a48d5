//! Slice pose parameterization
//!
//! Poses map a slice from its acquisition space into the reference space of
//! the reconstruction. Both parameterizations rotate (or linearly map) about
//! a fixed centre `c`, the physical centre of the slice at acquisition:
//!
//! T(p) = M (p - c) + c + t
//!
//! - Rigid: `[rx, ry, rz, tx, ty, tz]`, Euler angles in radians, `M = Rz Ry Rx`
//! - Affine: `[m00, m01, m02, m10, .., m22, tx, ty, tz]`, `M` row-major

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Smallest |det| accepted for an invertible linear part
pub const DEGENERATE_DET: f64 = 1e-10;

/// Motion model for a slice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    Rigid,
    Affine,
}

impl TransformType {
    /// Number of spatial parameters
    pub fn n_params(self) -> usize {
        match self {
            TransformType::Rigid => 6,
            TransformType::Affine => 12,
        }
    }

    /// Parameters of the identity transform
    pub fn identity_params(self) -> Vec<f64> {
        match self {
            TransformType::Rigid => vec![0.0; 6],
            TransformType::Affine => vec![
                1.0, 0.0, 0.0,
                0.0, 1.0, 0.0,
                0.0, 0.0, 1.0,
                0.0, 0.0, 0.0,
            ],
        }
    }

    /// Index of the first translation parameter
    pub fn translation_offset(self) -> usize {
        self.n_params() - 3
    }
}

/// Pose of one slice relative to the reference space
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlicePose {
    pub transform_type: TransformType,
    pub params: Vec<f64>,
    /// Centre of rotation in physical coordinates
    pub center: [f64; 3],
}

impl SlicePose {
    pub fn identity(transform_type: TransformType, center: Point3<f64>) -> Self {
        Self {
            transform_type,
            params: transform_type.identity_params(),
            center: [center.x, center.y, center.z],
        }
    }

    /// True while the parameters still describe the identity
    pub fn is_identity(&self) -> bool {
        self.params
            .iter()
            .zip(self.transform_type.identity_params().iter())
            .all(|(&p, &q)| (p - q).abs() < 1e-12)
    }

    /// Homogeneous 4x4 matrix of the pose
    pub fn matrix(&self) -> Matrix4<f64> {
        params_to_matrix(self.transform_type, &self.params, &self.center)
    }

    /// Translation part of the parameters
    pub fn translation(&self) -> Vector3<f64> {
        let o = self.transform_type.translation_offset();
        Vector3::new(self.params[o], self.params[o + 1], self.params[o + 2])
    }

    /// Shift the translation part by `delta` (mm)
    pub fn translate(&mut self, delta: &Vector3<f64>) {
        let o = self.transform_type.translation_offset();
        for a in 0..3 {
            self.params[o + a] += delta[a];
        }
    }
}

/// Linear part `M` for the given parameters
pub fn linear_part(transform_type: TransformType, params: &[f64]) -> Matrix3<f64> {
    match transform_type {
        TransformType::Rigid => {
            *Rotation3::from_euler_angles(params[0], params[1], params[2]).matrix()
        }
        TransformType::Affine => Matrix3::new(
            params[0], params[1], params[2],
            params[3], params[4], params[5],
            params[6], params[7], params[8],
        ),
    }
}

/// Build `T(p) = M (p - c) + c + t` as a homogeneous matrix
pub fn params_to_matrix(transform_type: TransformType, params: &[f64], center: &[f64; 3]) -> Matrix4<f64> {
    debug_assert_eq!(params.len(), transform_type.n_params());
    let m = linear_part(transform_type, params);
    let c = Vector3::new(center[0], center[1], center[2]);
    let o = transform_type.translation_offset();
    let t = Vector3::new(params[o], params[o + 1], params[o + 2]);
    let offset = c + t - m * c;

    let mut out = Matrix4::identity();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&m);
    out.fixed_view_mut::<3, 1>(0, 3).copy_from(&offset);
    out
}

/// Whether a homogeneous matrix has a usable inverse
pub fn is_invertible(m: &Matrix4<f64>) -> bool {
    let det = m.fixed_view::<3, 3>(0, 0).determinant();
    det.is_finite() && det.abs() > DEGENERATE_DET && m.iter().all(|v| v.is_finite())
}

/// Row-major flattening used by NIfTI headers and checkpoints
pub fn matrix_to_row_major(m: &Matrix4<f64>) -> [f64; 16] {
    let mut out = [0.0; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[r * 4 + c] = m[(r, c)];
        }
    }
    out
}

pub fn matrix_from_row_major(values: &[f64; 16]) -> Matrix4<f64> {
    Matrix4::from_row_slice(values)
}
