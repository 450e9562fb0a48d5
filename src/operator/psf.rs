//! Gaussian point-spread function of a slice acquisition

use nalgebra::{Matrix3, Vector3};

/// Axis-aligned Gaussian PSF in the slice's own frame
///
/// Variances are in mm² along the stack's in-plane (x, y) and
/// through-plane (z) axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointSpreadFunction {
    pub variance: [f64; 3],
}

impl PointSpreadFunction {
    /// PSF with FWHM = √2 · spacing along every stack axis
    ///
    /// σ² = (√2 s)² / (8 ln 2)
    pub fn from_spacing(spacing: (f64, f64, f64)) -> Self {
        let denom = 8.0 * std::f64::consts::LN_2;
        let var = |s: f64| (std::f64::consts::SQRT_2 * s).powi(2) / denom;
        Self { variance: [var(spacing.0), var(spacing.1), var(spacing.2)] }
    }

    /// PSF from full width at half maximum per axis (mm)
    pub fn from_fwhm(fwhm: [f64; 3]) -> Self {
        let denom = 8.0 * std::f64::consts::LN_2;
        Self { variance: [fwhm[0] * fwhm[0] / denom, fwhm[1] * fwhm[1] / denom, fwhm[2] * fwhm[2] / denom] }
    }

    pub fn covariance(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&Vector3::new(self.variance[0], self.variance[1], self.variance[2]))
    }

    /// Covariance expressed in the index space of the target volume
    ///
    /// `slice_to_index` is the linear part of the map from slice voxel
    /// indices to volume voxel indices; `spacing` is the slice voxel
    /// spacing, so `slice_to_index * diag(1/spacing)` maps slice-frame
    /// millimetres to volume indices.
    pub fn index_covariance(&self, slice_to_index: &Matrix3<f64>, spacing: (f64, f64, f64)) -> Matrix3<f64> {
        let scale = Matrix3::from_diagonal(&Vector3::new(1.0 / spacing.0, 1.0 / spacing.1, 1.0 / spacing.2));
        let g = slice_to_index * scale;
        g * self.covariance() * g.transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fwhm_relation() {
        let psf = PointSpreadFunction::from_spacing((1.0, 1.0, 4.0));
        let fwhm = (8.0 * std::f64::consts::LN_2 * psf.variance[2]).sqrt();
        assert_relative_eq!(fwhm, std::f64::consts::SQRT_2 * 4.0, epsilon = 1e-12);
        let other = PointSpreadFunction::from_fwhm([2f64.sqrt(), 2f64.sqrt(), 4.0 * 2f64.sqrt()]);
        for a in 0..3 {
            assert_relative_eq!(psf.variance[a], other.variance[a], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_index_covariance_identity() {
        let psf = PointSpreadFunction::from_spacing((2.0, 2.0, 2.0));
        // Slice voxels of 2mm into a 1mm volume grid: slice_to_index = 2 I
        let cov = psf.index_covariance(&(Matrix3::identity() * 2.0), (2.0, 2.0, 2.0));
        assert_relative_eq!(cov, psf.covariance(), epsilon = 1e-12);
    }
}
