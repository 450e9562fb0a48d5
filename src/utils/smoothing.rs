//! Separable Gaussian smoothing on a voxel grid
//!
//! Samples outside the grid count as zero, so smoothing a quantity and its
//! weights with the same call keeps their ratio consistent at the borders.

use rayon::prelude::*;

/// Normalized 1D kernel truncated at three standard deviations
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.into_iter().map(|w| w / total).collect()
}

fn smooth_axis(data: &[f64], dims: (usize, usize, usize), axis: usize, kernel: &[f64]) -> Vec<f64> {
    let (nx, ny, nz) = dims;
    let len = [nx, ny, nz][axis];
    let stride = [1, nx, nx * ny][axis];
    let half = (kernel.len() / 2) as isize;

    let mut out = vec![0.0; data.len()];
    out.par_iter_mut().enumerate().for_each(|(idx, o)| {
        let pos = (idx / stride) % len;
        let base = idx - pos * stride;
        let mut acc = 0.0;
        for (t, &w) in kernel.iter().enumerate() {
            let q = pos as isize + t as isize - half;
            if q >= 0 && (q as usize) < len {
                acc += w * data[base + q as usize * stride];
            }
        }
        *o = acc;
    });
    out
}

/// Smooth `data` with a Gaussian of standard deviation `sigma` (mm)
///
/// Axes whose standard deviation is below a hundredth of a voxel are left
/// untouched.
pub fn gaussian_smooth(data: &[f64], dims: (usize, usize, usize), spacing: (f64, f64, f64), sigma: f64) -> Vec<f64> {
    let mut result = data.to_vec();
    for (axis, h) in [spacing.0, spacing.1, spacing.2].into_iter().enumerate() {
        let sigma_voxels = sigma / h;
        if sigma_voxels < 0.01 {
            continue;
        }
        result = smooth_axis(&result, dims, axis, &gaussian_kernel(sigma_voxels));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_sums_to_one() {
        let k = gaussian_kernel(1.5);
        assert_eq!(k.len(), 11);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(k[5] > k[4] && (k[4] - k[6]).abs() < 1e-15);
    }

    #[test]
    fn test_interior_impulse_keeps_mass() {
        let dims = (9, 9, 9);
        let mut data = vec![0.0; 729];
        data[4 + 4 * 9 + 4 * 81] = 1.0;
        let smoothed = gaussian_smooth(&data, dims, (1.0, 1.0, 2.0), 1.0);

        assert!((smoothed.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        // Wider spread in voxels along the finer axes
        let centre = 4 + 4 * 9 + 4 * 81;
        assert!(smoothed[centre + 1] > smoothed[centre + 81]);
        assert!((smoothed[centre + 1] - smoothed[centre + 9]).abs() < 1e-15);
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let data: Vec<f64> = (0..24).map(|i| i as f64).collect();
        assert_eq!(gaussian_smooth(&data, (2, 3, 4), (1.0, 1.0, 1.0), 0.0), data);
    }
}
