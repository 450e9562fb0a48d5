//! Finite-difference gradient on a voxel grid
//!
//! Forward differences with zero-flux boundaries: the difference across the
//! last plane of each axis is zero. Components are stacked as
//! `[gx; gy; gz]`, each of length `nx*ny*nz`.

/// Stacked forward-difference gradient of `x` into `g` (length `3*n`)
#[inline]
pub fn forward_gradient(
    g: &mut [f64],
    x: &[f64],
    dims: (usize, usize, usize),
    spacing: (f64, f64, f64),
) {
    let (nx, ny, nz) = dims;
    let n = nx * ny * nz;
    let (gx, rest) = g.split_at_mut(n);
    let (gy, gz) = rest.split_at_mut(n);
    let (hx, hy, hz) = (1.0 / spacing.0, 1.0 / spacing.1, 1.0 / spacing.2);
    let plane = nx * ny;

    // Fortran order: index = i + j*nx + k*nx*ny
    for k in 0..nz {
        for j in 0..ny {
            let row = j * nx + k * plane;
            for i in 0..nx {
                let idx = row + i;
                let v = x[idx];
                gx[idx] = if i + 1 < nx { (x[idx + 1] - v) * hx } else { 0.0 };
                gy[idx] = if j + 1 < ny { (x[idx + nx] - v) * hy } else { 0.0 };
                gz[idx] = if k + 1 < nz { (x[idx + plane] - v) * hz } else { 0.0 };
            }
        }
    }
}

/// Exact transpose of [`forward_gradient`] (the negative backward divergence)
///
/// Entries of `g` on the last plane of each axis are ignored.
#[inline]
pub fn gradient_adjoint(
    out: &mut [f64],
    g: &[f64],
    dims: (usize, usize, usize),
    spacing: (f64, f64, f64),
) {
    let (nx, ny, nz) = dims;
    let n = nx * ny * nz;
    let (gx, gy, gz) = (&g[..n], &g[n..2 * n], &g[2 * n..3 * n]);
    let (hx, hy, hz) = (1.0 / spacing.0, 1.0 / spacing.1, 1.0 / spacing.2);
    let plane = nx * ny;

    for k in 0..nz {
        for j in 0..ny {
            let row = j * nx + k * plane;
            for i in 0..nx {
                let idx = row + i;
                let here_x = if i + 1 < nx { gx[idx] } else { 0.0 };
                let here_y = if j + 1 < ny { gy[idx] } else { 0.0 };
                let here_z = if k + 1 < nz { gz[idx] } else { 0.0 };
                let prev_x = if i > 0 { gx[idx - 1] } else { 0.0 };
                let prev_y = if j > 0 { gy[idx - nx] } else { 0.0 };
                let prev_z = if k > 0 { gz[idx - plane] } else { 0.0 };

                out[idx] = (prev_x - here_x) * hx + (prev_y - here_y) * hy + (prev_z - here_z) * hz;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grad(x: &[f64], dims: (usize, usize, usize), spacing: (f64, f64, f64)) -> Vec<f64> {
        let mut g = vec![0.0; 3 * x.len()];
        forward_gradient(&mut g, x, dims, spacing);
        g
    }

    #[test]
    fn test_constant_has_zero_gradient() {
        let g = grad(&[1.0; 64], (4, 4, 4), (1.0, 1.0, 1.0));
        assert!(g.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_ramp_with_spacing() {
        let dims = (4, 3, 2);
        let x: Vec<f64> = (0..24).map(|idx| (idx % 4) as f64).collect();
        let g = grad(&x, dims, (0.5, 1.0, 1.0));
        assert_eq!(g[0], 2.0);
        assert_eq!(g[3], 0.0);
        assert_eq!(g[24], 0.0);
    }

    #[test]
    fn test_adjoint_identity() {
        // <∇x, h> = <x, ∇ᵀh>
        let dims = (4, 5, 3);
        let spacing = (1.0, 2.0, 0.5);
        let n = 60;
        let x: Vec<f64> = (0..n).map(|i| ((i as f64) * 0.37).cos()).collect();
        let h: Vec<f64> = (0..3 * n).map(|i| ((i as f64) * 0.2).sin()).collect();

        let mut adj = vec![0.0; n];
        gradient_adjoint(&mut adj, &h, dims, spacing);

        let lhs: f64 = grad(&x, dims, spacing).iter().zip(&h).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(&adj).map(|(a, b)| a * b).sum();
        let rel_err = (lhs - rhs).abs() / (lhs.abs() + rhs.abs() + 1e-10);
        assert!(rel_err < 1e-10, "lhs={}, rhs={}", lhs, rhs);
    }
}
