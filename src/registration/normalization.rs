//! Z-score normalization of transform parameter matrices
//!
//! Rows are slices, columns are parameters. Coefficients (per-column mean
//! and standard deviation) are computed once and reused for the lifetime of
//! a registration run, so every slice is optimized in the same scaled space.

use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Columns with a standard deviation below this are left unscaled
pub const STD_EPSILON: f64 = 1e-8;

#[derive(Clone, Debug)]
pub struct ParameterNormalization {
    parameters: Array2<f64>,
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl ParameterNormalization {
    /// Hold `parameters` (n_slices × n_params); coefficients start as the
    /// identity scaling until computed
    pub fn new(parameters: Array2<f64>) -> Self {
        let n = parameters.ncols();
        Self { parameters, mean: Array1::zeros(n), std: Array1::ones(n) }
    }

    /// Per-column mean and (population) standard deviation
    pub fn compute_normalization_coefficients(&mut self) {
        let n_rows = self.parameters.nrows();
        if n_rows == 0 {
            return;
        }
        self.mean = self.parameters.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(self.parameters.ncols()));
        self.std = self.parameters.std_axis(Axis(0), 0.0).mapv(|s| if s < STD_EPSILON { 1.0 } else { s });
    }

    /// (M - mean) / std, column-wise
    pub fn normalize_parameters(&self, parameters: &Array2<f64>) -> Array2<f64> {
        (parameters - &self.mean) / &self.std
    }

    /// M * std + mean, column-wise
    pub fn denormalize_parameters(&self, parameters: &Array2<f64>) -> Array2<f64> {
        parameters * &self.std + &self.mean
    }

    /// Row 0: mean, row 1: standard deviation
    pub fn get_normalization_coefficients(&self) -> Array2<f64> {
        let n = self.mean.len();
        let mut coefficients = Array2::zeros((2, n));
        coefficients.row_mut(0).assign(&self.mean);
        coefficients.row_mut(1).assign(&self.std);
        coefficients
    }

    /// Normalize a single parameter vector
    pub fn normalize_row(&self, row: ArrayView1<f64>) -> Array1<f64> {
        (&row - &self.mean) / &self.std
    }

    /// Denormalize a single parameter vector
    pub fn denormalize_row(&self, row: ArrayView1<f64>) -> Array1<f64> {
        &row * &self.std + &self.mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Array2<f64> {
        array![
            [0.1, -2.0, 5.0, 1.0],
            [0.3, 4.0, 5.0, 2.0],
            [-0.2, 1.0, 5.0, 7.0],
            [0.05, 0.5, 5.0, -3.0],
        ]
    }

    #[test]
    fn test_round_trip() {
        let m = sample();
        let mut norm = ParameterNormalization::new(m.clone());
        norm.compute_normalization_coefficients();
        let back = norm.denormalize_parameters(&norm.normalize_parameters(&m));
        for (a, b) in back.iter().zip(m.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_mean_unit_std() {
        let m = sample();
        let mut norm = ParameterNormalization::new(m.clone());
        norm.compute_normalization_coefficients();
        let z = norm.normalize_parameters(&m);

        for (c, col) in z.columns().into_iter().enumerate() {
            let mean = col.mean().unwrap();
            assert!(mean.abs() < 1e-6, "column {} mean {}", c, mean);
            if c == 2 {
                // constant column: std below epsilon, left unscaled
                assert!(col.iter().all(|v| v.abs() < 1e-12));
            } else {
                assert!((col.std(0.0) - 1.0).abs() < 1e-6, "column {}", c);
            }
        }
    }

    #[test]
    fn test_coefficients_layout() {
        let mut norm = ParameterNormalization::new(sample());
        norm.compute_normalization_coefficients();
        let coeffs = norm.get_normalization_coefficients();
        assert_eq!(coeffs.dim(), (2, 4));
        assert!((coeffs[[0, 2]] - 5.0).abs() < 1e-12);
        assert_eq!(coeffs[[1, 2]], 1.0);

        let row = norm.normalize_row(sample().row(1));
        let back = norm.denormalize_row(row.view());
        for (a, b) in back.iter().zip(sample().row(1).iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
