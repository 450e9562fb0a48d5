//! Error types for the reconstruction engine

use std::io;
use thiserror::Error;

/// Result type for reconstruction operations
pub type Result<T> = std::result::Result<T, SrrError>;

/// Errors that can occur during a reconstruction run
#[derive(Error, Debug)]
pub enum SrrError {
    /// Invalid configuration, detected before any optimization starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Image grids that must agree do not
    #[error("Grid mismatch: expected {expected:?}, got {actual:?}")]
    GridMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    /// Non-invertible pose or image affine
    #[error("Degenerate transform for stack {stack}, slice {slice}")]
    DegenerateTransform { stack: usize, slice: usize },

    /// Every slice of a stack failed registration
    #[error("Registration failed for every slice of stack {stack}")]
    StackRegistrationFailed { stack: usize },

    /// Failed to read or write a file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed NIfTI data
    #[error("NIfTI error: {0}")]
    Nifti(String),

    /// Checkpoint (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SrrError {
    /// Whether the error aborts the whole run
    ///
    /// Degenerate transforms only drop the affected slice from the current
    /// solve; everything else is fatal for the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SrrError::DegenerateTransform { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!SrrError::DegenerateTransform { stack: 0, slice: 3 }.is_fatal());
        assert!(SrrError::Config("alpha".into()).is_fatal());
        assert!(SrrError::StackRegistrationFailed { stack: 1 }.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = SrrError::GridMismatch { expected: (2, 2, 2), actual: (2, 2, 3) };
        assert_eq!(err.to_string(), "Grid mismatch: expected (2, 2, 2), got (2, 2, 3)");
    }
}
