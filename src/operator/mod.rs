//! Forward acquisition operator
//!
//! Maps a high-resolution volume to predicted slice intensities (motion +
//! PSF blur + resampling) and back through the exact adjoint:
//! - `psf`: Gaussian point-spread function of a slice acquisition
//! - `forward`: per-slice samplers and the stacked operator

pub mod forward;
pub mod psf;

pub use forward::*;
pub use psf::*;
