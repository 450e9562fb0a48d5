//! SRR-WASM: motion-corrected super-resolution reconstruction of MRI slice stacks
//!
//! Reconstructs one high-resolution isotropic volume from several
//! low-resolution stacks of 2D slices acquired in arbitrary orientations
//! under subject motion. Runs natively and compiled to WebAssembly for
//! browser-based processing.
//!
//! # Modules
//! - `volume`: grids, volumes, slice stacks, resampling
//! - `operator`: oriented-PSF forward operator and its adjoint
//! - `registration`: slice-to-volume registration (Levenberg-Marquardt)
//! - `reconstruction`: TK0/TK1/TV solvers with robust data losses
//! - `solvers`: CG, LSMR and bounded L-BFGS
//! - `pipeline`: two-step cycle controller and checkpoints
//! - `nifti_io`: NIfTI loading and saving

// Core modules
pub mod error;
pub mod transform;
pub mod volume;

// Algorithm modules
pub mod operator;
pub mod registration;
pub mod reconstruction;
pub mod solvers;
pub mod utils;

// Orchestration
pub mod config;
pub mod pipeline;

// I/O modules
pub mod nifti_io;

pub use config::ReconstructionConfig;
pub use error::{Result, SrrError};
pub use pipeline::{ReconstructionOutcome, TwoStepCycle};

use wasm_bindgen::prelude::*;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

#[allow(unused_macros)]
macro_rules! console_log {
    ($($t:tt)*) => (log(&format_args!($($t)*).to_string()))
}

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Run the full reconstruction on in-memory NIfTI files
///
/// `masks[i]` belongs to `stacks[i]`; a missing mask means the whole stack
/// is observed. Every stack starts with the motion model of
/// `config.registration.transform_type`.
pub fn reconstruct_from_bytes<F>(
    stacks: &[Vec<u8>],
    masks: &[Option<Vec<u8>>],
    config: ReconstructionConfig,
    progress_callback: F,
) -> Result<ReconstructionOutcome>
where
    F: FnMut(usize, usize),
{
    let transform_type = config.registration.transform_type;
    let stacks = stacks
        .iter()
        .enumerate()
        .map(|(i, bytes)| {
            let mask = masks.get(i).and_then(|m| m.as_deref());
            let image = nifti_io::volume_from_bytes(bytes, mask)?;
            Ok(volume::SliceStack::new(format!("stack{}", i), image, transform_type))
        })
        .collect::<Result<Vec<_>>>()?;

    TwoStepCycle::new(config, stacks)?.run_with_progress(progress_callback)
}

fn bytes_from_array(array: &js_sys::Array) -> Vec<Option<Vec<u8>>> {
    array
        .iter()
        .map(|value| {
            if value.is_null() || value.is_undefined() {
                None
            } else {
                Some(js_sys::Uint8Array::new(&value).to_vec())
            }
        })
        .collect()
}

fn run_wasm<F>(
    stacks: &js_sys::Array,
    masks: &js_sys::Array,
    config_json: &str,
    progress_callback: F,
) -> std::result::Result<Vec<u8>, JsValue>
where
    F: FnMut(usize, usize),
{
    let to_js = |e: SrrError| JsValue::from_str(&e.to_string());

    let config = ReconstructionConfig::from_json(config_json).map_err(to_js)?;
    let stacks: Vec<Vec<u8>> = bytes_from_array(stacks)
        .into_iter()
        .collect::<Option<_>>()
        .ok_or_else(|| JsValue::from_str("stack entries must be Uint8Array"))?;
    let masks = bytes_from_array(masks);

    console_log!("WASM SRR: {} stacks, {:?}, {} cycles", stacks.len(), config.reg_type, config.two_step_cycles);

    let outcome = reconstruct_from_bytes(&stacks, &masks, config, progress_callback).map_err(to_js)?;
    let bytes = nifti_io::volume_to_nifti_bytes(&outcome.volume, true).map_err(to_js)?;

    if outcome.all_solves_unconverged {
        console_log!("WASM SRR: no solve reached its tolerance, returning the best iterate");
    }
    let (nx, ny, nz) = outcome.volume.dims();
    console_log!("WASM SRR complete: {}x{}x{}, {} registration failures",
                 nx, ny, nz, outcome.diagnostics.total_registration_failures());
    Ok(bytes)
}

/// Super-resolution reconstruction
///
/// # Arguments
/// * `stacks` - Array of Uint8Array, one NIfTI (.nii or .nii.gz) per stack
/// * `masks` - Array of Uint8Array or null, one per stack (may be shorter)
/// * `config_json` - Reconstruction configuration; missing fields use defaults
///
/// # Returns
/// Reconstructed volume as gzipped NIfTI bytes
#[wasm_bindgen]
pub fn srr_reconstruct_wasm(
    stacks: &js_sys::Array,
    masks: &js_sys::Array,
    config_json: &str,
) -> std::result::Result<Vec<u8>, JsValue> {
    run_wasm(stacks, masks, config_json, |_, _| {})
}

/// Super-resolution reconstruction with progress callback
///
/// `progress_callback(current, total)` is called after every registration
/// and reconstruction stage.
#[wasm_bindgen]
pub fn srr_reconstruct_wasm_with_progress(
    stacks: &js_sys::Array,
    masks: &js_sys::Array,
    config_json: &str,
    progress_callback: &js_sys::Function,
) -> std::result::Result<Vec<u8>, JsValue> {
    let callback = progress_callback.clone();
    run_wasm(stacks, masks, config_json, |current, total| {
        let this = JsValue::null();
        let _ = callback.call2(&this,
            &JsValue::from(current as u32),
            &JsValue::from(total as u32));
    })
}

/// Default configuration as JSON
#[wasm_bindgen]
pub fn srr_default_config_wasm() -> std::result::Result<String, JsValue> {
    ReconstructionConfig::default()
        .to_json()
        .map_err(|e| JsValue::from_str(&e.to_string()))
}

/// Get version string
#[wasm_bindgen]
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

// ============================================================================
// Stack inspection
// ============================================================================

/// Geometry of one input stack, as reported to the browser before a run
#[derive(Debug, serde::Serialize)]
pub struct StackInfo {
    pub dims: [usize; 3],
    pub spacing: [f64; 3],
    pub n_slices: usize,
    pub orientation_preserving: bool,
    /// Row-major 4x4 index-to-physical affine
    pub affine: Vec<f64>,
}

impl StackInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let volume = nifti_io::volume_from_bytes(bytes, None)?;
        let (nx, ny, nz) = volume.dims();
        let (sx, sy, sz) = volume.spacing();
        Ok(Self {
            dims: [nx, ny, nz],
            spacing: [sx, sy, sz],
            n_slices: nz,
            orientation_preserving: volume.is_orientation_preserving(),
            affine: transform::matrix_to_row_major(volume.grid.affine()).to_vec(),
        })
    }
}

/// Inspect a stack (NIfTI bytes) without running anything
///
/// # Returns
/// JSON object with `dims`, `spacing`, `n_slices`, `orientation_preserving`
/// and `affine`
#[wasm_bindgen]
pub fn srr_stack_info_wasm(bytes: &[u8]) -> std::result::Result<String, JsValue> {
    let to_js = |e: SrrError| JsValue::from_str(&e.to_string());
    let info = StackInfo::from_bytes(bytes).map_err(to_js)?;
    console_log!("WASM stack info: {}x{}x{}, spacing=({:.2},{:.2},{:.2})",
                 info.dims[0], info.dims[1], info.dims[2],
                 info.spacing[0], info.spacing[1], info.spacing[2]);
    serde_json::to_string(&info).map_err(|e| to_js(e.into()))
}

// ============================================================================
// Tests
// ============================================================================
