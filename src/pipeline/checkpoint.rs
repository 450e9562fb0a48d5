//! Per-cycle checkpoints
//!
//! A checkpoint is a JSON record of every slice's pose and intensity
//! correction plus the volume estimate written next to it as NIfTI:
//!
//! - `checkpoint_cycle_{c}.json`
//! - `srr_cycle_{c}.nii.gz`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::nifti_io::{load_volume, save_volume};
use crate::transform::SlicePose;
use crate::volume::{SliceStack, Volume};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// File name relative to the checkpoint directory
    pub file: String,
    pub dims: [usize; 3],
    pub spacing: [f64; 3],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub stack: usize,
    pub slice: usize,
    pub pose: SlicePose,
    pub intensity: [f64; 2],
    pub excluded: bool,
}

/// State after a completed cycle (0 = initial estimate)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cycle: usize,
    pub volume: VolumeRecord,
    pub poses: Vec<SliceRecord>,
}

pub fn checkpoint_path(dir: &Path, cycle: usize) -> PathBuf {
    dir.join(format!("checkpoint_cycle_{}.json", cycle))
}

impl Checkpoint {
    /// Snapshot the stacks' poses for `cycle`
    pub fn capture(cycle: usize, volume: &Volume, stacks: &[SliceStack]) -> Self {
        let (nx, ny, nz) = volume.dims();
        let (sx, sy, sz) = volume.spacing();
        let poses = stacks
            .iter()
            .enumerate()
            .flat_map(|(s, stack)| {
                stack.slices.iter().map(move |slice| SliceRecord {
                    stack: s,
                    slice: slice.index,
                    pose: slice.pose.clone(),
                    intensity: slice.intensity,
                    excluded: slice.excluded,
                })
            })
            .collect();
        Self {
            cycle,
            volume: VolumeRecord {
                file: format!("srr_cycle_{}.nii.gz", cycle),
                dims: [nx, ny, nz],
                spacing: [sx, sy, sz],
            },
            poses,
        }
    }

    /// Write the JSON record and the volume into `dir`; returns the JSON path
    pub fn save(&self, dir: &Path, volume: &Volume) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        save_volume(volume, dir.join(&self.volume.file))?;
        let path = checkpoint_path(dir, self.cycle);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::info!(cycle = self.cycle, path = %path.display(), "checkpoint written");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load the volume referenced by a checkpoint at `path`
    pub fn load_volume(&self, path: &Path) -> Result<Volume> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let volume = load_volume(dir.join(&self.volume.file))?;
        let dims = (self.volume.dims[0], self.volume.dims[1], self.volume.dims[2]);
        if volume.dims() != dims {
            return Err(SrrError::GridMismatch { expected: dims, actual: volume.dims() });
        }
        Ok(volume)
    }

    /// Restore poses into `stacks`
    pub fn apply(&self, stacks: &mut [SliceStack]) -> Result<()> {
        for record in &self.poses {
            let slice = stacks
                .get_mut(record.stack)
                .and_then(|stack| stack.slices.get_mut(record.slice))
                .ok_or_else(|| {
                    SrrError::Config(format!(
                        "checkpoint references stack {} slice {} which does not exist",
                        record.stack, record.slice
                    ))
                })?;
            slice.pose = record.pose.clone();
            slice.intensity = record.intensity;
            slice.excluded = record.excluded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformType;
    use crate::volume::GridSpec;

    fn stacks() -> Vec<SliceStack> {
        let grid = GridSpec::axis_aligned((4, 4, 3), (1.0, 1.0, 2.0), [0.0; 3]).unwrap();
        vec![
            SliceStack::new("a", Volume::zeros(grid.clone()), TransformType::Rigid),
            SliceStack::new("b", Volume::zeros(grid), TransformType::Rigid),
        ]
    }

    #[test]
    fn test_save_load_apply() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridSpec::axis_aligned((5, 5, 5), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        let volume = Volume::new((0..125).map(|i| i as f64).collect(), grid).unwrap();

        let mut original = stacks();
        original[1].slices[2].pose.params = vec![0.1, 0.0, -0.2, 1.5, 0.0, 2.0];
        original[1].slices[2].intensity = [1.2, 0.3];
        original[0].slices[1].excluded = true;

        let checkpoint = Checkpoint::capture(2, &volume, &original);
        let path = checkpoint.save(dir.path(), &volume).unwrap();
        assert_eq!(path, checkpoint_path(dir.path(), 2));

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.load_volume(&path).unwrap().data, volume.data);

        let mut restored = stacks();
        loaded.apply(&mut restored).unwrap();
        assert_eq!(restored[1].slices[2], original[1].slices[2]);
        assert!(restored[0].slices[1].excluded);
    }

    #[test]
    fn test_apply_rejects_unknown_slices() {
        let grid = GridSpec::axis_aligned((2, 2, 2), (1.0, 1.0, 1.0), [0.0; 3]).unwrap();
        let checkpoint = Checkpoint::capture(0, &Volume::zeros(grid), &stacks());
        let mut fewer = stacks();
        fewer.truncate(1);
        assert!(matches!(checkpoint.apply(&mut fewer), Err(SrrError::Config(_))));
    }
}
