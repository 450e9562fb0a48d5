//! Two-step cycle controller
//!
//! Alternates slice-to-volume registration and volume reconstruction for a
//! fixed number of cycles:
//!
//! Initializing → (Registering → Reconstructing) × cycles → Converged
//!
//! Initializing builds the reconstruction space, a first estimate by
//! scattered data approximation over all stacks, and solves once with
//! identity poses and the first solver profile. The target stack defines
//! the space and is never registered. There is no residual-based early
//! stop.

pub mod checkpoint;
pub mod space;

pub use checkpoint::{checkpoint_path, Checkpoint, SliceRecord, VolumeRecord};
pub use space::{correct_stack_intensities, initial_volume, reconstruction_grid, scattered_data_approximation};

use std::path::Path;

use crate::config::ReconstructionConfig;
use crate::error::{Result, SrrError};
use crate::operator::ForwardOperator;
use crate::reconstruction::{SolverProfile, SolverStrategy};
use crate::registration::SliceToVolumeRegistration;
use crate::volume::{SliceStack, Volume};

/// Controller state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    Initializing,
    Registering { cycle: usize },
    Reconstructing { cycle: usize },
    Converged,
}

/// Diagnostics of one cycle (cycle 0 is the initial estimate)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleDiagnostics {
    pub cycle: usize,
    /// Slices that kept their previous pose
    pub registration_failures: usize,
    /// Slices dropped from the solve for a degenerate transform
    pub excluded_slices: usize,
    pub solver_converged: bool,
    pub iterations: usize,
    pub data_residual: f64,
    pub objective: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunDiagnostics {
    pub cycles: Vec<CycleDiagnostics>,
}

impl RunDiagnostics {
    /// True when no solve of the run reported convergence
    pub fn all_solves_unconverged(&self) -> bool {
        !self.cycles.is_empty() && self.cycles.iter().all(|c| !c.solver_converged)
    }

    pub fn total_registration_failures(&self) -> usize {
        self.cycles.iter().map(|c| c.registration_failures).sum()
    }
}

/// Final result of a run
#[derive(Clone, Debug)]
pub struct ReconstructionOutcome {
    pub volume: Volume,
    /// Stacks with their final poses
    pub stacks: Vec<SliceStack>,
    pub diagnostics: RunDiagnostics,
    /// No reconstruction solve of the run reached its tolerance; the volume
    /// is still the best iterate found
    pub all_solves_unconverged: bool,
}

/// Alternating registration / reconstruction driver
pub struct TwoStepCycle {
    config: ReconstructionConfig,
    strategy: SolverStrategy,
    registration: SliceToVolumeRegistration,
    stacks: Vec<SliceStack>,
    volume: Option<Volume>,
    state: CycleState,
    diagnostics: RunDiagnostics,
    pending_failures: usize,
}

impl TwoStepCycle {
    /// Validate the configuration and take ownership of the stacks
    pub fn new(config: ReconstructionConfig, stacks: Vec<SliceStack>) -> Result<Self> {
        config.validate(stacks.len())?;
        let strategy = config.solver_strategy();
        let registration = SliceToVolumeRegistration::new(config.registration);
        Ok(Self {
            config,
            strategy,
            registration,
            stacks,
            volume: None,
            state: CycleState::Initializing,
            diagnostics: RunDiagnostics::default(),
            pending_failures: 0,
        })
    }

    /// Resume after the cycle recorded in the checkpoint at `path`
    pub fn from_checkpoint(config: ReconstructionConfig, stacks: Vec<SliceStack>, path: &Path) -> Result<Self> {
        let mut cycle = Self::new(config, stacks)?;
        if cycle.config.intensity_correction {
            correct_stack_intensities(&mut cycle.stacks, cycle.config.target_stack_index);
        }
        let checkpoint = Checkpoint::load(path)?;
        let volume = checkpoint.load_volume(path)?;
        checkpoint.apply(&mut cycle.stacks)?;

        let target = &cycle.stacks[cycle.config.target_stack_index];
        let grid = reconstruction_grid(&target.image.grid, cycle.config.isotropic_resolution, cycle.config.extra_frame_target)?;
        if grid.dims != volume.dims() {
            return Err(SrrError::GridMismatch { expected: grid.dims, actual: volume.dims() });
        }

        cycle.volume = Some(volume);
        cycle.state = cycle.after_reconstruction(checkpoint.cycle);
        tracing::info!(cycle = checkpoint.cycle, "resumed from checkpoint");
        Ok(cycle)
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Current estimate (absent before initialization)
    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }

    pub fn stacks(&self) -> &[SliceStack] {
        &self.stacks
    }

    pub fn diagnostics(&self) -> &RunDiagnostics {
        &self.diagnostics
    }

    /// Number of `step` calls from `Initializing` to `Converged`
    pub fn total_steps(&self) -> usize {
        1 + 2 * self.config.two_step_cycles
    }

    fn after_reconstruction(&self, cycle: usize) -> CycleState {
        if cycle >= self.config.two_step_cycles {
            CycleState::Converged
        } else {
            CycleState::Registering { cycle: cycle + 1 }
        }
    }

    /// Advance by one stage; returns the new state
    pub fn step(&mut self) -> Result<CycleState> {
        self.state = match self.state {
            CycleState::Initializing => {
                self.initialize()?;
                self.reconstruct(0, self.config.first_profile())?;
                self.after_reconstruction(0)
            }
            CycleState::Registering { cycle } => {
                self.register(cycle)?;
                CycleState::Reconstructing { cycle }
            }
            CycleState::Reconstructing { cycle } => {
                self.reconstruct(cycle, self.config.subsequent_profile())?;
                self.after_reconstruction(cycle)
            }
            CycleState::Converged => CycleState::Converged,
        };
        Ok(self.state)
    }

    /// Run to completion
    pub fn run(self) -> Result<ReconstructionOutcome> {
        self.run_with_progress(|_, _| {})
    }

    /// Run to completion, calling `progress_callback(step, total_steps)` after each stage
    pub fn run_with_progress<F>(mut self, mut progress_callback: F) -> Result<ReconstructionOutcome>
    where
        F: FnMut(usize, usize),
    {
        let total = self.total_steps();
        let mut done = match self.state {
            CycleState::Initializing => 0,
            CycleState::Registering { cycle } => 2 * cycle - 1,
            CycleState::Reconstructing { cycle } => 2 * cycle,
            CycleState::Converged => total,
        };

        while self.state != CycleState::Converged {
            self.step()?;
            done += 1;
            progress_callback(done.min(total), total);
        }

        let all_solves_unconverged = self.diagnostics.all_solves_unconverged();
        if all_solves_unconverged {
            tracing::warn!("no reconstruction solve reached its tolerance");
        }

        let volume = self
            .volume
            .ok_or_else(|| SrrError::Config("run finished without a volume estimate".into()))?;
        Ok(ReconstructionOutcome {
            volume,
            stacks: self.stacks,
            diagnostics: self.diagnostics,
            all_solves_unconverged,
        })
    }

    fn initialize(&mut self) -> Result<()> {
        let target_index = self.config.target_stack_index;
        if self.config.intensity_correction {
            correct_stack_intensities(&mut self.stacks, target_index);
        }
        for stack in self.stacks.iter_mut() {
            stack.reset_poses(self.config.registration.transform_type);
        }

        let target = &self.stacks[target_index];
        let grid = reconstruction_grid(&target.image.grid, self.config.isotropic_resolution, self.config.extra_frame_target)?;
        tracing::info!(dims = ?grid.dims, spacing = ?grid.spacing, stacks = self.stacks.len(), "reconstruction space");
        let volume = match self.config.sigma {
            Some(sigma) => scattered_data_approximation(&grid, &self.stacks, sigma),
            None => None,
        };
        self.volume = Some(volume.unwrap_or_else(|| initial_volume(target, &grid)));
        Ok(())
    }

    fn register(&mut self, cycle: usize) -> Result<()> {
        let volume = self
            .volume
            .as_ref()
            .ok_or_else(|| SrrError::Config("registration before initialization".into()))?;
        let target_index = self.config.target_stack_index;

        let mut failures = 0;
        for (s, stack) in self.stacks.iter_mut().enumerate() {
            if s == target_index {
                continue;
            }
            let report = self.registration.register_stack(volume, stack, s)?;
            failures += report.failed;
        }
        tracing::info!(cycle, failures, "registration stage finished");
        self.pending_failures = failures;
        Ok(())
    }

    fn reconstruct(&mut self, cycle: usize, profile: SolverProfile) -> Result<()> {
        let volume = self
            .volume
            .take()
            .ok_or_else(|| SrrError::Config("reconstruction before initialization".into()))?;

        for stack in self.stacks.iter_mut() {
            for slice in stack.slices.iter_mut() {
                slice.excluded = false;
            }
        }
        let (op, degenerate) = ForwardOperator::new(&volume.grid, &self.stacks);
        for err in &degenerate {
            if let SrrError::DegenerateTransform { stack, slice } = *err {
                self.stacks[stack].slices[slice].excluded = true;
                tracing::warn!(stack, slice, "slice excluded from solve: degenerate transform");
            }
        }

        let outcome = self.strategy.solve(&op, volume, profile)?;
        if !outcome.converged {
            tracing::warn!(cycle, iterations = outcome.iterations, "solver hit its iteration cap");
        }

        self.diagnostics.cycles.push(CycleDiagnostics {
            cycle,
            registration_failures: std::mem::take(&mut self.pending_failures),
            excluded_slices: degenerate.len(),
            solver_converged: outcome.converged,
            iterations: outcome.iterations,
            data_residual: outcome.data_residual,
            objective: outcome.objective,
        });
        tracing::info!(
            cycle,
            objective = outcome.objective,
            data_residual = outcome.data_residual,
            "reconstruction stage finished"
        );

        if self.config.write_motion_correction {
            if let Some(dir) = &self.config.dir_output {
                Checkpoint::capture(cycle, &outcome.volume, &self.stacks).save(dir, &outcome.volume)?;
            }
        }
        self.volume = Some(outcome.volume);
        Ok(())
    }
}
