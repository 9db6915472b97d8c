//! Pipeline executor: the (cycle, step) state machine.
//!
//! Drives the ordered steps of each cycle — pre-read, destructive pattern
//! passes, optional long self-test, zero fill, verify read, finalize —
//! honoring skip toggles, resume points, and abort signals. The executor
//! owns all mutable run state: it is the sole writer of the thermal
//! counters, the checkpoint file, and the certificate.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::certificate::{self, CertificateInput};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::RunConfig;
use crate::device::DeviceDescriptor;
use crate::error::Error;
use crate::smart::HealthSampler;
use crate::supervisor::{self, Outcome, SupervisorConfig, ThermalAbortKind, Thermometer};
use crate::thermal::Governor;
use crate::worker::{WorkerLauncher, WorkerSpec};

/// Exit code reserved for thermal aborts, distinguishable from generic
/// failure by callers.
pub const EXIT_THERMAL: i32 = 75;

// =============================================================================
// Step identifier
// =============================================================================

/// One named phase of a cycle. Ordered; `Finalize` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    PreRead,
    Destructive,
    LongSelfTest,
    ZeroFill,
    VerifyRead,
    Finalize,
}

impl StepId {
    /// Step number, 1 through 6.
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::PreRead => 1,
            Self::Destructive => 2,
            Self::LongSelfTest => 3,
            Self::ZeroFill => 4,
            Self::VerifyRead => 5,
            Self::Finalize => 6,
        }
    }

    /// Parse a step number in 1..=6.
    #[must_use]
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::PreRead),
            2 => Some(Self::Destructive),
            3 => Some(Self::LongSelfTest),
            4 => Some(Self::ZeroFill),
            5 => Some(Self::VerifyRead),
            6 => Some(Self::Finalize),
            _ => None,
        }
    }

    /// The following step, or `None` after `Finalize`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::PreRead => "pre-read",
            Self::Destructive => "destructive",
            Self::LongSelfTest => "long-self-test",
            Self::ZeroFill => "zero-fill",
            Self::VerifyRead => "verify-read",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {} ({})", self.number(), self.name())
    }
}

// =============================================================================
// Run outcome
// =============================================================================

/// Final classification of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every cycle completed; checkpoint cleared.
    Success { cycles: u32 },
    /// The thermal governor aborted the run.
    ThermalAbort {
        step: StepId,
        kind: ThermalAbortKind,
    },
    /// A step failed (worker exit or stall) even after any retry.
    StepFailed { step: StepId, outcome: Outcome },
    /// An external interrupt cancelled the run; checkpoint preserved.
    Cancelled { step: StepId },
}

impl RunOutcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success { .. } => 0,
            Self::ThermalAbort { .. } => EXIT_THERMAL,
            Self::StepFailed { .. } => 1,
            Self::Cancelled { .. } => 130,
        }
    }
}

/// What the pipeline hands back to the CLI: the outcome plus the certificate
/// path, when one was written.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub certificate: Option<std::path::PathBuf>,
}

// =============================================================================
// Pipeline
// =============================================================================

/// The supervised pre-clear pipeline for one device.
pub struct Pipeline<L: WorkerLauncher> {
    config: RunConfig,
    descriptor: DeviceDescriptor,
    launcher: L,
    sampler: HealthSampler,
    governor: Governor,
    store: CheckpointStore,
    shutdown: Arc<AtomicBool>,
    supervisor_config: SupervisorConfig,
    thermometer_override: Option<Box<dyn Thermometer>>,
    steps_run: Vec<String>,
    last_certificate: Option<std::path::PathBuf>,
}

impl<L: WorkerLauncher> Pipeline<L> {
    /// Build a pipeline. Merges thermal defaults for the device's media
    /// class with any flag overrides and enforces the hysteresis ordering.
    pub fn new(
        config: RunConfig,
        descriptor: DeviceDescriptor,
        launcher: L,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let thresholds = descriptor.default_thermal().with_overrides(
            config.temp_pause,
            config.temp_resume,
            config.temp_abort,
            Some(config.temp_fail_min),
        );
        if !config.temp_disable {
            thresholds.validate()?;
        }

        let sampler = HealthSampler::new(&descriptor, &config);
        let store = CheckpointStore::for_serial(&config.state_dir, &descriptor.serial);
        let supervisor_config = SupervisorConfig::from_run_config(&config);
        let governor = Governor::new(thresholds, !config.temp_disable);

        Ok(Self {
            config,
            descriptor,
            launcher,
            sampler,
            governor,
            store,
            shutdown,
            supervisor_config,
            thermometer_override: None,
            steps_run: Vec::new(),
            last_certificate: None,
        })
    }

    /// Replace the per-tick temperature source. By default the health
    /// sampler is consulted; in-process harnesses script readings here.
    pub fn set_thermometer(&mut self, thermometer: Box<dyn Thermometer>) {
        self.thermometer_override = Some(thermometer);
    }

    /// Override the supervision timing (tick, stall ladder, grace budget).
    pub fn set_supervisor_timing(&mut self, timing: SupervisorConfig) {
        self.supervisor_config = timing;
    }

    /// Path of the checkpoint file this run uses.
    #[must_use]
    pub fn checkpoint_path(&self) -> &std::path::Path {
        self.store.path()
    }

    /// Run the full pipeline: N cycles of ordered steps.
    pub async fn run(&mut self) -> Result<RunReport, Error> {
        let resume_point = if self.config.resume {
            self.store.load()
        } else {
            None
        };
        let (start_cycle, start_step) = match &resume_point {
            Some(checkpoint) => {
                // A checkpoint beyond this invocation's cycle count would
                // make the cycle loop an empty range: no step would run and
                // the in-progress checkpoint would be cleared as a
                // "success". Surface the mismatch instead.
                if checkpoint.cycle > self.config.cycles {
                    return Err(crate::error::ConfigError::CyclesBelowCheckpoint {
                        checkpoint_cycle: checkpoint.cycle,
                        cycles: self.config.cycles,
                    }
                    .into());
                }
                info!(
                    cycle = checkpoint.cycle,
                    step = %checkpoint.step,
                    "resuming from checkpoint"
                );
                self.governor.seed(
                    Duration::from_secs(checkpoint.paused_seconds_total),
                    Duration::from_secs(checkpoint.above_pause_seconds_total),
                    checkpoint.temp_min,
                    checkpoint.temp_max,
                );
                (checkpoint.cycle, checkpoint.step)
            }
            None => (1, StepId::PreRead),
        };

        self.sampler.ensure_initial().await;

        for cycle in start_cycle..=self.config.cycles {
            let mut step = if cycle == start_cycle {
                start_step
            } else {
                StepId::PreRead
            };
            self.steps_run.clear();
            loop {
                self.governor.begin_step();
                self.write_checkpoint(step, cycle)?;
                let outcome = self.run_step(step, cycle).await?;
                match outcome {
                    Outcome::Completed => {}
                    Outcome::AbortedThermal(kind) => {
                        // Counters moved during the abort tick; persist them
                        // before exiting.
                        self.write_checkpoint(step, cycle)?;
                        let run_outcome = RunOutcome::ThermalAbort { step, kind };
                        let certificate = self.emit_certificate(&run_outcome);
                        return Ok(RunReport {
                            outcome: run_outcome,
                            certificate,
                        });
                    }
                    Outcome::AbortedStall | Outcome::WorkerFailed(_) => {
                        let run_outcome = RunOutcome::StepFailed { step, outcome };
                        let certificate = self.emit_certificate(&run_outcome);
                        return Ok(RunReport {
                            outcome: run_outcome,
                            certificate,
                        });
                    }
                    Outcome::Cancelled => {
                        info!(cycle, step = %step, "run cancelled, checkpoint preserved");
                        return Ok(RunReport {
                            outcome: RunOutcome::Cancelled { step },
                            certificate: None,
                        });
                    }
                }
                match step.next() {
                    Some(next) => step = next,
                    None => break,
                }
            }
            info!(cycle, total = self.config.cycles, "cycle complete");
        }

        self.store.clear()?;
        Ok(RunReport {
            outcome: RunOutcome::Success {
                cycles: self.config.cycles,
            },
            certificate: self.last_certificate.clone(),
        })
    }

    async fn run_step(&mut self, step: StepId, cycle: u32) -> Result<Outcome, Error> {
        info!(cycle, step = %step, "starting");
        match step {
            StepId::PreRead => {
                if self.config.skip_preread {
                    info!(step = %step, "skipped by flag");
                    return Ok(Outcome::Completed);
                }
                let spec = WorkerSpec::surface_read(
                    self.descriptor.path.clone(),
                    self.descriptor.size_bytes,
                );
                let outcome = self.supervise_with_fallback(spec, step).await?;
                self.note_step(step, &outcome);
                Ok(outcome)
            }
            StepId::Destructive => {
                if self.config.skip_destructive {
                    info!(step = %step, "skipped by flag");
                    return Ok(Outcome::Completed);
                }
                let block_size = self.effective_block_size();
                let patterns = self.config.patterns.clone();
                for (index, pattern) in patterns.iter().enumerate() {
                    info!(
                        step = %step,
                        pattern = format!("{pattern:#04x}"),
                        pass = index + 1,
                        passes = patterns.len(),
                        "starting pattern pass"
                    );
                    let spec = WorkerSpec::pattern_write(
                        self.descriptor.path.clone(),
                        self.descriptor.size_bytes,
                        *pattern,
                        block_size,
                    );
                    // Each pattern is supervised as an independent worker:
                    // the paused flag starts clear, the counters carry on.
                    let outcome = self.supervise_spec(&spec, step).await?;
                    if outcome != Outcome::Completed {
                        return Ok(outcome);
                    }
                }
                self.steps_run
                    .push(format!("{step} [{} patterns]", patterns.len()));
                Ok(Outcome::Completed)
            }
            StepId::LongSelfTest => {
                if !self.config.smart_long {
                    info!(step = %step, "not requested, skipping");
                    return Ok(Outcome::Completed);
                }
                // The test proceeds inside the device; scheduling failure is
                // not fatal to the run.
                if self.sampler.schedule_long_test().await {
                    self.steps_run.push(step.to_string());
                }
                Ok(Outcome::Completed)
            }
            StepId::ZeroFill => {
                if self.config.skip_zero {
                    info!(step = %step, "skipped by flag");
                    return Ok(Outcome::Completed);
                }
                let spec = WorkerSpec::zero_write(
                    self.descriptor.path.clone(),
                    self.descriptor.size_bytes,
                );
                let outcome = self.supervise_with_fallback(spec, step).await?;
                self.note_step(step, &outcome);
                Ok(outcome)
            }
            StepId::VerifyRead => {
                if self.config.skip_postread {
                    info!(step = %step, "skipped by flag");
                    return Ok(Outcome::Completed);
                }
                let spec = WorkerSpec::surface_read(
                    self.descriptor.path.clone(),
                    self.descriptor.size_bytes,
                );
                let outcome = self.supervise_with_fallback(spec, step).await?;
                self.note_step(step, &outcome);
                Ok(outcome)
            }
            StepId::Finalize => {
                // Force a final snapshot regardless of staleness.
                self.sampler.capture().await;
                self.steps_run.push(step.to_string());
                let run_outcome = RunOutcome::Success { cycles: cycle };
                self.last_certificate = self.emit_certificate(&run_outcome);
                Ok(Outcome::Completed)
            }
        }
    }

    /// Pattern-write block size: the logical sector size unless overridden,
    /// and never below the logical sector size.
    fn effective_block_size(&self) -> u64 {
        let sector = self.descriptor.logical_sector;
        match self.config.block_size {
            Some(requested) if requested < sector => {
                warn!(
                    requested,
                    sector, "block size below logical sector size, raising"
                );
                sector
            }
            Some(requested) => requested,
            None => sector,
        }
    }

    fn note_step(&mut self, step: StepId, outcome: &Outcome) {
        if *outcome == Outcome::Completed {
            self.steps_run.push(step.to_string());
        }
    }

    /// Supervise a spec; on worker failure with direct I/O requested, retry
    /// once buffered before giving up.
    async fn supervise_with_fallback(
        &mut self,
        spec: WorkerSpec,
        step: StepId,
    ) -> Result<Outcome, Error> {
        let outcome = self.supervise_spec(&spec, step).await?;
        if let Outcome::WorkerFailed(code) = outcome {
            if spec.direct_io {
                warn!(
                    step = %step,
                    exit_code = code,
                    "worker failed with direct I/O, retrying buffered"
                );
                return self.supervise_spec(&spec.without_direct_io(), step).await;
            }
        }
        Ok(outcome)
    }

    async fn supervise_spec(&mut self, spec: &WorkerSpec, step: StepId) -> Result<Outcome, Error> {
        let handle = self.launcher.launch(spec)?;
        let label = step.to_string();
        let thermometer: &mut dyn Thermometer = match self.thermometer_override.as_deref_mut() {
            Some(thermometer) => thermometer,
            None => &mut self.sampler,
        };
        let outcome = supervisor::supervise(
            handle,
            &label,
            spec.expected_bytes,
            &mut self.governor,
            thermometer,
            &self.shutdown,
            &self.supervisor_config,
        )
        .await?;
        Ok(outcome)
    }

    /// Write a certificate for the given outcome. Failures to write are
    /// logged, not fatal: the run's exit code must survive a full reports
    /// partition.
    fn emit_certificate(&self, outcome: &RunOutcome) -> Option<std::path::PathBuf> {
        let input = CertificateInput {
            descriptor: &self.descriptor,
            thresholds: self.governor.thresholds(),
            governor_enabled: !self.config.temp_disable,
            thermal: self.governor.record(),
            outcome,
            steps_run: &self.steps_run,
            initial_snapshot: self.sampler.initial(),
            final_snapshot: self.sampler.latest(),
            initial_snapshot_path: self.sampler.initial_path(),
            final_snapshot_path: self.sampler.latest_path(),
        };
        match certificate::write_certificate(
            &self.config.reports_dir,
            &self.descriptor.serial,
            &input,
        ) {
            Ok(path) => {
                info!(path = %path.display(), "certificate written");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "failed to write certificate");
                None
            }
        }
    }

    fn write_checkpoint(&self, step: StepId, cycle: u32) -> Result<(), Error> {
        let record = self.governor.record();
        self.store.save(&Checkpoint {
            step,
            cycle,
            paused_seconds_total: record.paused_total.as_secs(),
            above_pause_seconds_total: record.above_pause_total.as_secs(),
            temp_min: record.run_min_c,
            temp_max: record.run_max_c,
        })?;
        Ok(())
    }
}
