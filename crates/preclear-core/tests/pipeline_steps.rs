//! End-to-end pipeline scenarios driven by in-process scripted workers.
//!
//! The launcher seam replaces the external surface-scan and pattern-write
//! tools with deterministic handles, and the thermometer seam scripts the
//! temperature the governor sees, so the boundary scenarios run in
//! milliseconds without a device.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use preclear_core::checkpoint::{Checkpoint, CheckpointStore};
use preclear_core::config::RunConfig;
use preclear_core::device::DeviceDescriptor;
use preclear_core::error::SupervisorError;
use preclear_core::pipeline::{EXIT_THERMAL, Pipeline, RunOutcome, StepId};
use preclear_core::progress::ProgressSample;
use preclear_core::supervisor::{Outcome, SupervisorConfig, ThermalAbortKind, Thermometer};
use preclear_core::worker::{
    WorkerExit, WorkerHandle, WorkerKind, WorkerLauncher, WorkerSignal, WorkerSpec,
};
use tempfile::TempDir;

// =============================================================================
// Scripted worker harness
// =============================================================================

struct TestWorker {
    bytes: u64,
    advance: u64,
    ticks_left: i64,
    exit: WorkerExit,
    stalled: bool,
    paused: bool,
}

impl TestWorker {
    fn completing(spec: &WorkerSpec) -> Self {
        Self {
            bytes: 0,
            advance: (spec.expected_bytes / 4).max(1),
            ticks_left: 2,
            exit: WorkerExit::Success,
            stalled: false,
            paused: false,
        }
    }

    fn failing(code: i32) -> Self {
        Self {
            bytes: 0,
            advance: 0,
            ticks_left: 1,
            exit: WorkerExit::Failed(code),
            stalled: false,
            paused: false,
        }
    }

    fn stalling() -> Self {
        Self {
            bytes: 0,
            advance: 0,
            ticks_left: i64::MAX,
            exit: WorkerExit::Success,
            stalled: true,
            paused: false,
        }
    }
}

impl WorkerHandle for TestWorker {
    fn latest_progress(&self) -> ProgressSample {
        ProgressSample {
            bytes_done: self.bytes,
            rate: None,
            observed_at: Instant::now(),
        }
    }

    fn signal(&mut self, signal: WorkerSignal) -> Result<(), SupervisorError> {
        match signal {
            WorkerSignal::Pause => self.paused = true,
            WorkerSignal::Resume => self.paused = false,
            WorkerSignal::Interrupt | WorkerSignal::Kill => self.ticks_left = 0,
        }
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError> {
        if !self.paused && !self.stalled {
            self.bytes += self.advance;
        }
        if self.ticks_left <= 0 {
            return Ok(Some(self.exit));
        }
        self.ticks_left -= 1;
        Ok(None)
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// How the launcher scripts a given worker kind.
#[derive(Clone, Copy)]
enum Plan {
    AllSucceed,
    /// Fail the first (direct I/O) attempt of this kind; the buffered retry
    /// succeeds.
    FailDirect(WorkerKind),
    /// Fail every attempt of this kind.
    AlwaysFail(WorkerKind),
    /// Never advance bytes nor exit for this kind.
    Stall(WorkerKind),
}

#[derive(Clone)]
struct TestLauncher {
    plan: Plan,
    launches: Arc<Mutex<Vec<WorkerSpec>>>,
}

impl TestLauncher {
    fn new(plan: Plan) -> Self {
        Self {
            plan,
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn launched_kinds(&self) -> Vec<WorkerKind> {
        self.launches.lock().unwrap().iter().map(|s| s.kind).collect()
    }
}

impl WorkerLauncher for TestLauncher {
    type Handle = TestWorker;

    fn launch(&self, spec: &WorkerSpec) -> Result<TestWorker, SupervisorError> {
        self.launches.lock().unwrap().push(spec.clone());
        let worker = match self.plan {
            Plan::AllSucceed => TestWorker::completing(spec),
            Plan::FailDirect(kind) if spec.kind == kind && spec.direct_io => {
                TestWorker::failing(1)
            }
            Plan::AlwaysFail(kind) if spec.kind == kind => TestWorker::failing(1),
            Plan::Stall(kind) if spec.kind == kind => TestWorker::stalling(),
            _ => TestWorker::completing(spec),
        };
        Ok(worker)
    }
}

struct ScriptedThermometer {
    readings: VecDeque<Option<i32>>,
    steady: Option<i32>,
}

impl ScriptedThermometer {
    fn steady(temp_c: i32) -> Self {
        Self {
            readings: VecDeque::new(),
            steady: Some(temp_c),
        }
    }
}

impl Thermometer for ScriptedThermometer {
    fn poll(&mut self) -> Pin<Box<dyn Future<Output = Option<i32>> + Send + '_>> {
        let next = self.readings.pop_front().unwrap_or(self.steady);
        Box::pin(std::future::ready(next))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        path: PathBuf::from("/dev/testdisk"),
        name: "testdisk".to_string(),
        model: "Test Disk 1000".to_string(),
        serial: "TESTSERIAL01".to_string(),
        size_bytes: 1 << 30,
        logical_sector: 512,
        rotational: false,
    }
}

fn run_config(dirs: &TempDir) -> RunConfig {
    RunConfig {
        device: PathBuf::from("/dev/testdisk"),
        state_dir: dirs.path().join("state"),
        reports_dir: dirs.path().join("reports"),
        ..RunConfig::default()
    }
}

fn fast_timing() -> SupervisorConfig {
    SupervisorConfig {
        tick: Duration::from_millis(2),
        hang_warn: Duration::from_millis(40),
        hang_kill: Duration::from_millis(80),
        terminate_grace: Duration::from_millis(50),
    }
}

fn pipeline(
    config: RunConfig,
    launcher: TestLauncher,
    temps: ScriptedThermometer,
) -> Pipeline<TestLauncher> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut pipeline = Pipeline::new(config, descriptor(), launcher, shutdown).unwrap();
    pipeline.set_supervisor_timing(fast_timing());
    pipeline.set_thermometer(Box::new(temps));
    pipeline
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn clean_single_cycle_run() {
    let dirs = TempDir::new().unwrap();
    let launcher = TestLauncher::new(Plan::AllSucceed);
    let mut pipeline = pipeline(
        run_config(&dirs),
        launcher.clone(),
        ScriptedThermometer::steady(30),
    );

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success { cycles: 1 });
    assert_eq!(report.outcome.exit_code(), 0);

    // Workers ran in strict step order: pre-read, four pattern passes,
    // zero fill, verify read.
    assert_eq!(
        launcher.launched_kinds(),
        vec![
            WorkerKind::SurfaceRead,
            WorkerKind::PatternWrite,
            WorkerKind::PatternWrite,
            WorkerKind::PatternWrite,
            WorkerKind::PatternWrite,
            WorkerKind::ZeroWrite,
            WorkerKind::SurfaceRead,
        ]
    );

    let certificate = report.certificate.expect("certificate path");
    let text = std::fs::read_to_string(&certificate).unwrap();
    assert!(text.contains("SUCCESS"));
    assert!(text.contains("TESTSERIAL01"));
    for step in ["pre-read", "destructive", "zero-fill", "verify-read", "finalize"] {
        assert!(text.contains(step), "certificate missing {step}");
    }

    // Checkpoint deleted on success.
    assert!(!pipeline.checkpoint_path().exists());
}

#[tokio::test]
async fn thermal_abort_records_step_and_exit_code() {
    let dirs = TempDir::new().unwrap();
    let state_dir = dirs.path().join("state");
    let config = RunConfig {
        skip_preread: true,
        skip_destructive: true,
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::Stall(WorkerKind::ZeroWrite));
    // Non-rotational defaults abort at 70; 75 °C is over.
    let mut pipeline = pipeline(config, launcher.clone(), ScriptedThermometer::steady(75));

    let report = pipeline.run().await.unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::ThermalAbort {
            step: StepId::ZeroFill,
            kind: ThermalAbortKind::OverTemp,
        }
    );
    assert_eq!(report.outcome.exit_code(), EXIT_THERMAL);

    // Checkpoint survives with the aborted step.
    let store = CheckpointStore::for_serial(&state_dir, "TESTSERIAL01");
    let checkpoint = store.load().expect("checkpoint after thermal abort");
    assert_eq!(checkpoint.step, StepId::ZeroFill);
    assert_eq!(checkpoint.cycle, 1);

    let text = std::fs::read_to_string(report.certificate.unwrap()).unwrap();
    assert!(text.contains("aborted at step 4 (thermal"));
}

#[tokio::test]
async fn stalled_worker_fails_the_run() {
    let dirs = TempDir::new().unwrap();
    let config = RunConfig {
        skip_preread: true,
        skip_destructive: true,
        skip_postread: true,
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::Stall(WorkerKind::ZeroWrite));
    let mut pipeline = pipeline(config, launcher, ScriptedThermometer::steady(30));

    let report = pipeline.run().await.unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::StepFailed {
            step: StepId::ZeroFill,
            outcome: Outcome::AbortedStall,
        }
    );
    assert_ne!(report.outcome.exit_code(), 0);
    assert_ne!(report.outcome.exit_code(), EXIT_THERMAL);

    let text = std::fs::read_to_string(report.certificate.unwrap()).unwrap();
    assert!(text.contains("FAILED at step 4"));
    assert!(text.contains("stalled"));
}

#[tokio::test]
async fn direct_io_failure_retries_buffered_once() {
    let dirs = TempDir::new().unwrap();
    let config = RunConfig {
        skip_destructive: true,
        skip_zero: true,
        skip_postread: true,
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::FailDirect(WorkerKind::SurfaceRead));
    let mut pipeline = pipeline(config, launcher.clone(), ScriptedThermometer::steady(30));

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success { cycles: 1 });

    let launches = launcher.launches.lock().unwrap().clone();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].kind, WorkerKind::SurfaceRead);
    assert!(launches[0].direct_io);
    assert_eq!(launches[1].kind, WorkerKind::SurfaceRead);
    assert!(!launches[1].direct_io);
}

#[tokio::test]
async fn persistent_worker_failure_names_the_step() {
    let dirs = TempDir::new().unwrap();
    let config = RunConfig {
        skip_destructive: true,
        skip_zero: true,
        skip_postread: true,
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::AlwaysFail(WorkerKind::SurfaceRead));
    let mut pipeline = pipeline(config, launcher.clone(), ScriptedThermometer::steady(30));

    let report = pipeline.run().await.unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::StepFailed {
            step: StepId::PreRead,
            outcome: Outcome::WorkerFailed(1),
        }
    );
    // One direct attempt plus one buffered retry, nothing more.
    assert_eq!(launcher.launches.lock().unwrap().len(), 2);
    let text = std::fs::read_to_string(report.certificate.unwrap()).unwrap();
    assert!(text.contains("FAILED at step 1"));
}

#[tokio::test]
async fn resume_starts_at_checkpointed_step() {
    let dirs = TempDir::new().unwrap();
    let state_dir = dirs.path().join("state");
    let store = CheckpointStore::for_serial(&state_dir, "TESTSERIAL01");
    store
        .save(&Checkpoint {
            step: StepId::ZeroFill,
            cycle: 1,
            paused_seconds_total: 42,
            above_pause_seconds_total: 17,
            temp_min: Some(28),
            temp_max: Some(52),
        })
        .unwrap();

    let config = RunConfig {
        resume: true,
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::AllSucceed);
    let mut pipeline = pipeline(config, launcher.clone(), ScriptedThermometer::steady(30));

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success { cycles: 1 });

    // Steps 1-3 were not re-executed: the first worker is the zero fill.
    let kinds = launcher.launched_kinds();
    assert_eq!(
        kinds,
        vec![WorkerKind::ZeroWrite, WorkerKind::SurfaceRead],
        "resume must not re-run earlier steps"
    );

    // Checkpoint counters flowed into the certificate.
    let text = std::fs::read_to_string(report.certificate.unwrap()).unwrap();
    assert!(text.contains("42 s total"));

    // And the checkpoint is gone after success.
    assert_eq!(store.load(), None);
}

#[tokio::test]
async fn resume_with_fewer_cycles_than_checkpoint_is_rejected() {
    let dirs = TempDir::new().unwrap();
    let state_dir = dirs.path().join("state");
    let store = CheckpointStore::for_serial(&state_dir, "TESTSERIAL01");
    store
        .save(&Checkpoint {
            step: StepId::ZeroFill,
            cycle: 3,
            paused_seconds_total: 0,
            above_pause_seconds_total: 0,
            temp_min: None,
            temp_max: None,
        })
        .unwrap();

    // Prior run used --cycles 5; this invocation asks for fewer than the
    // checkpointed cycle.
    let config = RunConfig {
        resume: true,
        cycles: 1,
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::AllSucceed);
    let mut pipeline = pipeline(config, launcher.clone(), ScriptedThermometer::steady(30));

    let error = pipeline.run().await.expect_err("mismatch must be surfaced");
    let message = error.to_string();
    assert!(message.contains("below the checkpoint"), "got: {message}");

    // No work was attempted and the checkpoint survives for a corrected
    // invocation.
    assert!(launcher.launched_kinds().is_empty());
    assert!(store.load().is_some());
}

#[tokio::test]
async fn fresh_run_after_success_starts_at_step_one() {
    let dirs = TempDir::new().unwrap();
    let launcher = TestLauncher::new(Plan::AllSucceed);
    let mut first = pipeline(
        run_config(&dirs),
        launcher.clone(),
        ScriptedThermometer::steady(30),
    );
    first.run().await.unwrap();

    // Second run without --resume: starts from the beginning.
    let second_launcher = TestLauncher::new(Plan::AllSucceed);
    let mut second = pipeline(
        run_config(&dirs),
        second_launcher.clone(),
        ScriptedThermometer::steady(30),
    );
    second.run().await.unwrap();
    assert_eq!(
        second_launcher.launched_kinds().first(),
        Some(&WorkerKind::SurfaceRead)
    );
}

#[tokio::test]
async fn cancellation_preserves_checkpoint_and_writes_no_certificate() {
    let dirs = TempDir::new().unwrap();
    let state_dir = dirs.path().join("state");
    let launcher = TestLauncher::new(Plan::Stall(WorkerKind::SurfaceRead));
    let shutdown = Arc::new(AtomicBool::new(true));
    let mut pipeline =
        Pipeline::new(run_config(&dirs), descriptor(), launcher, shutdown).unwrap();
    pipeline.set_supervisor_timing(fast_timing());
    pipeline.set_thermometer(Box::new(ScriptedThermometer::steady(30)));

    let report = pipeline.run().await.unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Cancelled {
            step: StepId::PreRead
        }
    );
    assert!(report.certificate.is_none());

    let store = CheckpointStore::for_serial(&state_dir, "TESTSERIAL01");
    let checkpoint = store.load().expect("checkpoint preserved on cancel");
    assert_eq!(checkpoint.step, StepId::PreRead);
}

#[tokio::test]
async fn pattern_passes_run_in_list_order() {
    let dirs = TempDir::new().unwrap();
    let config = RunConfig {
        skip_preread: true,
        skip_zero: true,
        skip_postread: true,
        patterns: vec![0xAA, 0x55],
        block_size: Some(64),
        ..run_config(&dirs)
    };
    let launcher = TestLauncher::new(Plan::AllSucceed);
    let mut pipeline = pipeline(config, launcher.clone(), ScriptedThermometer::steady(30));
    pipeline.run().await.unwrap();

    let launches = launcher.launches.lock().unwrap().clone();
    let patterns: Vec<_> = launches
        .iter()
        .filter(|s| s.kind == WorkerKind::PatternWrite)
        .map(|s| (s.pattern.unwrap(), s.block_size))
        .collect();
    // List order preserved; 64-byte request raised to the 512-byte sector.
    assert_eq!(patterns, vec![(0xAA, 512), (0x55, 512)]);
}
