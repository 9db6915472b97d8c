//! Supervised worker abstraction: kinds, command specs, and process handles.
//!
//! The four worker kinds are variants of one capability — spawn, stream
//! progress, signal, wait. The supervisor is polymorphic over
//! [`WorkerHandle`], so tests drive it with in-process scripted workers while
//! production uses [`ProcessLauncher`], which spawns the external surface
//! scan, pattern write, and health tools as child processes.

use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::debug;

use crate::config::DD_BLOCK_SIZE;
use crate::error::SupervisorError;
use crate::progress::{ProgressDiscipline, ProgressParser, ProgressSample};

// =============================================================================
// Worker kind
// =============================================================================

/// What a worker does to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Full-surface read of the whole device.
    SurfaceRead,
    /// Full-surface zero write with an end-of-stream sync.
    ZeroWrite,
    /// Full-surface destructive pattern write.
    PatternWrite,
    /// Health interrogation; no byte progress.
    HealthProbe,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SurfaceRead => write!(f, "surface-read"),
            Self::ZeroWrite => write!(f, "zero-write"),
            Self::PatternWrite => write!(f, "pattern-write"),
            Self::HealthProbe => write!(f, "health-probe"),
        }
    }
}

// =============================================================================
// Worker spec
// =============================================================================

/// Everything needed to spawn one worker against the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub kind: WorkerKind,
    pub device: PathBuf,
    /// Expected total byte count (zero for health probes).
    pub expected_bytes: u64,
    /// Whether to request direct I/O. Dropped on the fallback retry.
    pub direct_io: bool,
    /// Pattern byte for pattern writes.
    pub pattern: Option<u8>,
    /// Write block size in bytes for pattern writes.
    pub block_size: u64,
    /// Health-interface transport hint (`-d <type>`).
    pub smart_type: Option<String>,
}

impl WorkerSpec {
    #[must_use]
    pub fn surface_read(device: PathBuf, expected_bytes: u64) -> Self {
        Self {
            kind: WorkerKind::SurfaceRead,
            device,
            expected_bytes,
            direct_io: true,
            pattern: None,
            block_size: 0,
            smart_type: None,
        }
    }

    #[must_use]
    pub fn zero_write(device: PathBuf, expected_bytes: u64) -> Self {
        Self {
            kind: WorkerKind::ZeroWrite,
            device,
            expected_bytes,
            direct_io: true,
            pattern: None,
            block_size: 0,
            smart_type: None,
        }
    }

    #[must_use]
    pub fn pattern_write(device: PathBuf, expected_bytes: u64, pattern: u8, block_size: u64) -> Self {
        Self {
            kind: WorkerKind::PatternWrite,
            device,
            expected_bytes,
            direct_io: false,
            pattern: Some(pattern),
            block_size,
            smart_type: None,
        }
    }

    #[must_use]
    pub fn health_probe(device: PathBuf, smart_type: Option<String>) -> Self {
        Self {
            kind: WorkerKind::HealthProbe,
            device,
            expected_bytes: 0,
            direct_io: false,
            pattern: None,
            block_size: 0,
            smart_type,
        }
    }

    /// The same spec with direct I/O dropped, for the buffered retry.
    #[must_use]
    pub fn without_direct_io(&self) -> Self {
        Self {
            direct_io: false,
            ..self.clone()
        }
    }

    /// How this worker's diagnostic stream is parsed.
    #[must_use]
    pub fn discipline(&self) -> ProgressDiscipline {
        match self.kind {
            WorkerKind::SurfaceRead | WorkerKind::ZeroWrite => ProgressDiscipline::ByteLines,
            WorkerKind::PatternWrite => ProgressDiscipline::PercentTokens {
                expected_bytes: self.expected_bytes,
            },
            WorkerKind::HealthProbe => ProgressDiscipline::Opaque,
        }
    }

    /// The external program and argument vector for this worker.
    #[must_use]
    pub fn command(&self) -> (String, Vec<String>) {
        let device = self.device.display().to_string();
        match self.kind {
            WorkerKind::SurfaceRead => {
                let mut args = vec![
                    format!("if={device}"),
                    "of=/dev/null".to_string(),
                    format!("bs={DD_BLOCK_SIZE}"),
                    "status=progress".to_string(),
                ];
                if self.direct_io {
                    args.push("iflag=direct".to_string());
                }
                ("dd".to_string(), args)
            }
            WorkerKind::ZeroWrite => {
                let mut args = vec![
                    "if=/dev/zero".to_string(),
                    format!("of={device}"),
                    format!("bs={DD_BLOCK_SIZE}"),
                    "status=progress".to_string(),
                    "conv=fsync".to_string(),
                ];
                if self.direct_io {
                    args.push("oflag=direct".to_string());
                }
                ("dd".to_string(), args)
            }
            WorkerKind::PatternWrite => {
                let pattern = u32::from(self.pattern.unwrap_or(0));
                (
                    "badblocks".to_string(),
                    vec![
                        "-w".to_string(),
                        "-s".to_string(),
                        "-t".to_string(),
                        pattern.to_string(),
                        "-b".to_string(),
                        self.block_size.to_string(),
                        device,
                    ],
                )
            }
            WorkerKind::HealthProbe => {
                let mut args = vec!["-a".to_string()];
                if let Some(smart_type) = &self.smart_type {
                    args.push("-d".to_string());
                    args.push(smart_type.clone());
                }
                args.push(device);
                ("smartctl".to_string(), args)
            }
        }
    }
}

// =============================================================================
// Signals and exits
// =============================================================================

/// Control signals the supervisor sends a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSignal {
    /// Suspend the worker (SIGSTOP).
    Pause,
    /// Continue a suspended worker (SIGCONT).
    Resume,
    /// Request a graceful exit (SIGTERM).
    Interrupt,
    /// Force termination (SIGKILL).
    Kill,
}

impl WorkerSignal {
    #[must_use]
    pub fn as_posix(self) -> Signal {
        match self {
            Self::Pause => Signal::SIGSTOP,
            Self::Resume => Signal::SIGCONT,
            Self::Interrupt => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

/// Classified worker exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    Success,
    /// Non-zero exit code, or `128 + signal` for signal deaths.
    Failed(i32),
}

impl WorkerExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if status.success() {
            Self::Success
        } else if let Some(code) = status.code() {
            Self::Failed(code)
        } else {
            Self::Failed(128 + status.signal().unwrap_or(0))
        }
    }
}

// =============================================================================
// Handle and launcher traits
// =============================================================================

/// A live worker under supervision.
///
/// All methods are non-blocking; the supervisor owns the pacing.
pub trait WorkerHandle: Send {
    /// The latest accepted progress observation.
    fn latest_progress(&self) -> ProgressSample;

    /// Deliver a control signal.
    fn signal(&mut self, signal: WorkerSignal) -> Result<(), SupervisorError>;

    /// Collect the exit status if the worker has exited.
    fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError>;

    /// OS pid, if the worker is process-backed and still attached.
    fn pid(&self) -> Option<u32>;
}

/// Factory for live workers. The pipeline is generic over this so tests can
/// substitute scripted in-process workers.
pub trait WorkerLauncher: Send + Sync {
    type Handle: WorkerHandle;

    fn launch(&self, spec: &WorkerSpec) -> Result<Self::Handle, SupervisorError>;
}

// =============================================================================
// Process-backed implementation
// =============================================================================

/// Spawns real external workers as child processes.
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    type Handle = ProcessWorker;

    fn launch(&self, spec: &WorkerSpec) -> Result<ProcessWorker, SupervisorError> {
        ProcessWorker::spawn(spec)
    }
}

/// A spawned external worker with a dedicated diagnostic-stream consumer.
///
/// The consumer task parses the worker's stderr incrementally and publishes
/// the latest sample through a watch channel, so reading progress never
/// blocks the supervisor tick.
pub struct ProcessWorker {
    child: Child,
    pid: Option<u32>,
    progress_rx: watch::Receiver<ProgressSample>,
    exit: Option<WorkerExit>,
}

impl ProcessWorker {
    fn spawn(spec: &WorkerSpec) -> Result<Self, SupervisorError> {
        let (program, args) = spec.command();
        debug!(worker = %spec.kind, %program, ?args, "spawning worker");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                tool: program,
                source,
            })?;

        let pid = child.id();
        let (progress_tx, progress_rx) = watch::channel(ProgressSample::initial());

        if let Some(stderr) = child.stderr.take() {
            let mut parser = ProgressParser::new(spec.discipline());
            tokio::spawn(async move {
                let mut stderr = stderr;
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]);
                            if parser.feed(&chunk) {
                                let _ = progress_tx.send(parser.latest().clone());
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            child,
            pid,
            progress_rx,
            exit: None,
        })
    }
}

impl WorkerHandle for ProcessWorker {
    fn latest_progress(&self) -> ProgressSample {
        self.progress_rx.borrow().clone()
    }

    fn signal(&mut self, signal: WorkerSignal) -> Result<(), SupervisorError> {
        let pid = self.pid.ok_or(SupervisorError::NoPid)?;
        kill(Pid::from_raw(pid as i32), signal.as_posix())
            .map_err(|errno| SupervisorError::Signal { pid, errno })
    }

    fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match self.child.try_wait().map_err(SupervisorError::Wait)? {
            Some(status) => {
                let exit = WorkerExit::from_status(status);
                self.exit = Some(exit);
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    fn pid(&self) -> Option<u32> {
        if self.exit.is_some() { None } else { self.pid }
    }
}
