//! Worker supervision: the per-step control loop.
//!
//! Runs one worker to completion, one tick at a time. Each tick reads the
//! latest progress sample, consults the thermal governor, dispatches its
//! directive (pause, resume, or abort), advances the stall ladder, and
//! classifies the worker's exit when it appears.
//!
//! # Termination discipline
//!
//! Every exit path goes through the same sequence: resume a paused worker so
//! it can observe the interrupt, send the interrupt, wait up to the graceful
//! budget, then force-kill. The worker handle is held by a [`WorkerLease`]
//! whose drop backstop repeats that sequence, so a panic between ticks
//! cannot leave a stopped child behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::device::format_size;
use crate::error::SupervisorError;
use crate::progress::percent;
use crate::thermal::{Directive, Governor};
use crate::worker::{WorkerHandle, WorkerSignal};

// =============================================================================
// Outcome
// =============================================================================

/// Which thermal rule forced an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalAbortKind {
    OverTemp,
    Sustained,
}

impl std::fmt::Display for ThermalAbortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OverTemp => write!(f, "over-temperature"),
            Self::Sustained => write!(f, "sustained heat"),
        }
    }
}

/// Classification of one supervised step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The worker exited zero.
    Completed,
    /// The governor aborted the step.
    AbortedThermal(ThermalAbortKind),
    /// No byte progress within the stall-kill window.
    AbortedStall,
    /// The worker exited non-zero.
    WorkerFailed(i32),
    /// An external interrupt cancelled the run.
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::AbortedThermal(kind) => write!(f, "aborted ({kind})"),
            Self::AbortedStall => write!(f, "aborted (stalled)"),
            Self::WorkerFailed(code) => write!(f, "worker failed (exit {code})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Timing knobs for the supervision loop.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between ticks.
    pub tick: Duration,
    /// Stall age that logs a warning.
    pub hang_warn: Duration,
    /// Stall age that kills the worker.
    pub hang_kill: Duration,
    /// Graceful-interrupt budget before force-kill.
    pub terminate_grace: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub fn from_run_config(config: &RunConfig) -> Self {
        Self {
            tick: config.tick(),
            hang_warn: Duration::from_secs(config.hang_warn_s),
            hang_kill: Duration::from_secs(config.hang_kill_s),
            terminate_grace: crate::config::TERMINATE_GRACE,
        }
    }
}

// =============================================================================
// Temperature source
// =============================================================================

/// Per-tick temperature source consulted by the supervision loop.
///
/// The health sampler implements this by refreshing its snapshot when stale;
/// tests script readings directly. Boxed-future method in the style of the
/// polling predicates used elsewhere in the workspace.
pub trait Thermometer: Send {
    fn poll(&mut self) -> Pin<Box<dyn Future<Output = Option<i32>> + Send + '_>>;
}

/// A thermometer that always reads "unknown", for governor-less runs.
pub struct NoThermometer;

impl Thermometer for NoThermometer {
    fn poll(&mut self) -> Pin<Box<dyn Future<Output = Option<i32>> + Send + '_>> {
        Box::pin(std::future::ready(None))
    }
}

// =============================================================================
// Worker lease
// =============================================================================

/// Scoped ownership of a live worker with a guaranteed release sequence.
///
/// The release invariant: a paused worker is resumed before any interrupt is
/// delivered, on every path out of the supervisor including panic.
struct WorkerLease<H: WorkerHandle> {
    handle: H,
    paused: bool,
    done: bool,
    grace: Duration,
}

impl<H: WorkerHandle> WorkerLease<H> {
    fn new(handle: H, grace: Duration) -> Self {
        Self {
            handle,
            paused: false,
            done: false,
            grace,
        }
    }

    fn paused(&self) -> bool {
        self.paused
    }

    fn pause(&mut self) -> Result<(), SupervisorError> {
        self.handle.signal(WorkerSignal::Pause)?;
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), SupervisorError> {
        self.handle.signal(WorkerSignal::Resume)?;
        self.paused = false;
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<crate::worker::WorkerExit>, SupervisorError> {
        let exit = self.handle.try_wait()?;
        if exit.is_some() {
            self.done = true;
        }
        Ok(exit)
    }

    /// Graceful-then-forceful termination: resume if paused, interrupt, wait
    /// up to the grace budget, then kill and reap.
    async fn terminate(&mut self) {
        if self.done {
            return;
        }
        if self.paused {
            let _ = self.resume();
        }
        let _ = self.handle.signal(WorkerSignal::Interrupt);

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if matches!(self.try_wait(), Ok(Some(_))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = self.handle.signal(WorkerSignal::Kill);
        let reap_deadline = Instant::now() + self.grace;
        while Instant::now() < reap_deadline {
            if matches!(self.try_wait(), Ok(Some(_))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Exit never observed; mark done so the drop backstop does not
        // signal a pid that may be reused.
        self.done = true;
    }
}

impl<H: WorkerHandle> Drop for WorkerLease<H> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.paused {
            let _ = self.handle.signal(WorkerSignal::Resume);
        }
        let _ = self.handle.signal(WorkerSignal::Interrupt);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            match self.handle.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        let _ = self.handle.signal(WorkerSignal::Kill);
        let _ = self.handle.try_wait();
    }
}

// =============================================================================
// Supervision loop
// =============================================================================

/// Supervise one worker until it completes, fails, stalls, or is aborted.
///
/// Single-threaded and cooperative: the only suspension points are the tick
/// sleep and the bounded waits inside termination. A directive observed at
/// tick T takes effect before any byte accounting at tick T+1.
pub async fn supervise<H: WorkerHandle>(
    handle: H,
    label: &str,
    expected_bytes: u64,
    governor: &mut Governor,
    thermometer: &mut dyn Thermometer,
    shutdown: &Arc<AtomicBool>,
    config: &SupervisorConfig,
) -> Result<Outcome, SupervisorError> {
    let mut lease = WorkerLease::new(handle, config.terminate_grace);
    let started = Instant::now();
    let mut last_tick = started;
    let mut last_bytes = 0u64;
    let mut stall_age = Duration::ZERO;
    let mut stall_warned = false;

    loop {
        tokio::time::sleep(config.tick).await;
        let now = Instant::now();
        let dt = now - last_tick;
        last_tick = now;

        if shutdown.load(Ordering::Relaxed) {
            info!(step = label, "interrupt received, terminating worker");
            lease.terminate().await;
            return Ok(Outcome::Cancelled);
        }

        let sample = lease.handle.latest_progress();
        let pct = percent(sample.bytes_done, expected_bytes);
        let elapsed = now - started;
        let avg_rate = if elapsed.as_secs() > 0 {
            format!(
                "{}/s",
                format_size(sample.bytes_done / elapsed.as_secs().max(1))
            )
        } else {
            "-".to_string()
        };

        let temp_c = thermometer.poll().await;
        debug!(
            step = label,
            bytes_done = sample.bytes_done,
            percent = format!("{pct:.1}"),
            avg_rate = %avg_rate,
            temp_c = ?temp_c,
            paused = lease.paused(),
            "tick"
        );

        match governor.tick(temp_c, dt, lease.paused()) {
            Directive::Continue => {}
            Directive::Pause => {
                warn!(step = label, temp_c = ?temp_c, "temperature at pause threshold, stopping worker");
                lease.pause()?;
            }
            Directive::Resume => {
                info!(step = label, temp_c = ?temp_c, "temperature recovered, continuing worker");
                lease.resume()?;
            }
            Directive::AbortOverTemp => {
                warn!(step = label, temp_c = ?temp_c, "temperature at abort threshold, terminating");
                lease.terminate().await;
                return Ok(Outcome::AbortedThermal(ThermalAbortKind::OverTemp));
            }
            Directive::AbortSustained => {
                warn!(step = label, "sustained-heat budget exhausted, terminating");
                lease.terminate().await;
                return Ok(Outcome::AbortedThermal(ThermalAbortKind::Sustained));
            }
        }

        // Stall ladder. Paused time does not age the stall clock.
        if !lease.paused() {
            if sample.bytes_done == last_bytes {
                stall_age += dt;
                if stall_age >= config.hang_kill {
                    warn!(
                        step = label,
                        stalled_secs = stall_age.as_secs(),
                        "no progress within kill window, terminating worker"
                    );
                    lease.terminate().await;
                    return Ok(Outcome::AbortedStall);
                }
                if stall_age >= config.hang_warn && !stall_warned {
                    warn!(
                        step = label,
                        stalled_secs = stall_age.as_secs(),
                        "worker has made no progress"
                    );
                    stall_warned = true;
                }
            } else {
                last_bytes = sample.bytes_done;
                stall_age = Duration::ZERO;
                stall_warned = false;
            }
        }

        if let Some(exit) = lease.try_wait()? {
            return Ok(match exit {
                crate::worker::WorkerExit::Success => {
                    info!(
                        step = label,
                        bytes_done = sample.bytes_done,
                        elapsed_secs = elapsed.as_secs(),
                        "worker completed"
                    );
                    Outcome::Completed
                }
                crate::worker::WorkerExit::Failed(code) => {
                    warn!(step = label, exit_code = code, "worker failed");
                    Outcome::WorkerFailed(code)
                }
            });
        }
    }
}
