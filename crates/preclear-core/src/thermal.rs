//! Thermal governor: per-tick pause/resume/abort decisions with hysteresis.
//!
//! The governor consumes one temperature reading per supervisor tick and
//! issues a single [`Directive`]. Pause and resume thresholds are strictly
//! separated (hysteresis) so a drive hovering at the pause point cannot
//! oscillate the worker. Counters live in a [`ThermalRecord`] that the
//! pipeline persists across steps and (via the checkpoint) across process
//! death.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// =============================================================================
// Thresholds
// =============================================================================

/// Temperature thresholds in °C plus the sustained-heat budget.
///
/// Invariant: `resume_c < pause_c < abort_c`, enforced by [`validate`].
///
/// [`validate`]: ThermalThresholds::validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermalThresholds {
    /// Pause the worker at or above this temperature.
    pub pause_c: i32,
    /// Resume a paused worker at or below this temperature.
    pub resume_c: i32,
    /// Abort the run at or above this temperature.
    pub abort_c: i32,
    /// Minutes of cumulative above-pause time before a sustained-heat abort.
    /// 0 disables the check.
    pub sustained_fail_minutes: u64,
}

impl ThermalThresholds {
    /// Defaults for the given media class.
    #[must_use]
    pub fn for_media(rotational: bool) -> Self {
        if rotational {
            Self {
                pause_c: 50,
                resume_c: 45,
                abort_c: 55,
                sustained_fail_minutes: 0,
            }
        } else {
            Self {
                pause_c: 60,
                resume_c: 55,
                abort_c: 70,
                sustained_fail_minutes: 0,
            }
        }
    }

    /// Apply per-flag overrides on top of these defaults.
    #[must_use]
    pub fn with_overrides(
        mut self,
        pause_c: Option<i32>,
        resume_c: Option<i32>,
        abort_c: Option<i32>,
        sustained_fail_minutes: Option<u64>,
    ) -> Self {
        if let Some(pause) = pause_c {
            self.pause_c = pause;
        }
        if let Some(resume) = resume_c {
            self.resume_c = resume;
        }
        if let Some(abort) = abort_c {
            self.abort_c = abort;
        }
        if let Some(minutes) = sustained_fail_minutes {
            self.sustained_fail_minutes = minutes;
        }
        self
    }

    /// Enforce the hysteresis ordering `resume < pause < abort`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resume_c < self.pause_c && self.pause_c < self.abort_c {
            Ok(())
        } else {
            Err(ConfigError::ThresholdOrdering {
                pause_c: self.pause_c,
                resume_c: self.resume_c,
                abort_c: self.abort_c,
            })
        }
    }
}

// =============================================================================
// Directive
// =============================================================================

/// The discrete command produced by one governor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// No thermal action required.
    Continue,
    /// Temperature reached the pause threshold; stop the worker.
    Pause,
    /// Temperature fell to the resume threshold; continue the worker.
    Resume,
    /// Temperature reached the abort threshold; terminate the run.
    AbortOverTemp,
    /// Cumulative above-pause time exhausted the fail budget.
    AbortSustained,
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::AbortOverTemp => write!(f, "abort_over_temp"),
            Self::AbortSustained => write!(f, "abort_sustained"),
        }
    }
}

// =============================================================================
// Thermal record
// =============================================================================

/// Observed thermal history for the run, reported in the certificate.
///
/// Step min/max reset at every step transition; run min/max never reset.
/// The above-pause time is kept as two counters: one per step and one
/// cumulative across the whole run (the cumulative one drives the
/// sustained-heat abort and is persisted in the checkpoint).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThermalRecord {
    /// Most recent reading, if any.
    pub current_c: Option<i32>,
    /// Minimum seen across the run.
    pub run_min_c: Option<i32>,
    /// Maximum seen across the run.
    pub run_max_c: Option<i32>,
    /// Minimum seen during the current step.
    pub step_min_c: Option<i32>,
    /// Maximum seen during the current step.
    pub step_max_c: Option<i32>,
    /// Total time the worker spent paused for heat.
    pub paused_total: Duration,
    /// Time at or above the pause threshold during the current step.
    pub above_pause_step: Duration,
    /// Time at or above the pause threshold across the whole run.
    pub above_pause_total: Duration,
}

impl ThermalRecord {
    fn observe(&mut self, temp_c: i32) {
        self.current_c = Some(temp_c);
        self.run_min_c = Some(self.run_min_c.map_or(temp_c, |m| m.min(temp_c)));
        self.run_max_c = Some(self.run_max_c.map_or(temp_c, |m| m.max(temp_c)));
        self.step_min_c = Some(self.step_min_c.map_or(temp_c, |m| m.min(temp_c)));
        self.step_max_c = Some(self.step_max_c.map_or(temp_c, |m| m.max(temp_c)));
    }
}

// =============================================================================
// Governor
// =============================================================================

/// Per-tick thermal decision engine.
#[derive(Debug, Clone)]
pub struct Governor {
    thresholds: ThermalThresholds,
    enabled: bool,
    record: ThermalRecord,
}

impl Governor {
    /// Build a governor over validated thresholds. A disabled governor still
    /// tracks the current temperature and min/max but never pauses, resumes,
    /// or aborts, and advances no counters.
    #[must_use]
    pub fn new(thresholds: ThermalThresholds, enabled: bool) -> Self {
        Self {
            thresholds,
            enabled,
            record: ThermalRecord::default(),
        }
    }

    /// The thresholds this governor enforces.
    #[must_use]
    pub fn thresholds(&self) -> &ThermalThresholds {
        &self.thresholds
    }

    /// The accumulated thermal record.
    #[must_use]
    pub fn record(&self) -> &ThermalRecord {
        &self.record
    }

    /// Seed counters and run min/max from a checkpoint on resume.
    pub fn seed(
        &mut self,
        paused_total: Duration,
        above_pause_total: Duration,
        run_min_c: Option<i32>,
        run_max_c: Option<i32>,
    ) {
        self.record.paused_total = paused_total;
        self.record.above_pause_total = above_pause_total;
        self.record.run_min_c = run_min_c;
        self.record.run_max_c = run_max_c;
    }

    /// Reset per-step state at a step (or pattern-pass) boundary.
    pub fn begin_step(&mut self) {
        self.record.step_min_c = None;
        self.record.step_max_c = None;
        self.record.above_pause_step = Duration::ZERO;
    }

    /// Evaluate one tick.
    ///
    /// `worker_paused` is the supervisor's view of the worker; the governor
    /// trusts it rather than tracking its own copy, so a missed signal cannot
    /// desynchronize the two.
    pub fn tick(&mut self, temp_c: Option<i32>, dt: Duration, worker_paused: bool) -> Directive {
        // Unknown temperature: no decision, no counter movement.
        let Some(temp_c) = temp_c else {
            return Directive::Continue;
        };

        self.record.observe(temp_c);

        if !self.enabled {
            return Directive::Continue;
        }

        if temp_c >= self.thresholds.abort_c {
            return Directive::AbortOverTemp;
        }

        if temp_c >= self.thresholds.pause_c {
            self.record.above_pause_step += dt;
            self.record.above_pause_total += dt;
            if !worker_paused {
                return Directive::Pause;
            }
        }

        if worker_paused && temp_c <= self.thresholds.resume_c {
            return Directive::Resume;
        }

        if worker_paused {
            self.record.paused_total += dt;
        }

        let budget = self.thresholds.sustained_fail_minutes;
        if budget > 0 && self.record.above_pause_total >= Duration::from_secs(budget * 60) {
            return Directive::AbortSustained;
        }

        Directive::Continue
    }
}
