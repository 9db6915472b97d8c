//! Immutable run configuration.
//!
//! The CLI layer parses flags once, builds a [`RunConfig`], and validates it
//! before any device action. Nothing mutates the configuration after startup;
//! the pipeline, supervisor, and sampler all borrow it read-only.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Supervisor tick interval (seconds). Overridable via `--temp-interval`.
pub const REFRESH_S: u64 = 5;

/// Minimum interval between SMART captures (seconds).
pub const SMART_REFRESH_S: u64 = 300;

/// Stall age at which the supervisor logs a warning (seconds).
pub const HANG_WARN_S: u64 = 600;

/// Stall age at which the supervisor kills the worker (seconds).
pub const HANG_KILL_S: u64 = 1200;

/// Graceful-interrupt budget before a worker is force-killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on a single SMART capture call.
pub const SMART_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default destructive pattern sequence, written in list order.
pub const DEFAULT_PATTERNS: [u8; 4] = [0xAA, 0x55, 0xFF, 0x00];

/// Block size used for surface reads and zero fills.
pub const DD_BLOCK_SIZE: &str = "2M";

/// Default directory for checkpoints and SMART snapshot files.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/preclear-ng";

/// Default directory for run certificates.
pub const DEFAULT_REPORTS_DIR: &str = "/var/log/preclear-ng";

/// Complete, validated configuration for one pre-clear run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Whole block device under test.
    pub device: PathBuf,
    /// Number of full pipeline cycles to run.
    pub cycles: u32,
    /// Resume from a checkpoint if one validates.
    pub resume: bool,

    /// Skip step 1 (pre-read surface scan).
    pub skip_preread: bool,
    /// Skip step 2 (destructive pattern passes).
    pub skip_destructive: bool,
    /// Skip step 4 (zero fill).
    pub skip_zero: bool,
    /// Skip step 5 (verify read).
    pub skip_postread: bool,

    /// Destructive pattern bytes, executed in list order.
    pub patterns: Vec<u8>,
    /// Pattern-write block size override (bytes). `None` means the device's
    /// logical sector size.
    pub block_size: Option<u64>,

    /// SMART transport hint passed to the health tool (`-d <type>`).
    pub smart_type: Option<String>,
    /// Schedule the device's long self-test at step 3.
    pub smart_long: bool,

    /// Disable the thermal governor entirely.
    pub temp_disable: bool,
    /// Pause threshold override (°C).
    pub temp_pause: Option<i32>,
    /// Resume threshold override (°C).
    pub temp_resume: Option<i32>,
    /// Abort threshold override (°C).
    pub temp_abort: Option<i32>,
    /// Governor tick granularity (seconds).
    pub temp_interval_s: u64,
    /// Sustained-heat fail budget (minutes). 0 disables the check.
    pub temp_fail_min: u64,

    /// Directory holding checkpoints and SMART snapshot files.
    pub state_dir: PathBuf,
    /// Directory receiving run certificates.
    pub reports_dir: PathBuf,

    /// Minimum interval between SMART captures (seconds).
    pub smart_refresh_s: u64,
    /// Stall warning threshold (seconds).
    pub hang_warn_s: u64,
    /// Stall kill threshold (seconds).
    pub hang_kill_s: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::new(),
            cycles: 1,
            resume: false,
            skip_preread: false,
            skip_destructive: false,
            skip_zero: false,
            skip_postread: false,
            patterns: DEFAULT_PATTERNS.to_vec(),
            block_size: None,
            smart_type: None,
            smart_long: false,
            temp_disable: false,
            temp_pause: None,
            temp_resume: None,
            temp_abort: None,
            temp_interval_s: REFRESH_S,
            temp_fail_min: 0,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            reports_dir: PathBuf::from(DEFAULT_REPORTS_DIR),
            smart_refresh_s: SMART_REFRESH_S,
            hang_warn_s: HANG_WARN_S,
            hang_kill_s: HANG_KILL_S,
        }
    }
}

impl RunConfig {
    /// Validate everything that can be checked without touching the device.
    ///
    /// Threshold *ordering* is only checked here when all three overrides are
    /// present; partial overrides are merged with media-class defaults and
    /// re-validated by the pipeline once the device is probed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycles < 1 {
            return Err(ConfigError::InvalidCycles);
        }
        if self.patterns.is_empty() {
            return Err(ConfigError::EmptyPatternList);
        }
        if self.temp_interval_s < 1 {
            return Err(ConfigError::InvalidInterval);
        }
        if let (Some(pause_c), Some(resume_c), Some(abort_c)) =
            (self.temp_pause, self.temp_resume, self.temp_abort)
        {
            if !(resume_c < pause_c && pause_c < abort_c) {
                return Err(ConfigError::ThresholdOrdering {
                    pause_c,
                    resume_c,
                    abort_c,
                });
            }
        }
        Ok(())
    }

    /// Supervisor tick interval as a [`Duration`].
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.temp_interval_s)
    }
}

/// Parse a comma-separated destructive pattern list.
///
/// Accepts hex bytes (`0xAA`) and decimal bytes (`170`), in any mix.
pub fn parse_pattern_list(csv: &str) -> Result<Vec<u8>, ConfigError> {
    let mut patterns = Vec::new();
    for entry in csv.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parsed = if let Some(hex) = entry.strip_prefix("0x").or_else(|| entry.strip_prefix("0X"))
        {
            u8::from_str_radix(hex, 16)
        } else {
            entry.parse::<u8>()
        };
        match parsed {
            Ok(byte) => patterns.push(byte),
            Err(_) => return Err(ConfigError::InvalidPattern(entry.to_string())),
        }
    }
    if patterns.is_empty() {
        return Err(ConfigError::EmptyPatternList);
    }
    Ok(patterns)
}
