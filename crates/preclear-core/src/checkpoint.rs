//! Step-boundary checkpoints that survive process death.
//!
//! One `key=value` file per device serial, written atomically at each step
//! entry and on thermal abort, deleted after the last cycle completes. The
//! reader is deliberately strict: the file must be a regular file owned by
//! the invoking user with no group or world write bit, every numeric field
//! must be plain digits, and the step must be in range. Anything else is
//! treated as "no checkpoint" and the run starts from step 1. File contents
//! are never evaluated, only parsed literally.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::CheckpointError;
use crate::pipeline::StepId;

/// The persisted step-boundary record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub step: StepId,
    pub cycle: u32,
    pub paused_seconds_total: u64,
    pub above_pause_seconds_total: u64,
    pub temp_min: Option<i32>,
    pub temp_max: Option<i32>,
}

/// Reads and writes the checkpoint file for one device.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Checkpoint path for a device serial: `<state_dir>/<serial>.ng.state`.
    #[must_use]
    pub fn for_serial(state_dir: &Path, serial: &str) -> Self {
        Self {
            path: state_dir.join(format!("{serial}.ng.state")),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the checkpoint file (0600, temp-then-rename).
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut content = String::new();
        content.push_str(&format!("step={}\n", checkpoint.step.number()));
        content.push_str(&format!("cycle={}\n", checkpoint.cycle));
        content.push_str(&format!(
            "paused_seconds_total={}\n",
            checkpoint.paused_seconds_total
        ));
        content.push_str(&format!(
            "above_pause_seconds_total={}\n",
            checkpoint.above_pause_seconds_total
        ));
        if let Some(temp_min) = checkpoint.temp_min.filter(|t| *t >= 0) {
            content.push_str(&format!("temp_min={temp_min}\n"));
        }
        if let Some(temp_max) = checkpoint.temp_max.filter(|t| *t >= 0) {
            content.push_str(&format!("temp_max={temp_max}\n"));
        }

        let tmp_path = self.path.with_extension("state.tmp");
        let write = || -> std::io::Result<()> {
            fs::write(&tmp_path, &content)?;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), step = checkpoint.step.number(), cycle = checkpoint.cycle, "checkpoint written");
        Ok(())
    }

    /// Load the checkpoint if — and only if — it passes every safety and
    /// format check. Any deviation yields `None`.
    #[must_use]
    pub fn load(&self) -> Option<Checkpoint> {
        let metadata = match fs::symlink_metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(_) => return None,
        };
        if !metadata.is_file() {
            warn!(path = %self.path.display(), "checkpoint is not a regular file, ignoring");
            return None;
        }
        if metadata.uid() != nix::unistd::geteuid().as_raw() {
            warn!(path = %self.path.display(), "checkpoint not owned by invoker, ignoring");
            return None;
        }
        if metadata.permissions().mode() & 0o022 != 0 {
            warn!(path = %self.path.display(), "checkpoint is group- or world-writable, ignoring");
            return None;
        }

        let content = fs::read_to_string(&self.path).ok()?;
        parse_checkpoint(&content)
    }

    /// Remove the checkpoint. Missing files are not an error.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Literal `key=value` parser. Unknown keys are ignored; malformed known
/// fields reject the whole file.
fn parse_checkpoint(content: &str) -> Option<Checkpoint> {
    let mut step = None;
    let mut cycle = None;
    let mut paused_seconds_total = None;
    let mut above_pause_seconds_total = None;
    let mut temp_min = None;
    let mut temp_max = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(line, "malformed checkpoint line, ignoring file");
            return None;
        };
        match key {
            "step" => {
                let number = parse_digits(value)?;
                step = Some(StepId::from_number(u8::try_from(number).ok()?)?);
            }
            "cycle" => cycle = Some(u32::try_from(parse_digits(value)?).ok()?),
            "paused_seconds_total" => paused_seconds_total = Some(parse_digits(value)?),
            "above_pause_seconds_total" => above_pause_seconds_total = Some(parse_digits(value)?),
            "temp_min" => temp_min = Some(i32::try_from(parse_digits(value)?).ok()?),
            "temp_max" => temp_max = Some(i32::try_from(parse_digits(value)?).ok()?),
            _ => {}
        }
    }

    Some(Checkpoint {
        step: step?,
        cycle: cycle.filter(|c| *c >= 1)?,
        paused_seconds_total: paused_seconds_total?,
        above_pause_seconds_total: above_pause_seconds_total?,
        temp_min,
        temp_max,
    })
}

/// Accept a numeric field only if it is entirely ASCII digits.
fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
