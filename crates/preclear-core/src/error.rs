//! Error types for preclear-core

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for preclear-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Device probe errors
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Checkpoint store errors
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Worker supervision errors
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Certificate emission errors
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation errors.
///
/// Reported before any device action is taken.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cycle count must be at least 1")]
    InvalidCycles,

    #[error(
        "thermal thresholds must satisfy resume < pause < abort \
         (got resume={resume_c}, pause={pause_c}, abort={abort_c})"
    )]
    ThresholdOrdering {
        pause_c: i32,
        resume_c: i32,
        abort_c: i32,
    },

    #[error("destructive pattern list is empty")]
    EmptyPatternList,

    #[error("invalid destructive pattern {0:?}: expected a byte value like 0xAA or 170")]
    InvalidPattern(String),

    #[error("governor tick interval must be at least 1 second")]
    InvalidInterval,

    #[error(
        "--cycles {cycles} is below the checkpoint's cycle {checkpoint_cycle}; \
         rerun with at least --cycles {checkpoint_cycle}, or without --resume to start over"
    )]
    CyclesBelowCheckpoint { checkpoint_cycle: u32, cycles: u32 },

    #[error("invalid {field}: {value:?} is not a number")]
    NotNumeric { field: &'static str, value: String },
}

/// Device probe errors: the device is unusable for a pre-clear run.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("{0} is not a whole block device")]
    NotBlockDevice(PathBuf),

    #[error("cannot determine size of {0}")]
    UnknownSize(PathBuf),

    #[error("{0} reports a size of 0 bytes")]
    ZeroSize(PathBuf),

    #[error("{device} (or a partition of it) is mounted at {mount_point}")]
    Mounted {
        device: PathBuf,
        mount_point: String,
    },

    #[error("{0} is in use as swap")]
    ActiveSwap(PathBuf),

    #[error("{0} backs the running root filesystem")]
    RootBacking(PathBuf),

    #[error("failed to read {path}: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Checkpoint write-side errors.
///
/// The read side never errors: anything short of a valid, owner-only,
/// well-formed file is treated as "no checkpoint".
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove checkpoint {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Worker supervision errors (spawn/signal plumbing, not worker outcomes).
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal worker pid {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },

    #[error("failed to collect worker exit status: {0}")]
    Wait(#[source] std::io::Error),

    #[error("worker has no pid (already reaped)")]
    NoPid,
}

/// Certificate emission errors.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("failed to create reports directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write certificate {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_ordering_message_names_all_three() {
        let err = ConfigError::ThresholdOrdering {
            pause_c: 50,
            resume_c: 55,
            abort_c: 60,
        };
        let text = err.to_string();
        assert!(text.contains("resume=55"));
        assert!(text.contains("pause=50"));
        assert!(text.contains("abort=60"));
    }

    #[test]
    fn probe_errors_name_the_device() {
        let err = ProbeError::NotBlockDevice(PathBuf::from("/dev/null"));
        assert!(err.to_string().contains("/dev/null"));
    }

    #[test]
    fn top_level_error_wraps_config() {
        let err: Error = ConfigError::InvalidCycles.into();
        assert!(matches!(err, Error::Config(_)));
    }
}
