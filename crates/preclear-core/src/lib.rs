//! preclear-core: supervised destructive pre-clear pipeline for whole block
//! devices.
//!
//! Runs a fixed sequence of full-surface read, write-pattern, and
//! verification passes against a single device, supervising drive health and
//! temperature throughout, and emits a certificate attesting that the device
//! was exercised end-to-end without fatal regression.
//!
//! # Architecture
//!
//! ```text
//! Device Probe ──► Pipeline Executor ──► Certificate
//!                     │        ▲
//!                     ▼        │ outcomes
//!                 Worker Supervisor ◄── Thermal Governor
//!                     │                      ▲
//!                     ▼                      │ temperature
//!                 external workers      Health Sampler
//!                 (dd / badblocks)       (smartctl)
//! ```
//!
//! The executor owns all mutable run state and is the sole writer of the
//! thermal counters, the checkpoint file, and the certificate. The
//! supervisor owns the live worker for exactly one step. The sampler owns
//! the snapshot files.
//!
//! # Modules
//!
//! - [`device`]: device identity, safety refusals, candidate listing
//! - [`smart`]: bounded SMART capture, attribute map, temperature
//! - [`thermal`]: thermal governor and thresholds
//! - [`progress`]: worker progress-stream parsing
//! - [`worker`]: worker kinds, command specs, process handles
//! - [`supervisor`]: the per-step supervision loop
//! - [`checkpoint`]: step-boundary persistence for resume
//! - [`pipeline`]: the (cycle, step) state machine
//! - [`certificate`]: end-of-run certificate rendering
//! - [`config`]: immutable run configuration
//! - [`logging`]: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod certificate;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod smart;
pub mod supervisor;
pub mod thermal;
pub mod worker;

pub use error::{Error, Result};
