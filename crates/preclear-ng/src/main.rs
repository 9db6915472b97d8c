//! preclear-ng: supervised destructive pre-clear for whole block devices.
//!
//! Parses the flag surface into an immutable run configuration, refuses
//! unusable devices, asks for explicit confirmation, then hands control to
//! the pipeline executor. Exit codes: 0 success, 75 thermal abort, any
//! other non-zero is a failure with the certificate naming the step.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::warn;

use preclear_core::config::{DEFAULT_REPORTS_DIR, DEFAULT_STATE_DIR, REFRESH_S, RunConfig, parse_pattern_list};
use preclear_core::device::{self, format_size};
use preclear_core::logging::{LogConfig, LogFormat, init_logging};
use preclear_core::pipeline::{Pipeline, RunOutcome, RunReport};
use preclear_core::worker::ProcessLauncher;

#[derive(Parser, Debug)]
#[command(
    name = "preclear-ng",
    version,
    about = "Destructively condition and certify a whole block device",
    after_help = "Runs pre-read, destructive pattern, zero-fill, and verify passes against the\n\
                  device while supervising SMART health and temperature. ALL DATA ON THE\n\
                  DEVICE IS DESTROYED."
)]
struct Cli {
    /// Whole block device to pre-clear (e.g. /dev/sdb).
    #[arg(value_name = "DEVICE", required_unless_present = "list")]
    device: Option<PathBuf>,

    /// Number of full pipeline cycles to run.
    #[arg(long, value_name = "N", default_value_t = 1)]
    cycles: u32,

    /// Resume from a checkpoint if a valid one exists.
    #[arg(long)]
    resume: bool,

    /// Skip the interactive YES confirmation.
    #[arg(long)]
    no_prompt: bool,

    /// Skip step 1 (pre-read surface scan).
    #[arg(long)]
    skip_preread: bool,

    /// Skip step 2 (destructive pattern passes).
    #[arg(long)]
    skip_badblocks: bool,

    /// Skip step 4 (zero fill).
    #[arg(long)]
    skip_zero: bool,

    /// Skip step 5 (verify read).
    #[arg(long)]
    skip_postread: bool,

    /// Override the destructive pattern list (e.g. 0xAA,0x55,0xFF,0x00).
    #[arg(long, value_name = "CSV")]
    badblocks_patterns: Option<String>,

    /// Override the pattern-write block size in bytes (at least the logical
    /// sector size).
    #[arg(long, value_name = "BYTES")]
    badblocks_blocksize: Option<u64>,

    /// SMART transport hint passed to the health tool (-d <type>).
    #[arg(long, value_name = "TYPE")]
    smart_type: Option<String>,

    /// Schedule the device's long self-test at step 3.
    #[arg(long)]
    smart_long: bool,

    /// Disable the thermal governor.
    #[arg(long)]
    temp_disable: bool,

    /// Pause threshold override (°C). Requires resume < pause < abort.
    #[arg(long, value_name = "C")]
    temp_pause: Option<i32>,

    /// Resume threshold override (°C).
    #[arg(long, value_name = "C")]
    temp_resume: Option<i32>,

    /// Abort threshold override (°C).
    #[arg(long, value_name = "C")]
    temp_abort: Option<i32>,

    /// Governor tick granularity in seconds.
    #[arg(long, value_name = "S", default_value_t = REFRESH_S)]
    temp_interval: u64,

    /// Sustained-heat fail budget in minutes; 0 disables the check.
    #[arg(long, value_name = "M", default_value_t = 0)]
    temp_fail_min: u64,

    /// Print candidate disks and exit.
    #[arg(long)]
    list: bool,

    /// Directory for checkpoints and SMART snapshots.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Directory for run certificates.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_REPORTS_DIR)]
    reports_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("preclear-ng: {e:#}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<i32> {
    init_logging(&LogConfig {
        level: cli.log_level.clone(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    if cli.list {
        print_candidates()?;
        return Ok(0);
    }

    let config = build_config(&cli)?;
    config.validate()?;

    if !nix::unistd::geteuid().is_root() {
        bail!("pre-clearing a device requires root privileges");
    }

    let descriptor = device::identify(&config.device)?;

    println!(
        "device: {} — {} {} ({}, {}, {} B sectors)",
        descriptor.path.display(),
        descriptor.model,
        descriptor.serial,
        format_size(descriptor.size_bytes),
        descriptor.media_class(),
        descriptor.logical_sector,
    );

    if !cli.no_prompt && !confirm(&descriptor)? {
        bail!("confirmation not given, nothing was written");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, terminating current worker");
            shutdown_flag.store(true, Ordering::Relaxed);
        }
    });

    let mut pipeline = Pipeline::new(config, descriptor, ProcessLauncher, shutdown)?;
    let report = pipeline.run().await?;
    announce(&report);
    Ok(report.outcome.exit_code())
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let patterns = match &cli.badblocks_patterns {
        Some(csv) => parse_pattern_list(csv)?,
        None => preclear_core::config::DEFAULT_PATTERNS.to_vec(),
    };
    Ok(RunConfig {
        device: cli
            .device
            .clone()
            .context("a device path is required (or use --list)")?,
        cycles: cli.cycles,
        resume: cli.resume,
        skip_preread: cli.skip_preread,
        skip_destructive: cli.skip_badblocks,
        skip_zero: cli.skip_zero,
        skip_postread: cli.skip_postread,
        patterns,
        block_size: cli.badblocks_blocksize,
        smart_type: cli.smart_type.clone(),
        smart_long: cli.smart_long,
        temp_disable: cli.temp_disable,
        temp_pause: cli.temp_pause,
        temp_resume: cli.temp_resume,
        temp_abort: cli.temp_abort,
        temp_interval_s: cli.temp_interval,
        temp_fail_min: cli.temp_fail_min,
        state_dir: cli.state_dir.clone(),
        reports_dir: cli.reports_dir.clone(),
        ..RunConfig::default()
    })
}

/// Require the operator to type exactly `YES` before anything destructive.
fn confirm(descriptor: &device::DeviceDescriptor) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        bail!("refusing to run without a terminal; pass --no-prompt to confirm non-interactively");
    }
    print!(
        "ALL DATA on {} ({} {}) will be DESTROYED. Type YES to proceed: ",
        descriptor.path.display(),
        descriptor.model,
        descriptor.serial,
    );
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim_end_matches(['\r', '\n']) == "YES")
}

fn print_candidates() -> Result<()> {
    let disks = device::list_candidates().context("failed to scan /sys/block")?;
    if disks.is_empty() {
        println!("no candidate disks found");
        return Ok(());
    }
    println!(
        "{:<12} {:<28} {:<24} {:>10}  {}",
        "NAME", "MODEL", "SERIAL", "SIZE", "MEDIA"
    );
    for disk in disks {
        println!(
            "{:<12} {:<28} {:<24} {:>10}  {}",
            disk.name,
            disk.model,
            disk.serial,
            format_size(disk.size_bytes),
            if disk.rotational { "rotational" } else { "solid-state" },
        );
    }
    Ok(())
}

/// One line on stderr for failures, naming the step and the certificate.
fn announce(report: &RunReport) {
    let certificate = report
        .certificate
        .as_ref()
        .map_or_else(|| "no certificate written".to_string(), |p| p.display().to_string());
    match &report.outcome {
        RunOutcome::Success { cycles } => {
            println!("pre-clear complete ({cycles} cycle(s)); certificate: {certificate}");
        }
        RunOutcome::ThermalAbort { step, kind } => {
            eprintln!("preclear-ng: thermal abort ({kind}) at {step}; certificate: {certificate}");
        }
        RunOutcome::StepFailed { step, outcome } => {
            eprintln!("preclear-ng: {outcome} at {step}; certificate: {certificate}");
        }
        RunOutcome::Cancelled { step } => {
            eprintln!("preclear-ng: cancelled during {step}; checkpoint preserved for --resume");
        }
    }
}
