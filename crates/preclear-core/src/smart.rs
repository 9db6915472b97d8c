//! Drive-health sampling via the external SMART tool.
//!
//! Captures are bounded in time and throttled by a minimum refresh interval:
//! health interrogation exercises the bus, and on some adapters a single
//! query takes seconds, so uncapped sampling would starve the supervision
//! loop. The sampler never raises — a failed or timed-out capture produces
//! an empty snapshot and downstream consumers see "unknown".

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::device::DeviceDescriptor;
use crate::supervisor::Thermometer;
use crate::worker::WorkerSpec;

/// Attributes reported in the certificate's delta block.
pub const TRACKED_ATTRIBUTES: &[&str] = &[
    "Reallocated_Sector_Ct",
    "Power_On_Hours",
    "Temperature_Celsius",
    "Reallocated_Event_Count",
    "Current_Pending_Sector",
    "Offline_Uncorrectable",
    "UDMA_CRC_Error_Count",
];

// =============================================================================
// Snapshot
// =============================================================================

/// One captured health report: the raw tool output plus parsed attributes.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// When the capture happened. `None` for the empty snapshot.
    pub captured_at: Option<DateTime<Local>>,
    /// Raw tool output, verbatim.
    pub raw: String,
    /// Parsed attribute map: name → raw value string.
    pub attributes: BTreeMap<String, String>,
}

impl Snapshot {
    /// The empty snapshot produced when a capture fails.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse raw tool output into a snapshot stamped with the current time.
    #[must_use]
    pub fn parse(raw: String) -> Self {
        let attributes = parse_attributes(&raw);
        Self {
            captured_at: Some(Local::now()),
            raw,
            attributes,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// Look up an attribute's raw value by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Extract the drive temperature in °C.
    ///
    /// Prefers the named temperature attributes, then the generic
    /// `Temperature:` field. Only integer values are accepted.
    #[must_use]
    pub fn temperature(&self) -> Option<i32> {
        self.attribute("Temperature_Celsius")
            .and_then(leading_int)
            .or_else(|| self.attribute("Airflow_Temperature_Cel").and_then(leading_int))
            .or_else(|| self.attribute("Temperature").and_then(leading_int))
            .or_else(|| {
                self.attribute("Current Drive Temperature")
                    .and_then(leading_int)
            })
    }
}

/// Extract attribute rows and `key: value` fields from raw tool output.
///
/// ATA attribute-table rows look like
/// `194 Temperature_Celsius 0x0022 036 053 000 Old_age Always - 36 (Min/Max 20/53)`
/// and contribute `name → raw columns`. Everything of the form
/// `Key Words: value` (NVMe health fields, identity lines) contributes
/// `key → value`.
fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    for line in raw.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 10
            && tokens[0].bytes().all(|b| b.is_ascii_digit())
            && tokens[2].starts_with("0x")
        {
            attributes.insert(tokens[1].to_string(), tokens[9..].join(" "));
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && key.len() <= 40 && !value.is_empty() {
                attributes.insert(key.to_string(), value.to_string());
            }
        }
    }
    attributes
}

/// First whitespace token parsed as a plain integer, or `None`.
fn leading_int(value: &str) -> Option<i32> {
    value.split_whitespace().next()?.parse().ok()
}

// =============================================================================
// Sampler
// =============================================================================

/// Captures and caches health snapshots for one device.
///
/// Keeps two canonical snapshots: *initial* (before any destructive step,
/// reloaded from disk on resume) and *latest* (refreshed at most once per
/// refresh interval, and always at finalize).
pub struct HealthSampler {
    probe: WorkerSpec,
    serial: String,
    state_dir: PathBuf,
    refresh_interval: Duration,
    capture_timeout: Duration,
    last_capture: Option<Instant>,
    initial: Option<Snapshot>,
    latest: Option<Snapshot>,
}

impl HealthSampler {
    #[must_use]
    pub fn new(descriptor: &DeviceDescriptor, config: &RunConfig) -> Self {
        Self {
            probe: WorkerSpec::health_probe(descriptor.path.clone(), config.smart_type.clone()),
            serial: descriptor.serial.clone(),
            state_dir: config.state_dir.clone(),
            refresh_interval: Duration::from_secs(config.smart_refresh_s),
            capture_timeout: crate::config::SMART_CAPTURE_TIMEOUT,
            last_capture: None,
            initial: None,
            latest: None,
        }
    }

    /// Path of the persisted initial snapshot.
    #[must_use]
    pub fn initial_path(&self) -> PathBuf {
        self.state_dir.join(format!("smart_{}_initial.txt", self.serial))
    }

    /// Path of the persisted latest snapshot.
    #[must_use]
    pub fn latest_path(&self) -> PathBuf {
        self.state_dir.join(format!("smart_{}_last.txt", self.serial))
    }

    #[must_use]
    pub fn initial(&self) -> Option<&Snapshot> {
        self.initial.as_ref()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Temperature from the latest snapshot, if known.
    #[must_use]
    pub fn temperature(&self) -> Option<i32> {
        self.latest.as_ref().and_then(Snapshot::temperature)
    }

    /// Capture a snapshot now, regardless of staleness.
    ///
    /// Never raises: spawn failures, non-UTF-8 output, and the 30 s timeout
    /// all produce an empty snapshot.
    pub async fn capture(&mut self) {
        let snapshot = self.run_probe().await;
        self.last_capture = Some(Instant::now());
        if snapshot.is_empty() {
            warn!(device = %self.probe.device.display(), "health capture produced no data");
        } else {
            debug!(
                device = %self.probe.device.display(),
                temp_c = ?snapshot.temperature(),
                attributes = snapshot.attributes.len(),
                "health snapshot captured"
            );
            self.persist(&self.latest_path(), &snapshot.raw);
        }
        self.latest = Some(snapshot);
    }

    /// Capture only if the last capture is at least the refresh interval old.
    pub async fn refresh_if_stale(&mut self) {
        let stale = match self.last_capture {
            None => true,
            Some(at) => at.elapsed() >= self.refresh_interval,
        };
        if stale {
            self.capture().await;
        }
    }

    /// Establish the initial snapshot: reload a persisted one when resuming,
    /// otherwise capture fresh and persist it.
    pub async fn ensure_initial(&mut self) {
        if self.initial.is_some() {
            return;
        }
        let initial_path = self.initial_path();
        if let Ok(raw) = std::fs::read_to_string(&initial_path) {
            if !raw.trim().is_empty() {
                info!(path = %initial_path.display(), "reusing persisted initial health snapshot");
                self.initial = Some(Snapshot::parse(raw));
                return;
            }
        }
        self.capture().await;
        let snapshot = self.latest.clone().unwrap_or_default();
        if !snapshot.is_empty() {
            self.persist(&initial_path, &snapshot.raw);
        }
        self.initial = Some(snapshot);
    }

    /// Ask the device to start its long internal self-test. Does not block
    /// on the test; it proceeds inside the device.
    pub async fn schedule_long_test(&self) -> bool {
        let mut args = vec!["-t".to_string(), "long".to_string()];
        if let Some(smart_type) = &self.probe.smart_type {
            args.push("-d".to_string());
            args.push(smart_type.clone());
        }
        args.push(self.probe.device.display().to_string());

        let result = tokio::time::timeout(
            self.capture_timeout,
            Command::new("smartctl")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                info!(device = %self.probe.device.display(), "long self-test scheduled");
                true
            }
            Ok(Ok(output)) => {
                warn!(
                    device = %self.probe.device.display(),
                    exit = ?output.status.code(),
                    "long self-test request rejected"
                );
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to run health tool for self-test");
                false
            }
            Err(_) => {
                warn!("long self-test request timed out");
                false
            }
        }
    }

    async fn run_probe(&self) -> Snapshot {
        let (program, args) = self.probe.command();
        let result = tokio::time::timeout(
            self.capture_timeout,
            Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            // smartctl exits non-zero for mere warnings; its output is still
            // a usable report, so only empty output is treated as a miss.
            Ok(Ok(output)) => {
                let raw = String::from_utf8_lossy(&output.stdout).into_owned();
                if raw.trim().is_empty() {
                    Snapshot::empty()
                } else {
                    Snapshot::parse(raw)
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, tool = %program, "failed to spawn health tool");
                Snapshot::empty()
            }
            Err(_) => {
                warn!(tool = %program, "health capture timed out");
                Snapshot::empty()
            }
        }
    }

    fn persist(&self, path: &std::path::Path, raw: &str) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, raw) {
            warn!(path = %path.display(), error = %e, "failed to persist health snapshot");
        }
    }
}

impl Thermometer for HealthSampler {
    fn poll(&mut self) -> Pin<Box<dyn Future<Output = Option<i32>> + Send + '_>> {
        Box::pin(async move {
            self.refresh_if_stale().await;
            self.temperature()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATA_REPORT: &str = "\
smartctl 7.3 2022-02-28 r5338 [x86_64-linux-6.1.0] (local build)
=== START OF INFORMATION SECTION ===
Device Model:     WDC WD80EFZX-68UW8N0
Serial Number:    VK1234XY
User Capacity:    8,001,563,222,016 bytes [8.00 TB]
Rotation Rate:    5400 rpm

=== START OF READ SMART DATA SECTION ===
ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  5 Reallocated_Sector_Ct   0x0033   100   100   005    Pre-fail  Always       -       0
  9 Power_On_Hours          0x0032   098   098   000    Old_age   Always       -       14321
190 Airflow_Temperature_Cel 0x0022   062   045   040    Old_age   Always       -       38 (Min/Max 24/55)
194 Temperature_Celsius     0x0022   036   053   000    Old_age   Always       -       36 (Min/Max 20/53)
197 Current_Pending_Sector  0x0012   100   100   000    Old_age   Always       -       0
199 UDMA_CRC_Error_Count    0x003e   200   200   000    Old_age   Always       -       7
";

    const NVME_REPORT: &str = "\
smartctl 7.3 2022-02-28 r5338 [x86_64-linux-6.1.0] (local build)
=== START OF SMART DATA SECTION ===
SMART overall-health self-assessment test result: PASSED

Temperature:                        35 Celsius
Percentage Used:                    3%
Power On Hours:                     1,204
Unsafe Shutdowns:                   12
";

    #[test]
    fn ata_attributes_parse_with_raw_values() {
        let snapshot = Snapshot::parse(ATA_REPORT.to_string());
        assert_eq!(snapshot.attribute("Reallocated_Sector_Ct"), Some("0"));
        assert_eq!(snapshot.attribute("Power_On_Hours"), Some("14321"));
        assert_eq!(
            snapshot.attribute("Temperature_Celsius"),
            Some("36 (Min/Max 20/53)")
        );
        assert_eq!(snapshot.attribute("UDMA_CRC_Error_Count"), Some("7"));
    }

    #[test]
    fn ata_temperature_prefers_named_attribute() {
        let snapshot = Snapshot::parse(ATA_REPORT.to_string());
        // Temperature_Celsius (36) wins over Airflow_Temperature_Cel (38).
        assert_eq!(snapshot.temperature(), Some(36));
    }

    #[test]
    fn nvme_temperature_falls_back_to_generic_field() {
        let snapshot = Snapshot::parse(NVME_REPORT.to_string());
        assert_eq!(snapshot.temperature(), Some(35));
    }

    #[test]
    fn identity_fields_are_captured() {
        let snapshot = Snapshot::parse(ATA_REPORT.to_string());
        assert_eq!(snapshot.attribute("Serial Number"), Some("VK1234XY"));
    }

    #[test]
    fn empty_snapshot_has_no_temperature() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.temperature(), None);
        assert_eq!(snapshot.attribute("anything"), None);
    }

    #[test]
    fn non_integer_temperature_rejected() {
        let snapshot = Snapshot::parse("Temperature: warm\n".to_string());
        assert_eq!(snapshot.temperature(), None);
        let fractional = Snapshot::parse("Temperature: 35.5 Celsius\n".to_string());
        assert_eq!(fractional.temperature(), None);
    }

    #[test]
    fn tracked_attribute_names_are_ata_raw_names() {
        for name in TRACKED_ATTRIBUTES {
            assert!(!name.contains(' '), "{name} should be an attribute token");
        }
    }
}
