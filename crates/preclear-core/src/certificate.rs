//! End-of-run certificate rendering.
//!
//! One text file per completed (or aborted) run, attesting what the device
//! was put through: identity, thermal history, snapshot locations, and a
//! per-attribute before/after delta.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::device::{DeviceDescriptor, format_size};
use crate::error::CertificateError;
use crate::pipeline::RunOutcome;
use crate::smart::{Snapshot, TRACKED_ATTRIBUTES};
use crate::thermal::{ThermalRecord, ThermalThresholds};

/// Everything the certificate reports on.
pub struct CertificateInput<'a> {
    pub descriptor: &'a DeviceDescriptor,
    pub thresholds: &'a ThermalThresholds,
    pub governor_enabled: bool,
    pub thermal: &'a ThermalRecord,
    pub outcome: &'a RunOutcome,
    pub steps_run: &'a [String],
    pub initial_snapshot: Option<&'a Snapshot>,
    pub final_snapshot: Option<&'a Snapshot>,
    pub initial_snapshot_path: PathBuf,
    pub final_snapshot_path: PathBuf,
}

/// Certificate file name:
/// `preclear-ng_certificate_<serial>_<YYYY.MM.DD_HH.MM.SS>.txt`.
#[must_use]
pub fn certificate_file_name(serial: &str, generated_at: DateTime<Local>) -> String {
    format!(
        "preclear-ng_certificate_{serial}_{}.txt",
        generated_at.format("%Y.%m.%d_%H.%M.%S")
    )
}

/// Render and write the certificate into the reports directory.
pub fn write_certificate(
    reports_dir: &Path,
    serial: &str,
    input: &CertificateInput<'_>,
) -> Result<PathBuf, CertificateError> {
    fs::create_dir_all(reports_dir).map_err(|source| CertificateError::CreateDir {
        path: reports_dir.to_path_buf(),
        source,
    })?;
    let generated_at = Local::now();
    let path = reports_dir.join(certificate_file_name(serial, generated_at));
    let content = render(input, generated_at);
    fs::write(&path, content).map_err(|source| CertificateError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Render the certificate text.
#[must_use]
pub fn render(input: &CertificateInput<'_>, generated_at: DateTime<Local>) -> String {
    let mut out = String::new();
    let descriptor = input.descriptor;

    let _ = writeln!(
        out,
        "preclear-ng {} — device pre-clear certificate",
        env!("CARGO_PKG_VERSION")
    );
    let _ = writeln!(out, "generated: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out);

    let _ = writeln!(out, "== Device ==");
    let _ = writeln!(out, "path:          {}", descriptor.path.display());
    let _ = writeln!(out, "model:         {}", descriptor.model);
    let _ = writeln!(out, "serial:        {}", descriptor.serial);
    let _ = writeln!(
        out,
        "capacity:      {} ({} bytes)",
        format_size(descriptor.size_bytes),
        descriptor.size_bytes
    );
    let _ = writeln!(
        out,
        "sector size:   {} bytes (logical)",
        descriptor.logical_sector
    );
    let _ = writeln!(out, "media:         {}", descriptor.media_class());
    let _ = writeln!(out);

    let _ = writeln!(out, "== Result ==");
    let _ = writeln!(out, "status:        {}", verdict_line(input.outcome));
    if input.steps_run.is_empty() {
        let _ = writeln!(out, "steps run:     none");
    } else {
        let _ = writeln!(out, "steps run:");
        for step in input.steps_run {
            let _ = writeln!(out, "  - {step}");
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "== Thermal ==");
    if input.governor_enabled {
        let thresholds = input.thresholds;
        let _ = writeln!(
            out,
            "thresholds:    pause {} °C / resume {} °C / abort {} °C",
            thresholds.pause_c, thresholds.resume_c, thresholds.abort_c
        );
        let budget = if thresholds.sustained_fail_minutes == 0 {
            "disabled".to_string()
        } else {
            format!("{} min", thresholds.sustained_fail_minutes)
        };
        let _ = writeln!(out, "heat budget:   {budget}");
    } else {
        let _ = writeln!(out, "thresholds:    governor disabled");
    }
    let record = input.thermal;
    let _ = writeln!(
        out,
        "run min/max:   {} / {}",
        temp_or_unknown(record.run_min_c),
        temp_or_unknown(record.run_max_c)
    );
    let _ = writeln!(
        out,
        "paused:        {} s total",
        record.paused_total.as_secs()
    );
    let _ = writeln!(
        out,
        "above pause:   {} s total ({} s final step)",
        record.above_pause_total.as_secs(),
        record.above_pause_step.as_secs()
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "== Health snapshots ==");
    let _ = writeln!(out, "initial:       {}", input.initial_snapshot_path.display());
    let _ = writeln!(out, "final:         {}", input.final_snapshot_path.display());
    let _ = writeln!(out);

    let _ = writeln!(out, "== SMART attribute delta ==");
    let _ = writeln!(
        out,
        "{:<26}{}",
        "ATTRIBUTE", "initial | current | up/down Δ | -"
    );
    for name in TRACKED_ATTRIBUTES {
        let initial = attribute_of(input.initial_snapshot, name);
        let current = attribute_of(input.final_snapshot, name);
        let delta = delta_of(initial, current);
        let _ = writeln!(
            out,
            "{:<26}{} | {} | {} | -",
            name,
            initial.unwrap_or("absent"),
            current.unwrap_or("absent"),
            delta
        );
    }

    out
}

fn verdict_line(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Success { cycles } => {
            format!("SUCCESS — {cycles} cycle(s) completed without fatal regression")
        }
        RunOutcome::ThermalAbort { step, kind } => {
            format!("aborted at step {} (thermal: {kind})", step.number())
        }
        RunOutcome::StepFailed { step, outcome } => {
            format!("FAILED at {step}: {outcome}")
        }
        RunOutcome::Cancelled { step } => format!("cancelled during {step}"),
    }
}

fn temp_or_unknown(temp_c: Option<i32>) -> String {
    temp_c.map_or_else(|| "unknown".to_string(), |t| format!("{t} °C"))
}

fn attribute_of<'a>(snapshot: Option<&'a Snapshot>, name: &str) -> Option<&'a str> {
    snapshot.and_then(|s| s.attribute(name))
}

/// `up N` / `down N` when both sides carry a leading integer, `-` otherwise.
fn delta_of(initial: Option<&str>, current: Option<&str>) -> String {
    let parse = |value: Option<&str>| -> Option<i64> {
        value?.split_whitespace().next()?.parse().ok()
    };
    match (parse(initial), parse(current)) {
        (Some(a), Some(b)) if b > a => format!("up {}", b - a),
        (Some(a), Some(b)) if b < a => format!("down {}", a - b),
        (Some(_), Some(_)) => "-".to_string(),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepId;
    use crate::supervisor::ThermalAbortKind;
    use chrono::TimeZone;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            path: PathBuf::from("/dev/sdz"),
            name: "sdz".to_string(),
            model: "WDC WD80EFZX".to_string(),
            serial: "VK1234XY".to_string(),
            size_bytes: 8_001_563_222_016,
            logical_sector: 512,
            rotational: true,
        }
    }

    fn base_input<'a>(
        descriptor: &'a DeviceDescriptor,
        thresholds: &'a ThermalThresholds,
        record: &'a ThermalRecord,
        outcome: &'a RunOutcome,
        steps: &'a [String],
    ) -> CertificateInput<'a> {
        CertificateInput {
            descriptor,
            thresholds,
            governor_enabled: true,
            thermal: record,
            outcome,
            steps_run: steps,
            initial_snapshot: None,
            final_snapshot: None,
            initial_snapshot_path: PathBuf::from("/var/lib/preclear-ng/smart_VK1234XY_initial.txt"),
            final_snapshot_path: PathBuf::from("/var/lib/preclear-ng/smart_VK1234XY_last.txt"),
        }
    }

    #[test]
    fn file_name_embeds_serial_and_timestamp() {
        let at = Local.with_ymd_and_hms(2026, 8, 2, 14, 3, 9).unwrap();
        assert_eq!(
            certificate_file_name("VK1234XY", at),
            "preclear-ng_certificate_VK1234XY_2026.08.02_14.03.09.txt"
        );
    }

    #[test]
    fn success_certificate_names_device_and_steps() {
        let descriptor = descriptor();
        let thresholds = ThermalThresholds::for_media(true);
        let record = ThermalRecord::default();
        let outcome = RunOutcome::Success { cycles: 1 };
        let steps = vec![
            "step 1 (pre-read)".to_string(),
            "step 2 (destructive) [4 patterns]".to_string(),
            "step 4 (zero-fill)".to_string(),
            "step 5 (verify-read)".to_string(),
            "step 6 (finalize)".to_string(),
        ];
        let input = base_input(&descriptor, &thresholds, &record, &outcome, &steps);
        let at = Local.with_ymd_and_hms(2026, 8, 2, 14, 3, 9).unwrap();
        let text = render(&input, at);
        assert!(text.contains("SUCCESS"));
        assert!(text.contains("VK1234XY"));
        assert!(text.contains("rotational"));
        for step in &steps {
            assert!(text.contains(step.as_str()), "missing {step}");
        }
    }

    #[test]
    fn thermal_abort_certificate_marks_step() {
        let descriptor = descriptor();
        let thresholds = ThermalThresholds::for_media(true);
        let record = ThermalRecord::default();
        let outcome = RunOutcome::ThermalAbort {
            step: StepId::ZeroFill,
            kind: ThermalAbortKind::OverTemp,
        };
        let input = base_input(&descriptor, &thresholds, &record, &outcome, &[]);
        let text = render(&input, Local::now());
        assert!(text.contains("aborted at step 4 (thermal"));
    }

    #[test]
    fn delta_block_reports_direction() {
        assert_eq!(delta_of(Some("0"), Some("3")), "up 3");
        assert_eq!(delta_of(Some("7"), Some("2")), "down 5");
        assert_eq!(delta_of(Some("5"), Some("5")), "-");
        assert_eq!(delta_of(None, Some("5")), "-");
        assert_eq!(delta_of(Some("36 (Min/Max 20/53)"), Some("41 (Min/Max 20/55)")), "up 5");
    }

    #[test]
    fn delta_block_lists_tracked_attributes() {
        let descriptor = descriptor();
        let thresholds = ThermalThresholds::for_media(true);
        let record = ThermalRecord::default();
        let outcome = RunOutcome::Success { cycles: 1 };
        let initial = Snapshot::parse(
            "  5 Reallocated_Sector_Ct   0x0033   100   100   005    Pre-fail  Always       -       0\n"
                .to_string(),
        );
        let last = Snapshot::parse(
            "  5 Reallocated_Sector_Ct   0x0033   100   100   005    Pre-fail  Always       -       2\n"
                .to_string(),
        );
        let mut input = base_input(&descriptor, &thresholds, &record, &outcome, &[]);
        input.initial_snapshot = Some(&initial);
        input.final_snapshot = Some(&last);
        let text = render(&input, Local::now());
        assert!(text.contains("Reallocated_Sector_Ct"));
        assert!(text.contains("0 | 2 | up 2 | -"));
        // Attributes absent from both snapshots still get a row.
        assert!(text.contains("UDMA_CRC_Error_Count"));
        assert!(text.contains("absent | absent | - | -"));
    }
}
