//! Device probe: identity resolution and safety refusals.
//!
//! Resolves a whole block device's identity (model, serial, byte size,
//! logical sector size, rotational flag) from sysfs and refuses devices that
//! are mounted, in use as swap, or backing the running root filesystem.
//! The probe performs no side effects on the device.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::thermal::ThermalThresholds;

/// Immutable identity of the device under test, fixed for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device node path (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// Kernel name (e.g. `sdb`).
    pub name: String,
    /// Device model string, or `unknown`.
    pub model: String,
    /// Serial number, sanitized for use in file names.
    pub serial: String,
    /// Total capacity in bytes. Always > 0.
    pub size_bytes: u64,
    /// Logical sector size in bytes.
    pub logical_sector: u64,
    /// Whether the media is rotational (spinning disk).
    pub rotational: bool,
}

impl DeviceDescriptor {
    /// Human-readable media class for logs and the certificate.
    #[must_use]
    pub fn media_class(&self) -> &'static str {
        if self.rotational {
            "rotational"
        } else {
            "solid-state"
        }
    }

    /// Thermal thresholds appropriate for this media class.
    #[must_use]
    pub fn default_thermal(&self) -> ThermalThresholds {
        ThermalThresholds::for_media(self.rotational)
    }
}

/// Probe a device path and build its [`DeviceDescriptor`].
///
/// Fails if the path is not a whole block device, its size cannot be read or
/// is zero, the device or any of its partitions is mounted or swapped on, or
/// the device backs the running root filesystem.
pub fn identify(path: &Path) -> Result<DeviceDescriptor, ProbeError> {
    let metadata =
        fs::metadata(path).map_err(|_| ProbeError::NotBlockDevice(path.to_path_buf()))?;
    if !metadata.file_type().is_block_device() {
        return Err(ProbeError::NotBlockDevice(path.to_path_buf()));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ProbeError::NotBlockDevice(path.to_path_buf()))?
        .to_string();

    // Partitions have no /sys/block entry; only whole devices do.
    let sys_block = Path::new("/sys/block").join(&name);
    if !sys_block.exists() {
        return Err(ProbeError::NotBlockDevice(path.to_path_buf()));
    }

    let sectors = read_sysfs_u64(&sys_block.join("size"))
        .ok_or_else(|| ProbeError::UnknownSize(path.to_path_buf()))?;
    let size_bytes = sectors * 512;
    if size_bytes == 0 {
        return Err(ProbeError::ZeroSize(path.to_path_buf()));
    }

    let logical_sector =
        read_sysfs_u64(&sys_block.join("queue/logical_block_size")).unwrap_or(512);
    let rotational = read_sysfs_u64(&sys_block.join("queue/rotational")) == Some(1);

    let model = read_sysfs_string(&sys_block.join("device/model"))
        .unwrap_or_else(|| "unknown".to_string());
    let serial = read_sysfs_string(&sys_block.join("device/serial"))
        .or_else(|| read_sysfs_string(&sys_block.join("wwid")))
        .map(|s| sanitize_serial(&s))
        .unwrap_or_else(|| sanitize_serial(&name));

    refuse_if_in_use(path, &name, &sys_block)?;

    Ok(DeviceDescriptor {
        path: path.to_path_buf(),
        name,
        model,
        serial,
        size_bytes,
        logical_sector,
        rotational,
    })
}

/// Check `/proc/mounts`, `/proc/swaps`, and the root filesystem's backing
/// device numbers. Any hit refuses the device.
fn refuse_if_in_use(path: &Path, name: &str, sys_block: &Path) -> Result<(), ProbeError> {
    if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(mount_point)) = (fields.next(), fields.next()) else {
                continue;
            };
            if names_device_or_partition(source, name) {
                return Err(ProbeError::Mounted {
                    device: path.to_path_buf(),
                    mount_point: mount_point.to_string(),
                });
            }
        }
    }

    if let Ok(swaps) = fs::read_to_string("/proc/swaps") {
        for line in swaps.lines().skip(1) {
            let Some(source) = line.split_whitespace().next() else {
                continue;
            };
            if names_device_or_partition(source, name) {
                return Err(ProbeError::ActiveSwap(path.to_path_buf()));
            }
        }
    }

    // The root filesystem's st_dev is the device number of its backing block
    // device. Compare against this disk and each of its partitions.
    if let Ok(root) = fs::metadata("/") {
        let root_dev = root.dev();
        let root_pair = (
            nix::sys::stat::major(root_dev),
            nix::sys::stat::minor(root_dev),
        );
        for dev_file in device_number_files(sys_block, name) {
            if let Some(pair) = read_sysfs_string(&dev_file).and_then(|s| parse_dev_numbers(&s)) {
                if pair == root_pair {
                    return Err(ProbeError::RootBacking(path.to_path_buf()));
                }
            }
        }
    }

    Ok(())
}

/// `dev` files for the whole device and every partition under its sysfs dir.
fn device_number_files(sys_block: &Path, name: &str) -> Vec<PathBuf> {
    let mut files = vec![sys_block.join("dev")];
    if let Ok(entries) = fs::read_dir(sys_block) {
        for entry in entries.flatten() {
            let entry_name = entry.file_name();
            let Some(entry_name) = entry_name.to_str() else {
                continue;
            };
            if entry_name != name && entry_name.starts_with(name) {
                files.push(entry.path().join("dev"));
            }
        }
    }
    files
}

/// Whether a `/dev/...` mount source names this device or one of its
/// partitions (`/dev/sda`, `/dev/sda1`, `/dev/nvme0n1p2`).
///
/// Kernel naming: devices whose name ends in a digit (nvme0n1, mmcblk0)
/// take partitions only as `p<digits>`; a bare digit suffix there names a
/// sibling device (nvme0n11), not a partition. Devices ending in a letter
/// (sda) take partitions as `<digits>`.
fn names_device_or_partition(source: &str, name: &str) -> bool {
    let Some(rest) = source
        .strip_prefix("/dev/")
        .and_then(|s| s.strip_prefix(name))
    else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let name_ends_in_digit = name.chars().last().is_some_and(|c| c.is_ascii_digit());
    if name_ends_in_digit {
        rest.starts_with('p')
            && rest.len() > 1
            && rest[1..].chars().all(|c| c.is_ascii_digit())
    } else {
        rest.chars().all(|c| c.is_ascii_digit())
    }
}

/// Parse a sysfs `dev` file payload of the form `major:minor`.
fn parse_dev_numbers(text: &str) -> Option<(u64, u64)> {
    let (major, minor) = text.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn read_sysfs_u64(path: &Path) -> Option<u64> {
    read_sysfs_string(path)?.parse().ok()
}

fn read_sysfs_string(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Replace characters unsafe for file names. Serials key the checkpoint,
/// snapshot, and certificate paths.
#[must_use]
pub fn sanitize_serial(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Render a byte count in binary units for logs and listings.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// =============================================================================
// Candidate listing
// =============================================================================

/// One row of `--list` output.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateDisk {
    pub name: String,
    pub model: String,
    pub serial: String,
    pub size_bytes: u64,
    pub rotational: bool,
}

/// Kernel name prefixes that are never pre-clear candidates.
const EXCLUDED_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "fd", "nbd"];

/// Enumerate whole block devices that look like pre-clear candidates.
///
/// Virtual and removable-media devices (loop, ram, zram, device-mapper, md,
/// optical, floppy, nbd) are excluded. Requires no privilege.
pub fn list_candidates() -> std::io::Result<Vec<CandidateDisk>> {
    let mut disks = Vec::new();
    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let sys = entry.path();
        let size_bytes = read_sysfs_u64(&sys.join("size")).unwrap_or(0) * 512;
        if size_bytes == 0 {
            continue;
        }
        disks.push(CandidateDisk {
            model: read_sysfs_string(&sys.join("device/model"))
                .unwrap_or_else(|| "unknown".to_string()),
            serial: read_sysfs_string(&sys.join("device/serial"))
                .or_else(|| read_sysfs_string(&sys.join("wwid")))
                .map(|s| sanitize_serial(&s))
                .unwrap_or_else(|| "unknown".to_string()),
            size_bytes,
            rotational: read_sysfs_u64(&sys.join("queue/rotational")) == Some(1),
            name,
        });
    }
    disks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(disks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_matching_exact_and_numbered() {
        assert!(names_device_or_partition("/dev/sda", "sda"));
        assert!(names_device_or_partition("/dev/sda1", "sda"));
        assert!(names_device_or_partition("/dev/sda12", "sda"));
        assert!(names_device_or_partition("/dev/nvme0n1p2", "nvme0n1"));
    }

    #[test]
    fn partition_matching_rejects_other_disks() {
        // /dev/sdaa is a different disk, not a partition of sda.
        assert!(!names_device_or_partition("/dev/sdaa", "sda"));
        assert!(!names_device_or_partition("/dev/sdb", "sda"));
        assert!(!names_device_or_partition("tmpfs", "sda"));
        assert!(!names_device_or_partition("/dev/sda1", "sdb"));
    }

    #[test]
    fn partition_matching_rejects_sibling_namespaces() {
        // /dev/nvme0n11 is namespace 11, not a partition of nvme0n1.
        assert!(!names_device_or_partition("/dev/nvme0n11", "nvme0n1"));
        assert!(!names_device_or_partition("/dev/nvme0n12", "nvme0n1"));
        assert!(names_device_or_partition("/dev/nvme0n1", "nvme0n1"));
        assert!(names_device_or_partition("/dev/nvme0n1p1", "nvme0n1"));
        // Same convention for mmc devices.
        assert!(names_device_or_partition("/dev/mmcblk0p2", "mmcblk0"));
        assert!(!names_device_or_partition("/dev/mmcblk01", "mmcblk0"));
    }

    #[test]
    fn dev_numbers_parse() {
        assert_eq!(parse_dev_numbers("8:16\n"), Some((8, 16)));
        assert_eq!(parse_dev_numbers("259:0"), Some((259, 0)));
        assert_eq!(parse_dev_numbers("not-a-dev"), None);
    }

    #[test]
    fn serial_sanitization() {
        assert_eq!(sanitize_serial("WD-WCC4N1234567"), "WD-WCC4N1234567");
        assert_eq!(sanitize_serial("  S3Z9NB0K 123/456  "), "S3Z9NB0K_123_456");
        assert_eq!(sanitize_serial("naa.5000c500a1b2c3d4"), "naa.5000c500a1b2c3d4");
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(511), "511 B");
        assert_eq!(format_size(2 * 1024 * 1024), "2.0 MiB");
        assert_eq!(format_size(1_000_204_886_016), "931.5 GiB");
    }

    #[test]
    fn thermal_defaults_by_media_class() {
        let rotational = ThermalThresholds::for_media(true);
        assert_eq!(
            (rotational.pause_c, rotational.resume_c, rotational.abort_c),
            (50, 45, 55)
        );
        let solid_state = ThermalThresholds::for_media(false);
        assert_eq!(
            (
                solid_state.pause_c,
                solid_state.resume_c,
                solid_state.abort_c
            ),
            (60, 55, 70)
        );
    }
}
