//! Filesystem helpers for block-device backed drivers.
//!
//! Thin wrappers over `mkfs.*`, `blkid`, `resize2fs` and `fsck`. When the
//! daemon is not running as root the privileged tools are run through
//! `sudo -n`.

use std::process::Command;

use tracing::{debug, info, instrument};

use crate::error::{Result, StorageError};
use crate::util::execute;

/// Filesystem types that [`format_device`] knows how to create.
pub const SUPPORTED_FILESYSTEMS: &[&str] = &["btrfs", "ext2", "ext3", "ext4", "minix", "xfs"];

/// Filesystem type reported by `blkid` for LUKS containers.
pub const CRYPTO_LUKS_FS_TYPE: &str = "crypto_LUKS";

/// Create a filesystem of `fs_type` on `device`.
#[instrument(fields(device = %device, fs_type = %fs_type))]
pub fn format_device(device: &str, fs_type: &str, fs_options: &str) -> Result<()> {
    if !SUPPORTED_FILESYSTEMS.contains(&fs_type) {
        return Err(StorageError::InvalidConfig(format!(
            "unrecognized or unsupported filesystem type {:?}",
            fs_type
        )));
    }

    let mkfs = format!("mkfs.{}", fs_type);
    let mut args: Vec<&str> = fs_options.split_whitespace().collect();
    args.push(device);

    info!(options = %fs_options, "Formatting device");
    execute(&mkfs, &args)?;
    Ok(())
}

/// Detect the filesystem type on `device`.
///
/// Returns [`StorageError::NoFilesystem`] for an unformatted device.
pub fn detect(device: &str) -> Result<String> {
    let (binary, args) = privileged("blkid", &["-s", "TYPE", "-o", "value", device])?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = Command::new(&binary)
        .args(&args)
        .output()
        .map_err(|e| StorageError::CommandFailed {
            command: "blkid".to_string(),
            reason: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
        // blkid exits with 2 when it finds nothing to report.
        if stdout.is_empty() && output.status.code() == Some(2) {
            return Err(StorageError::NoFilesystem(device.to_string()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StorageError::CommandFailed {
            command: "blkid".to_string(),
            reason: format!("{}: {}", device, stderr.trim()),
        });
    }

    debug!(device = %device, fs_type = %stdout, "Detected filesystem");
    Ok(stdout)
}

/// Grow the filesystem on `device` to fill the device.
///
/// Only the ext family can be resized; resize2fs is a no-op when the
/// filesystem already fills the device.
pub fn resize(device: &str) -> Result<()> {
    let fs_type = detect(device)?;
    if !matches!(fs_type.as_str(), "ext2" | "ext3" | "ext4") {
        return Err(StorageError::InvalidArgument(format!(
            "resize not available for filesystem {} on {}",
            fs_type, device
        )));
    }

    let (binary, args) = privileged("resize2fs", &["-f", device])?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    execute(&binary, &args)?;
    Ok(())
}

/// Check and repair the filesystem on `device`.
pub fn check(device: &str) -> Result<()> {
    execute("fsck", &["-a", device])?;
    Ok(())
}

/// Build the command line for a privileged tool, prefixing `sudo -n` when
/// not running as root.
fn privileged(binary: &str, args: &[&str]) -> Result<(String, Vec<String>)> {
    let uid = execute("id", &["--user"])?;
    let mut full: Vec<String> = Vec::with_capacity(args.len() + 3);

    if uid.trim() == "0" {
        full.extend(args.iter().map(|a| a.to_string()));
        return Ok((binary.to_string(), full));
    }

    full.push("-n".to_string());
    full.push(binary.to_string());
    full.extend(args.iter().map(|a| a.to_string()));
    Ok(("sudo".to_string(), full))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rejects_unknown_fs() {
        let err = format_device("/dev/null", "ntfs", "").unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }
}
