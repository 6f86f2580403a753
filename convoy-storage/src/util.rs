//! Small helpers shared by drivers: command execution, size parsing,
//! name/UUID validation and JSON record persistence.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Execute a command and return its stdout.
///
/// A non-zero exit status is reported as [`StorageError::CommandFailed`]
/// carrying the trimmed stderr.
pub fn execute(binary: &str, args: &[&str]) -> Result<String> {
    debug!(command = %binary, args = ?args, "Executing command");

    let output = Command::new(binary)
        .args(args)
        .output()
        .map_err(|e| StorageError::CommandFailed {
            command: command_line(binary, args),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StorageError::CommandFailed {
            command: command_line(binary, args),
            reason: format!("{} ({})", stderr.trim_end(), output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn command_line(binary: &str, args: &[&str]) -> String {
    std::iter::once(binary)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a human size such as `100G`, `512m` or `1024` into bytes.
///
/// Suffixes `k`, `m`, `g` and `t` are binary multiples and case-insensitive.
/// An empty string is zero.
pub fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim();
    if size.is_empty() {
        return Ok(0);
    }

    let (digits, multiplier) = match size.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&size[..size.len() - 1], 1u64 << 10),
        Some('m') => (&size[..size.len() - 1], 1 << 20),
        Some('g') => (&size[..size.len() - 1], 1 << 30),
        Some('t') => (&size[..size.len() - 1], 1 << 40),
        _ => (size, 1),
    };

    let value: u64 = digits.parse().map_err(|_| {
        StorageError::InvalidArgument(format!("invalid size {:?}", size))
    })?;

    value.checked_mul(multiplier).ok_or_else(|| {
        StorageError::InvalidArgument(format!("size {:?} overflows", size))
    })
}

/// Whether `name` is a valid volume or snapshot name.
///
/// Names start with an alphanumeric character, are at least two characters
/// long and otherwise contain only alphanumerics, `_`, `.` and `-`.
pub fn validate_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    let rest = chars.as_str();
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Validate a name, returning an invalid-argument error otherwise.
pub fn check_name(name: &str) -> Result<()> {
    if validate_name(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidArgument(format!("invalid name {:?}", name)))
    }
}

/// Validate a UUID string, returning an invalid-argument error otherwise.
pub fn check_uuid(id: &str) -> Result<()> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| StorageError::InvalidArgument(format!("invalid UUID {:?}", id)))
}

/// Whether `id` parses as a UUID.
pub fn is_uuid(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// Current time formatted as RFC 3339, the format used in all metadata.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// List the IDs of records named `<prefix><id><suffix>` in `dir`.
pub fn list_config_ids(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(id) = file_name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Atomically write `value` as pretty JSON to `path`.
///
/// The record is written to a sibling temporary file and renamed into place
/// so readers never observe a partial record.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a JSON record, mapping a missing file to [`StorageError::NotFound`].
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(format!("record {}", path.display()))
        } else {
            StorageError::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&data)?)
}

/// Remove a file; removing a missing file is not an error.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
