//! Logging initialization using tracing.

use std::str::FromStr;

use anyhow::{bail, Result};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the daemon log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => bail!("unknown log format: {}", other),
        }
    }
}

/// Initialize the tracing subscriber with the given level and format.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Pretty => init_logging_pretty(level),
        LogFormat::Json => init_logging_json(level),
    }
}

/// Initialize human readable logging.
pub fn init_logging_pretty(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(true)
                .with_thread_ids(true)
        )
        .try_init()?;

    Ok(())
}

/// Values for the `reason` field: an operation logs once before it calls
/// into a driver and once after the driver returned successfully.
pub mod reason {
    pub const PREPARE: &str = "prepare";
    pub const COMPLETE: &str = "complete";
}

/// Values for the `event` field.
pub mod event {
    pub const CREATE: &str = "create";
    pub const DELETE: &str = "delete";
    pub const MOUNT: &str = "mount";
    pub const UMOUNT: &str = "umount";
    pub const BACKUP: &str = "backup";
    pub const RESTORE: &str = "restore";
    pub const REMOVE: &str = "remove";
    pub const LIST: &str = "list";
}

/// Values for the `object` field.
pub mod object {
    pub const VOLUME: &str = "volume";
    pub const SNAPSHOT: &str = "snapshot";
    pub const BACKUP: &str = "backup";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
