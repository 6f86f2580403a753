//! Error types for the orchestrator.

use convoy_storage::StorageError;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by daemon operations.
///
/// Only the HTTP layer translates these into transport responses.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Malformed UUID or name, or a missing required field.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Name or UUID already bound to something else.
    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The driver lacks the requested capability.
    #[error("{0}")]
    NotSupported(String),

    /// A driver or object store call failed.
    #[error("driver {driver}: {context}: {source}")]
    Driver {
        driver: String,
        context: String,
        #[source]
        source: StorageError,
    },

    /// The daemon's own bookkeeping is inconsistent.
    #[error("BUG: {0}")]
    Invariant(String),

    /// Volume metadata could not be written or read.
    #[error("metadata persistence failed: {0}")]
    Persistence(String),
}

impl DaemonError {
    /// Wrap a driver error, keeping capability errors distinct.
    pub fn driver(driver: &str, context: impl Into<String>, source: StorageError) -> Self {
        match source {
            StorageError::NotSupported { .. } => Self::NotSupported(source.to_string()),
            source => Self::Driver {
                driver: driver.to_string(),
                context: context.into(),
                source,
            },
        }
    }

    /// Report broken bookkeeping; logged so operators can tell it apart
    /// from a rejected request.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(invariant = true, "BUG: {}", message);
        Self::Invariant(message)
    }

    pub fn persistence(source: StorageError) -> Self {
        Self::Persistence(source.to_string())
    }

    /// Whether the error means the object does not exist, either in the
    /// daemon or at the driver.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Driver { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_supported_stays_distinct() {
        let err = DaemonError::driver("nfs", "create snapshot", StorageError::not_supported("nfs", "snapshot"));
        assert!(matches!(err, DaemonError::NotSupported(_)));

        let err = DaemonError::driver("vfs", "inspect backup", StorageError::NotFound("backup x".into()));
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("driver vfs: inspect backup"));
    }

    #[test]
    fn test_invariant_message() {
        assert_eq!(
            DaemonError::invariant("index out of sync").to_string(),
            "BUG: index out of sync"
        );
    }
}
