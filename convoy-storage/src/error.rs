//! Error types for the storage layer.

use thiserror::Error;

/// Errors that can occur inside drivers, the object store and helpers.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The driver does not provide the requested capability.
    #[error("driver {driver} does not support {capability} operations")]
    NotSupported {
        /// Driver name.
        driver: String,
        /// Capability name (volume, snapshot, backup).
        capability: &'static str,
    },

    /// A volume, snapshot, backup or driver was not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The object already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid driver configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The object is busy (for example, still mounted).
    #[error("{0}")]
    Busy(String),

    /// An external command exited unsuccessfully.
    #[error("command {command} failed: {reason}")]
    CommandFailed {
        /// Command line that was executed.
        command: String,
        /// stderr or spawn error.
        reason: String,
    },

    /// Backup blob content does not match its recorded checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Object path in the store.
        path: String,
        /// Recorded checksum.
        expected: String,
        /// Computed checksum.
        actual: String,
    },

    /// No filesystem was detected on a device.
    #[error("no filesystem detected on {0}")]
    NoFilesystem(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Internal error; indicates a bug in the caller's bookkeeping.
    #[error("BUG: {0}")]
    Internal(String),
}

impl StorageError {
    /// Shorthand for [`StorageError::NotSupported`].
    pub fn not_supported(driver: impl Into<String>, capability: &'static str) -> Self {
        Self::NotSupported {
            driver: driver.into(),
            capability,
        }
    }

    /// Whether the error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
