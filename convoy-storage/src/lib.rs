//! # convoy-storage
//!
//! Storage drivers and backup object store for the Convoy daemon.
//!
//! A driver exposes up to three independent capabilities:
//! - **Volume** operations (create, delete, mount, umount, inspect, list)
//! - **Snapshot** operations (create, delete, inspect, list)
//! - **Backup** operations (create, delete, inspect, list)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            DriverRegistry               │
//! │     (name -> initializer(root, cfg))    │
//! └─────────────────────┬───────────────────┘
//!                       │ Arc<dyn ConvoyDriver>
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌─────────────┐ ┌───────────┐ ┌───────────┐
//! │  VfsDriver  │ │ NfsDriver │ │CephDriver │
//! └──────┬──────┘ └─────┬─────┘ └─────┬─────┘
//!        │              └──────┬──────┘
//!        ▼                     ▼
//! ┌─────────────┐       ┌─────────────┐
//! │ ObjectStore │       │   Mounter   │
//! │ (vfs://...) │       │ (nsenter)   │
//! └─────────────┘       └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use convoy_storage::{DriverConfig, DriverRegistry, VolumeRequest};
//!
//! let mut config = DriverConfig::new();
//! config.insert("vfs.path".into(), "/var/lib/convoy/volumes".into());
//!
//! let driver = DriverRegistry::with_defaults().init("vfs", root, &config)?;
//! driver.volume_ops()?.create_volume(&VolumeRequest::new(id, "vol1")).await?;
//! ```

pub mod driver;
pub mod error;
pub mod fs;
pub mod mock;
pub mod mount;
pub mod objectstore;
pub mod util;

pub use driver::{
    keys,
    BackupOperations,
    BackupRequest,
    CephDriver,
    ConvoyDriver,
    DriverConfig,
    DriverInfo,
    DriverRegistry,
    NfsDriver,
    SnapshotOperations,
    SnapshotRequest,
    VfsDriver,
    VolumeOperations,
    VolumeRequest,
    OPT_MOUNT_NAMESPACE,
};
pub use error::{Result, StorageError};
pub use mock::{MockCapabilities, MockDriver};
pub use mount::{MountableVolume, Mounter};
pub use objectstore::{escape_url, unescape_url, BackupTarget, ObjectStore};
