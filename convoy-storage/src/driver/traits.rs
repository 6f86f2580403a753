//! Driver capability traits.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use super::types::{BackupRequest, DriverInfo, SnapshotRequest, VolumeRequest};

/// A storage backend driver.
///
/// A driver exposes up to three independent capabilities. Callers must ask
/// for a capability right before using it; a driver that lacks it returns
/// [`StorageError::NotSupported`](crate::StorageError::NotSupported).
pub trait ConvoyDriver: Send + Sync {
    /// Registered driver name; also the URL scheme of its backups.
    fn name(&self) -> &str;

    /// Driver-level configuration and status.
    fn info(&self) -> Result<DriverInfo>;

    /// Volume lifecycle operations.
    fn volume_ops(&self) -> Result<&dyn VolumeOperations>;

    /// Snapshot operations.
    fn snapshot_ops(&self) -> Result<&dyn SnapshotOperations>;

    /// Backup operations.
    fn backup_ops(&self) -> Result<&dyn BackupOperations>;
}

/// Volume lifecycle operations.
#[async_trait]
pub trait VolumeOperations: Send + Sync {
    /// Create a volume, restoring `request.backup_url` into it when set.
    async fn create_volume(&self, request: &VolumeRequest) -> Result<()>;

    /// Delete a volume. Fails while the volume is mounted.
    async fn delete_volume(&self, request: &VolumeRequest) -> Result<()>;

    /// Mount a volume and return the mount point.
    async fn mount_volume(&self, request: &VolumeRequest) -> Result<PathBuf>;

    /// Unmount a volume.
    async fn umount_volume(&self, request: &VolumeRequest) -> Result<()>;

    /// Current mount point, `None` when not mounted.
    async fn mount_point(&self, request: &VolumeRequest) -> Result<Option<PathBuf>>;

    /// Driver view of one volume.
    async fn get_volume_info(&self, request: &VolumeRequest) -> Result<DriverInfo>;

    /// Driver view of every volume it knows, keyed by its volume key.
    async fn list_volumes(&self) -> Result<BTreeMap<String, DriverInfo>>;
}

/// Snapshot operations.
#[async_trait]
pub trait SnapshotOperations: Send + Sync {
    /// Capture a snapshot of `request.volume_id` under `request.id`.
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<()>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, request: &SnapshotRequest) -> Result<()>;

    /// Driver view of one snapshot.
    async fn get_snapshot_info(&self, request: &SnapshotRequest) -> Result<DriverInfo>;

    /// Snapshots of one volume, or of all volumes when `volume_id` is `None`.
    async fn list_snapshots(&self, volume_id: Option<&str>) -> Result<BTreeMap<String, DriverInfo>>;
}

/// Backup operations.
#[async_trait]
pub trait BackupOperations: Send + Sync {
    /// Upload a snapshot to `request.dest_url`; returns the backup URL.
    async fn create_backup(&self, request: &BackupRequest) -> Result<String>;

    /// Remove a backup.
    async fn delete_backup(&self, backup_url: &str) -> Result<()>;

    /// Stored metadata of a backup.
    async fn get_backup_info(&self, backup_url: &str) -> Result<DriverInfo>;

    /// Backups made by this driver under `dest_url`, keyed by backup URL.
    async fn list_backups(
        &self,
        dest_url: &str,
        volume_name: Option<&str>,
    ) -> Result<BTreeMap<String, DriverInfo>>;
}
