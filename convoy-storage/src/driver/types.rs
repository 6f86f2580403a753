//! Driver request and info types.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Flat, string-keyed description of a volume, snapshot or backup as
/// reported by a driver.
pub type DriverInfo = BTreeMap<String, String>;

/// Free-form driver configuration passed once at construction.
///
/// Keys are namespaced by driver (`vfs.path`, `ceph.defaultvolumesize`);
/// unknown keys are ignored.
pub type DriverConfig = HashMap<String, String>;

/// Configuration key naming the mount namespace drivers mount into.
pub const OPT_MOUNT_NAMESPACE: &str = "convoy.mntns";

/// Well-known keys of [`DriverInfo`] maps.
pub mod keys {
    pub const DRIVER: &str = "Driver";
    pub const DEVICE: &str = "Device";
    pub const PATH: &str = "Path";
    pub const MOUNT_POINT: &str = "MountPoint";
    pub const SIZE: &str = "Size";
    pub const FILE_SYSTEM: &str = "FileSystem";
    pub const VOLUME_UUID: &str = "VolumeUUID";
    pub const VOLUME_NAME: &str = "VolumeName";
    pub const VOLUME_CREATED_TIME: &str = "VolumeCreatedAt";
    pub const SNAPSHOT_UUID: &str = "SnapshotUUID";
    pub const SNAPSHOT_NAME: &str = "SnapshotName";
    pub const SNAPSHOT_CREATED_TIME: &str = "SnapshotCreatedAt";
    pub const SNAPSHOT_FILE_PATH: &str = "FilePath";
    pub const BACKUP_URL: &str = "BackupURL";
    pub const DRIVER_NAME: &str = "DriverName";
    pub const VOLUME_SIZE: &str = "VolumeSize";
    pub const VOLUME_FILE_SYSTEM: &str = "VolumeFileSystem";
    pub const CREATED_TIME: &str = "CreatedTime";
}

/// Volume-level request handed to [`VolumeOperations`](super::VolumeOperations).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeRequest {
    /// Volume UUID.
    pub id: String,
    /// Volume name; drivers that address volumes by name (nfs, ceph) use it
    /// as their key.
    pub name: String,
    /// Requested size in bytes; zero means the driver default.
    pub size: u64,
    /// Backup to restore into the new volume.
    pub backup_url: Option<String>,
    /// Mount point requested by the caller.
    pub mount_point: Option<PathBuf>,
    /// Forget the volume without removing its data.
    pub reference_only: bool,
}

impl VolumeRequest {
    /// Request addressing an existing volume.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the requested size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Restore the volume from a backup.
    pub fn with_backup_url(mut self, backup_url: impl Into<String>) -> Self {
        self.backup_url = Some(backup_url.into());
        self
    }

    /// Mount at a caller-chosen mount point.
    pub fn with_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }
}

/// Snapshot-level request handed to [`SnapshotOperations`](super::SnapshotOperations).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Snapshot UUID, minted by the daemon.
    pub id: String,
    /// Owning volume UUID.
    pub volume_id: String,
    /// Optional snapshot name.
    pub name: Option<String>,
}

impl SnapshotRequest {
    /// Request addressing snapshot `id` of volume `volume_id`.
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
            name: None,
        }
    }
}

/// Everything a driver needs to turn a snapshot into a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupRequest {
    /// Source snapshot UUID.
    pub snapshot_id: String,
    /// Source volume UUID.
    pub volume_id: String,
    /// Destination URL (e.g. `vfs:///var/backups/`).
    pub dest_url: String,
    /// Source volume name.
    pub volume_name: String,
    /// Source volume size in bytes.
    pub volume_size: u64,
    /// Source volume creation time.
    pub volume_created_time: String,
    /// Filesystem of the source volume, if known.
    pub file_system: String,
    /// Source snapshot name.
    pub snapshot_name: String,
    /// Source snapshot creation time.
    pub snapshot_created_time: String,
}
