//! Request and response bodies of the daemon API.
//!
//! Volumes and snapshots are referenced by UUID or by name.

use std::collections::BTreeMap;

use convoy_storage::DriverInfo;
use serde::{Deserialize, Serialize};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeCreateRequest {
    pub name: Option<String>,
    /// Caller-chosen UUID; minted when absent.
    pub uuid: Option<String>,
    /// Driver to create the volume with; the default driver when absent.
    pub driver_name: Option<String>,
    /// Size such as `10G`; the driver default when absent.
    pub size: Option<String>,
    /// Backup to restore the new volume from.
    pub backup_url: Option<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeDeleteRequest {
    pub volume: String,
    /// Forget the volume but keep its data in the backend.
    pub reference_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMountRequest {
    pub volume: String,
    pub mount_point: Option<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeUmountRequest {
    pub volume: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeInspectQuery {
    pub volume: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeListQuery {
    /// Only list volumes of this driver.
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotCreateRequest {
    pub volume: String,
    pub name: Option<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotDeleteRequest {
    pub snapshot: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotInspectQuery {
    pub snapshot: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupCreateRequest {
    pub snapshot: String,
    /// Destination such as `vfs:///var/backups`.
    pub dest_url: String,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupDeleteRequest {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupInspectQuery {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupListQuery {
    pub dest_url: String,
    /// Only list backups of the volume with this name or UUID.
    pub volume_name: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Volume metadata with what its driver reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeResponse {
    pub uuid: String,
    pub name: Option<String>,
    pub driver: String,
    pub size: u64,
    pub mount_point: Option<String>,
    pub created_time: String,
    pub driver_info: DriverInfo,
    pub snapshots: BTreeMap<String, SnapshotResponse>,
}

/// Snapshot metadata with its owning volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub uuid: String,
    pub volume_uuid: String,
    pub volume_name: Option<String>,
    pub volume_created_time: String,
    pub name: Option<String>,
    pub created_time: String,
    pub driver_info: DriverInfo,
}

/// Outcome of a backup create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupCreateResponse {
    pub url: String,
    /// Backup metadata, present for verbose requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<DriverInfo>,
}

/// Daemon and driver status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub version: String,
    pub root: String,
    pub default_driver: String,
    pub volume_count: usize,
    pub drivers: BTreeMap<String, DriverInfo>,
}
