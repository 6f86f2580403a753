//! In-memory driver for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::driver::{
    keys, BackupOperations, BackupRequest, ConvoyDriver, DriverInfo, DriverRegistry,
    SnapshotOperations, SnapshotRequest, VolumeOperations, VolumeRequest,
};
use crate::error::{Result, StorageError};
use crate::objectstore::{encode_backup_url, parse_url, BackupTarget};
use crate::util::now;

/// Capabilities a [`MockDriver`] advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockCapabilities {
    pub volume: bool,
    pub snapshot: bool,
    pub backup: bool,
}

impl MockCapabilities {
    /// Volume, snapshot and backup operations.
    pub fn all() -> Self {
        Self {
            volume: true,
            snapshot: true,
            backup: true,
        }
    }

    /// Volume operations only, like a network-share driver.
    pub fn volume_only() -> Self {
        Self {
            volume: true,
            snapshot: false,
            backup: false,
        }
    }
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    name: String,
    created_time: String,
}

#[derive(Debug, Clone)]
struct MockVolume {
    name: String,
    size: u64,
    mount_point: Option<PathBuf>,
    created_time: String,
    snapshots: BTreeMap<String, MockSnapshot>,
}

#[derive(Debug, Clone)]
struct MockBackup {
    /// Destination the backup was created under, in this driver's scheme.
    dest: String,
    info: DriverInfo,
}

/// Driver that keeps volumes, snapshots and backups in memory.
///
/// Backups are addressed with the driver name as URL scheme, so they are
/// resolved to the driver by scheme rather than through the object store.
/// Individual operations can be made to fail with [`MockDriver::fail_on`].
pub struct MockDriver {
    name: String,
    capabilities: MockCapabilities,
    volumes: RwLock<HashMap<String, MockVolume>>,
    backups: RwLock<BTreeMap<String, MockBackup>>,
    failures: RwLock<HashSet<String>>,
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Internal("Lock poisoned".to_string())
}

impl MockDriver {
    /// Create a mock driver named `name`.
    pub fn new(name: impl Into<String>, capabilities: MockCapabilities) -> Self {
        let name = name.into();
        info!(driver = %name, "Creating mock driver");
        Self {
            name,
            capabilities,
            volumes: RwLock::new(HashMap::new()),
            backups: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(HashSet::new()),
        }
    }

    /// Register a fresh mock driver under `name`.
    pub fn register(registry: &mut DriverRegistry, name: &str, capabilities: MockCapabilities) -> Result<()> {
        let driver_name = name.to_string();
        registry.register(name, move |_, _| {
            Ok(Arc::new(MockDriver::new(driver_name.clone(), capabilities)) as Arc<dyn ConvoyDriver>)
        })
    }

    /// Register `driver` itself, so the caller keeps a handle to it.
    pub fn register_shared(registry: &mut DriverRegistry, driver: Arc<MockDriver>) -> Result<()> {
        let name = driver.name.clone();
        registry.register(&name, move |_, _| Ok(driver.clone() as Arc<dyn ConvoyDriver>))
    }

    /// Make every later call of `operation` (e.g. `"create_snapshot"`) fail.
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(operation.to_string());
        }
    }

    /// Undo [`MockDriver::fail_on`].
    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.write() {
            failures.clear();
        }
    }

    fn check(&self, operation: &str) -> Result<()> {
        let failures = self.failures.read().map_err(poisoned)?;
        if failures.contains(operation) {
            return Err(StorageError::CommandFailed {
                command: format!("{} {}", self.name, operation),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Destination URL rewritten to this driver's scheme, without query.
    fn own_dest(&self, dest_url: &str) -> Result<String> {
        let url = parse_url(dest_url)?;
        let rest = url
            .as_str()
            .split_once("://")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| url.path().to_string());
        let rest = rest.split(['?', '#']).next().unwrap_or_default().to_string();
        Ok(format!("{}://{}", self.name, rest))
    }

    /// Number of volumes the driver holds.
    pub fn volume_count(&self) -> usize {
        self.volumes.read().map(|v| v.len()).unwrap_or(0)
    }

    /// Whether the driver holds snapshot `id` of volume `volume_id`.
    pub fn has_snapshot(&self, volume_id: &str, id: &str) -> bool {
        self.volumes
            .read()
            .map(|v| v.get(volume_id).is_some_and(|v| v.snapshots.contains_key(id)))
            .unwrap_or(false)
    }

    fn volume_info(volume: &MockVolume) -> DriverInfo {
        let mut info = DriverInfo::new();
        info.insert(keys::VOLUME_NAME.to_string(), volume.name.clone());
        info.insert(keys::SIZE.to_string(), volume.size.to_string());
        info.insert(
            keys::MOUNT_POINT.to_string(),
            volume
                .mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        info.insert(keys::VOLUME_CREATED_TIME.to_string(), volume.created_time.clone());
        info
    }

    fn snapshot_info(volume_id: &str, id: &str, snapshot: &MockSnapshot) -> DriverInfo {
        let mut info = DriverInfo::new();
        info.insert("UUID".to_string(), id.to_string());
        info.insert(keys::VOLUME_UUID.to_string(), volume_id.to_string());
        info.insert(keys::SNAPSHOT_NAME.to_string(), snapshot.name.clone());
        info.insert(keys::SNAPSHOT_CREATED_TIME.to_string(), snapshot.created_time.clone());
        info
    }

    fn lookup_backup(&self, backup_url: &str) -> Result<MockBackup> {
        let target = BackupTarget::parse(backup_url)?;
        let backups = self.backups.read().map_err(poisoned)?;
        backups
            .get(&target.to_url_string())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("backup {}", backup_url)))
    }
}

impl ConvoyDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Result<DriverInfo> {
        let mut info = DriverInfo::new();
        info.insert("Name".to_string(), self.name.clone());
        info.insert("Volumes".to_string(), self.volume_count().to_string());
        Ok(info)
    }

    fn volume_ops(&self) -> Result<&dyn VolumeOperations> {
        if self.capabilities.volume {
            Ok(self)
        } else {
            Err(StorageError::not_supported(&self.name, "volume"))
        }
    }

    fn snapshot_ops(&self) -> Result<&dyn SnapshotOperations> {
        if self.capabilities.snapshot {
            Ok(self)
        } else {
            Err(StorageError::not_supported(&self.name, "snapshot"))
        }
    }

    fn backup_ops(&self) -> Result<&dyn BackupOperations> {
        if self.capabilities.backup {
            Ok(self)
        } else {
            Err(StorageError::not_supported(&self.name, "backup"))
        }
    }
}

#[async_trait]
impl VolumeOperations for MockDriver {
    #[instrument(skip(self, request), fields(volume = %request.id))]
    async fn create_volume(&self, request: &VolumeRequest) -> Result<()> {
        self.check("create_volume")?;

        if let Some(backup_url) = &request.backup_url {
            let backup = self.lookup_backup(backup_url)?;
            let driver = backup.info.get(keys::DRIVER_NAME).cloned().unwrap_or_default();
            if driver != self.name {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot restore backup of driver {} to driver {}",
                    driver, self.name
                )));
            }
        }

        let mut volumes = self.volumes.write().map_err(poisoned)?;
        if volumes.contains_key(&request.id) {
            return Err(StorageError::AlreadyExists(format!("volume {}", request.id)));
        }
        volumes.insert(
            request.id.clone(),
            MockVolume {
                name: request.name.clone(),
                size: request.size,
                mount_point: None,
                created_time: now(),
                snapshots: BTreeMap::new(),
            },
        );
        debug!("Mock volume created");
        Ok(())
    }

    async fn delete_volume(&self, request: &VolumeRequest) -> Result<()> {
        self.check("delete_volume")?;
        let mut volumes = self.volumes.write().map_err(poisoned)?;
        let volume = volumes
            .get(&request.id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))?;
        if volume.mount_point.is_some() {
            return Err(StorageError::Busy(format!("volume {} is still mounted", request.id)));
        }
        volumes.remove(&request.id);
        Ok(())
    }

    async fn mount_volume(&self, request: &VolumeRequest) -> Result<PathBuf> {
        self.check("mount_volume")?;
        let mut volumes = self.volumes.write().map_err(poisoned)?;
        let volume = volumes
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))?;

        let mount_point = request
            .mount_point
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/mnt/{}/{}", self.name, request.id)));
        if let Some(existing) = &volume.mount_point {
            if existing != &mount_point {
                return Err(StorageError::Busy(format!(
                    "volume {} is already mounted at {}",
                    request.id,
                    existing.display()
                )));
            }
        }
        volume.mount_point = Some(mount_point.clone());
        Ok(mount_point)
    }

    async fn umount_volume(&self, request: &VolumeRequest) -> Result<()> {
        self.check("umount_volume")?;
        let mut volumes = self.volumes.write().map_err(poisoned)?;
        let volume = volumes
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))?;
        volume.mount_point = None;
        Ok(())
    }

    async fn mount_point(&self, request: &VolumeRequest) -> Result<Option<PathBuf>> {
        let volumes = self.volumes.read().map_err(poisoned)?;
        volumes
            .get(&request.id)
            .map(|v| v.mount_point.clone())
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))
    }

    async fn get_volume_info(&self, request: &VolumeRequest) -> Result<DriverInfo> {
        let volumes = self.volumes.read().map_err(poisoned)?;
        volumes
            .get(&request.id)
            .map(Self::volume_info)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))
    }

    async fn list_volumes(&self) -> Result<BTreeMap<String, DriverInfo>> {
        let volumes = self.volumes.read().map_err(poisoned)?;
        Ok(volumes
            .iter()
            .map(|(id, v)| (id.clone(), Self::volume_info(v)))
            .collect())
    }
}

#[async_trait]
impl SnapshotOperations for MockDriver {
    #[instrument(skip(self, request), fields(volume = %request.volume_id, snapshot = %request.id))]
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        self.check("create_snapshot")?;
        let mut volumes = self.volumes.write().map_err(poisoned)?;
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.volume_id)))?;
        if volume.snapshots.contains_key(&request.id) {
            return Err(StorageError::AlreadyExists(format!("snapshot {}", request.id)));
        }
        volume.snapshots.insert(
            request.id.clone(),
            MockSnapshot {
                name: request.name.clone().unwrap_or_default(),
                created_time: now(),
            },
        );
        Ok(())
    }

    async fn delete_snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        self.check("delete_snapshot")?;
        let mut volumes = self.volumes.write().map_err(poisoned)?;
        volumes
            .get_mut(&request.volume_id)
            .and_then(|v| v.snapshots.remove(&request.id))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("snapshot {}", request.id)))
    }

    async fn get_snapshot_info(&self, request: &SnapshotRequest) -> Result<DriverInfo> {
        self.check("get_snapshot_info")?;
        let volumes = self.volumes.read().map_err(poisoned)?;
        volumes
            .get(&request.volume_id)
            .and_then(|v| v.snapshots.get(&request.id))
            .map(|s| Self::snapshot_info(&request.volume_id, &request.id, s))
            .ok_or_else(|| StorageError::NotFound(format!("snapshot {}", request.id)))
    }

    async fn list_snapshots(&self, volume_id: Option<&str>) -> Result<BTreeMap<String, DriverInfo>> {
        let volumes = self.volumes.read().map_err(poisoned)?;
        let mut result = BTreeMap::new();
        for (vid, volume) in volumes.iter() {
            if volume_id.is_some_and(|id| id != vid) {
                continue;
            }
            for (id, snapshot) in &volume.snapshots {
                result.insert(id.clone(), Self::snapshot_info(vid, id, snapshot));
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl BackupOperations for MockDriver {
    #[instrument(skip(self, request), fields(snapshot = %request.snapshot_id, dest_url = %request.dest_url))]
    async fn create_backup(&self, request: &BackupRequest) -> Result<String> {
        self.check("create_backup")?;
        let dest = self.own_dest(&request.dest_url)?;

        let (size, snapshot) = {
            let volumes = self.volumes.read().map_err(poisoned)?;
            let volume = volumes
                .get(&request.volume_id)
                .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.volume_id)))?;
            let snapshot = volume
                .snapshots
                .get(&request.snapshot_id)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("snapshot {}", request.snapshot_id)))?;
            (volume.size, snapshot)
        };

        let url = encode_backup_url(&parse_url(&dest)?, &request.snapshot_id, &request.volume_id);
        let mut info = DriverInfo::new();
        info.insert(keys::BACKUP_URL.to_string(), url.clone());
        info.insert(keys::DRIVER_NAME.to_string(), self.name.clone());
        info.insert(keys::VOLUME_UUID.to_string(), request.volume_id.clone());
        info.insert(keys::VOLUME_NAME.to_string(), request.volume_name.clone());
        info.insert(keys::VOLUME_SIZE.to_string(), size.to_string());
        info.insert(keys::VOLUME_CREATED_TIME.to_string(), request.volume_created_time.clone());
        info.insert(keys::SNAPSHOT_UUID.to_string(), request.snapshot_id.clone());
        info.insert(keys::SNAPSHOT_NAME.to_string(), snapshot.name);
        info.insert(keys::SNAPSHOT_CREATED_TIME.to_string(), snapshot.created_time);
        info.insert(keys::CREATED_TIME.to_string(), now());

        let mut backups = self.backups.write().map_err(poisoned)?;
        backups.insert(url.clone(), MockBackup { dest, info });
        Ok(url)
    }

    async fn delete_backup(&self, backup_url: &str) -> Result<()> {
        self.check("delete_backup")?;
        let target = BackupTarget::parse(backup_url)?;
        let mut backups = self.backups.write().map_err(poisoned)?;
        backups
            .remove(&target.to_url_string())
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("backup {}", backup_url)))
    }

    async fn get_backup_info(&self, backup_url: &str) -> Result<DriverInfo> {
        Ok(self.lookup_backup(backup_url)?.info)
    }

    async fn list_backups(
        &self,
        dest_url: &str,
        volume_name: Option<&str>,
    ) -> Result<BTreeMap<String, DriverInfo>> {
        let dest = self.own_dest(dest_url)?;
        let backups = self.backups.read().map_err(poisoned)?;
        Ok(backups
            .iter()
            .filter(|(_, b)| b.dest == dest)
            .filter(|(_, b)| {
                volume_name.map_or(true, |filter| {
                    b.info.get(keys::VOLUME_NAME).map(String::as_str) == Some(filter)
                        || b.info.get(keys::VOLUME_UUID).map(String::as_str) == Some(filter)
                })
            })
            .map(|(url, b)| (url.clone(), b.info.clone()))
            .collect())
    }
}
