//! Local directory driver.
//!
//! Each volume is a directory under `vfs.path`. Snapshots are gzipped tar
//! archives of the volume directory kept under the driver root, which makes
//! them directly usable as single-file backups.
//!
//! ## Configuration
//! - `vfs.path` (required on first start): directory holding the volumes
//! - `vfs.defaultvolumesize` (default `100G`): size recorded for volumes
//!   created without an explicit size
//!
//! The effective configuration is persisted in `<root>/vfs.cfg` and wins
//! over the passed configuration on later starts.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::objectstore::{BackupSnapshot, BackupVolume, ObjectStore};
use crate::util::{ensure_dir, execute, list_config_ids, load_json, now, parse_size, remove_if_exists, save_json};
use super::traits::{BackupOperations, ConvoyDriver, SnapshotOperations, VolumeOperations};
use super::types::{keys, BackupRequest, DriverConfig, DriverInfo, SnapshotRequest, VolumeRequest};

/// Registered driver name.
pub const DRIVER_NAME: &str = "vfs";

/// Directory holding the volumes.
pub const OPT_PATH: &str = "vfs.path";
/// Size recorded for volumes created without one.
pub const OPT_DEFAULT_VOLUME_SIZE: &str = "vfs.defaultvolumesize";

const DEFAULT_VOLUME_SIZE: &str = "100G";
const CONFIG_FILE: &str = "vfs.cfg";
const VOLUME_CONFIG_PREFIX: &str = "vfs_volume_";
const CONFIG_SUFFIX: &str = ".json";
const SNAPSHOT_DIRECTORY: &str = "snapshots";
const TAR_BINARY: &str = "tar";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Device {
    root: PathBuf,
    path: PathBuf,
    default_volume_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VfsSnapshot {
    uuid: String,
    volume_uuid: String,
    #[serde(default)]
    name: String,
    file_path: PathBuf,
    created_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VfsVolume {
    uuid: String,
    name: String,
    size: u64,
    path: PathBuf,
    mount_point: Option<PathBuf>,
    created_time: String,
    #[serde(default)]
    snapshots: BTreeMap<String, VfsSnapshot>,
}

/// Local directory driver supporting volume, snapshot and backup operations.
pub struct VfsDriver {
    device: Device,
    volumes: RwLock<HashMap<String, VfsVolume>>,
    objectstore: ObjectStore,
}

impl VfsDriver {
    /// Load the driver state under `root`, initializing it from `config`
    /// on first start.
    pub fn new(root: &Path, config: &DriverConfig) -> Result<Self> {
        ensure_dir(root)?;
        let config_path = root.join(CONFIG_FILE);

        let device = if config_path.exists() {
            let device: Device = load_json(&config_path)?;
            debug!(path = %device.path.display(), "Loaded vfs configuration");
            device
        } else {
            let path = config
                .get(OPT_PATH)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    StorageError::InvalidConfig(format!("vfs driver base path unspecified, set {}", OPT_PATH))
                })?;
            let size = config
                .get(OPT_DEFAULT_VOLUME_SIZE)
                .map(String::as_str)
                .unwrap_or(DEFAULT_VOLUME_SIZE);
            let default_volume_size = parse_size(size)?;
            if default_volume_size == 0 {
                return Err(StorageError::InvalidConfig(format!(
                    "illegal default volume size {:?}",
                    size
                )));
            }

            let device = Device {
                root: root.to_path_buf(),
                path: PathBuf::from(path),
                default_volume_size,
            };
            ensure_dir(&device.path)?;
            save_json(&config_path, &device)?;
            info!(path = %device.path.display(), "Initialized vfs driver");
            device
        };

        let mut volumes = HashMap::new();
        for id in list_config_ids(root, VOLUME_CONFIG_PREFIX, CONFIG_SUFFIX)? {
            let volume: VfsVolume = load_json(&volume_config_path(root, &id))?;
            volumes.insert(id, volume);
        }

        Ok(Self {
            device,
            volumes: RwLock::new(volumes),
            objectstore: ObjectStore::new(),
        })
    }

    fn snapshot_path(&self, volume_uuid: &str, snapshot_uuid: &str) -> PathBuf {
        self.device
            .root
            .join(SNAPSHOT_DIRECTORY)
            .join(format!("{}_{}.tar.gz", volume_uuid, snapshot_uuid))
    }

    fn save_volume(&self, volume: &VfsVolume) -> Result<()> {
        save_json(&volume_config_path(&self.device.root, &volume.uuid), volume)
    }

    fn volume_info(volume: &VfsVolume) -> DriverInfo {
        let mut info = DriverInfo::new();
        info.insert(keys::PATH.to_string(), volume.path.display().to_string());
        info.insert(
            keys::MOUNT_POINT.to_string(),
            volume
                .mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        info.insert(keys::SIZE.to_string(), volume.size.to_string());
        info.insert(keys::VOLUME_NAME.to_string(), volume.name.clone());
        info.insert(keys::VOLUME_CREATED_TIME.to_string(), volume.created_time.clone());
        info
    }

    fn snapshot_info(snapshot: &VfsSnapshot) -> DriverInfo {
        let mut info = DriverInfo::new();
        info.insert("UUID".to_string(), snapshot.uuid.clone());
        info.insert(keys::VOLUME_UUID.to_string(), snapshot.volume_uuid.clone());
        info.insert(keys::SNAPSHOT_NAME.to_string(), snapshot.name.clone());
        info.insert(keys::SNAPSHOT_FILE_PATH.to_string(), snapshot.file_path.display().to_string());
        info.insert(keys::SNAPSHOT_CREATED_TIME.to_string(), snapshot.created_time.clone());
        info
    }

    /// Restore `backup_url` into the fresh volume directory `path`.
    async fn restore(&self, backup_url: &str, path: &Path) -> Result<()> {
        let archive = tempfile::Builder::new()
            .prefix("convoy-restore-")
            .suffix(".tar.gz")
            .tempfile()?;
        self.objectstore
            .restore_single_file_backup(backup_url, DRIVER_NAME, archive.path())
            .await?;

        let archive_path = archive.path().to_string_lossy().to_string();
        let target = path.to_string_lossy().to_string();
        execute(TAR_BINARY, &["xzf", &archive_path, "-C", &target])?;
        Ok(())
    }
}

fn volume_config_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("{}{}{}", VOLUME_CONFIG_PREFIX, id, CONFIG_SUFFIX))
}

impl ConvoyDriver for VfsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<DriverInfo> {
        let mut info = DriverInfo::new();
        info.insert("Root".to_string(), self.device.root.display().to_string());
        info.insert(keys::PATH.to_string(), self.device.path.display().to_string());
        info.insert("DefaultVolumeSize".to_string(), self.device.default_volume_size.to_string());
        Ok(info)
    }

    fn volume_ops(&self) -> Result<&dyn VolumeOperations> {
        Ok(self)
    }

    fn snapshot_ops(&self) -> Result<&dyn SnapshotOperations> {
        Ok(self)
    }

    fn backup_ops(&self) -> Result<&dyn BackupOperations> {
        Ok(self)
    }
}

#[async_trait]
impl VolumeOperations for VfsDriver {
    #[instrument(skip(self, request), fields(volume = %request.id))]
    async fn create_volume(&self, request: &VolumeRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        if volumes.contains_key(&request.id) {
            return Err(StorageError::AlreadyExists(format!("volume {}", request.id)));
        }

        let dir_name = if request.name.is_empty() { &request.id } else { &request.name };
        let path = self.device.path.join(dir_name);
        // Volume directories are never shared or adopted.
        if path.exists() {
            return Err(StorageError::AlreadyExists(format!(
                "volume directory {}",
                path.display()
            )));
        }
        fs::create_dir_all(&path)?;

        if let Some(backup_url) = &request.backup_url {
            if let Err(e) = self.restore(backup_url, &path).await {
                if let Err(cleanup) = fs::remove_dir_all(&path) {
                    warn!(error = %cleanup, path = %path.display(), "Cannot clean up volume directory");
                }
                return Err(e);
            }
        }

        let volume = VfsVolume {
            uuid: request.id.clone(),
            name: request.name.clone(),
            size: if request.size == 0 { self.device.default_volume_size } else { request.size },
            path,
            mount_point: None,
            created_time: now(),
            snapshots: BTreeMap::new(),
        };
        self.save_volume(&volume)?;
        info!(path = %volume.path.display(), "Created vfs volume");
        volumes.insert(volume.uuid.clone(), volume);
        Ok(())
    }

    #[instrument(skip(self, request), fields(volume = %request.id))]
    async fn delete_volume(&self, request: &VolumeRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get(&request.id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))?;

        if let Some(mount_point) = &volume.mount_point {
            return Err(StorageError::Busy(format!(
                "cannot delete volume {}, it is still mounted at {}",
                request.id,
                mount_point.display()
            )));
        }

        if request.reference_only {
            info!("Forgetting vfs volume, data left in place");
        } else if volume.path.exists() {
            fs::remove_dir_all(&volume.path)?;
        }
        for snapshot in volume.snapshots.values() {
            remove_if_exists(&snapshot.file_path)?;
        }

        remove_if_exists(&volume_config_path(&self.device.root, &request.id))?;
        volumes.remove(&request.id);
        Ok(())
    }

    async fn mount_volume(&self, request: &VolumeRequest) -> Result<PathBuf> {
        if request.mount_point.is_some() {
            return Err(StorageError::InvalidArgument(
                "vfs driver does not support a specified mount point".to_string(),
            ));
        }

        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))?;

        volume.mount_point = Some(volume.path.clone());
        let mount_point = volume.path.clone();
        let record = volume.clone();
        self.save_volume(&record)?;
        Ok(mount_point)
    }

    async fn umount_volume(&self, request: &VolumeRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))?;

        if volume.mount_point.take().is_some() {
            let record = volume.clone();
            self.save_volume(&record)?;
        }
        Ok(())
    }

    async fn mount_point(&self, request: &VolumeRequest) -> Result<Option<PathBuf>> {
        let volumes = self.volumes.read().await;
        volumes
            .get(&request.id)
            .map(|v| v.mount_point.clone())
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))
    }

    async fn get_volume_info(&self, request: &VolumeRequest) -> Result<DriverInfo> {
        let volumes = self.volumes.read().await;
        volumes
            .get(&request.id)
            .map(Self::volume_info)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.id)))
    }

    async fn list_volumes(&self) -> Result<BTreeMap<String, DriverInfo>> {
        let volumes = self.volumes.read().await;
        Ok(volumes
            .iter()
            .map(|(id, volume)| (id.clone(), Self::volume_info(volume)))
            .collect())
    }
}

#[async_trait]
impl SnapshotOperations for VfsDriver {
    #[instrument(skip(self, request), fields(volume = %request.volume_id, snapshot = %request.id))]
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.volume_id)))?;
        if volume.snapshots.contains_key(&request.id) {
            return Err(StorageError::AlreadyExists(format!(
                "snapshot {} of volume {}",
                request.id, request.volume_id
            )));
        }

        let file_path = self.snapshot_path(&request.volume_id, &request.id);
        if let Some(parent) = file_path.parent() {
            ensure_dir(parent)?;
        }
        let archive = file_path.to_string_lossy().to_string();
        let source = volume.path.to_string_lossy().to_string();
        execute(TAR_BINARY, &["czf", &archive, "-C", &source, "."])?;

        volume.snapshots.insert(
            request.id.clone(),
            VfsSnapshot {
                uuid: request.id.clone(),
                volume_uuid: request.volume_id.clone(),
                name: request.name.clone().unwrap_or_default(),
                file_path,
                created_time: now(),
            },
        );
        let record = volume.clone();
        self.save_volume(&record)?;
        debug!(archive = %archive, "Created vfs snapshot");
        Ok(())
    }

    #[instrument(skip(self, request), fields(volume = %request.volume_id, snapshot = %request.id))]
    async fn delete_snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.volume_id)))?;
        let snapshot = volume.snapshots.remove(&request.id).ok_or_else(|| {
            StorageError::NotFound(format!("snapshot {} of volume {}", request.id, request.volume_id))
        })?;

        remove_if_exists(&snapshot.file_path)?;
        let record = volume.clone();
        self.save_volume(&record)?;
        Ok(())
    }

    async fn get_snapshot_info(&self, request: &SnapshotRequest) -> Result<DriverInfo> {
        let volumes = self.volumes.read().await;
        volumes
            .get(&request.volume_id)
            .and_then(|v| v.snapshots.get(&request.id))
            .map(Self::snapshot_info)
            .ok_or_else(|| {
                StorageError::NotFound(format!("snapshot {} of volume {}", request.id, request.volume_id))
            })
    }

    async fn list_snapshots(&self, volume_id: Option<&str>) -> Result<BTreeMap<String, DriverInfo>> {
        let volumes = self.volumes.read().await;
        let mut result = BTreeMap::new();
        for volume in volumes.values() {
            if volume_id.is_some_and(|id| id != volume.uuid) {
                continue;
            }
            for (id, snapshot) in &volume.snapshots {
                result.insert(id.clone(), Self::snapshot_info(snapshot));
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl BackupOperations for VfsDriver {
    #[instrument(skip(self, request), fields(volume = %request.volume_id, snapshot = %request.snapshot_id, dest_url = %request.dest_url))]
    async fn create_backup(&self, request: &BackupRequest) -> Result<String> {
        let (volume, snapshot, file_path) = {
            let volumes = self.volumes.read().await;
            let volume = volumes
                .get(&request.volume_id)
                .ok_or_else(|| StorageError::NotFound(format!("volume {}", request.volume_id)))?;
            let snapshot = volume.snapshots.get(&request.snapshot_id).ok_or_else(|| {
                StorageError::NotFound(format!(
                    "snapshot {} of volume {}",
                    request.snapshot_id, request.volume_id
                ))
            })?;

            let backup_volume = BackupVolume {
                uuid: volume.uuid.clone(),
                name: request.volume_name.clone(),
                driver: DRIVER_NAME.to_string(),
                file_system: request.file_system.clone(),
                size: volume.size,
                created_time: request.volume_created_time.clone(),
                last_backup: None,
            };
            let backup_snapshot = BackupSnapshot {
                uuid: snapshot.uuid.clone(),
                name: request.snapshot_name.clone(),
                created_time: request.snapshot_created_time.clone(),
            };
            (backup_volume, backup_snapshot, snapshot.file_path.clone())
        };

        self.objectstore
            .create_single_file_backup(&volume, &snapshot, &file_path, &request.dest_url)
            .await
    }

    async fn delete_backup(&self, backup_url: &str) -> Result<()> {
        self.objectstore
            .delete_single_file_backup(backup_url, DRIVER_NAME)
            .await
    }

    async fn get_backup_info(&self, backup_url: &str) -> Result<DriverInfo> {
        let volume = self.objectstore.load_volume(backup_url).await?;
        if volume.driver != DRIVER_NAME {
            return Err(StorageError::Internal(format!(
                "backup {} of driver {} routed to {}",
                backup_url, volume.driver, DRIVER_NAME
            )));
        }
        self.objectstore.get_backup_info(backup_url).await
    }

    async fn list_backups(
        &self,
        dest_url: &str,
        volume_name: Option<&str>,
    ) -> Result<BTreeMap<String, DriverInfo>> {
        self.objectstore.list(dest_url, volume_name, DRIVER_NAME).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn driver(dir: &Path) -> VfsDriver {
        let mut config = DriverConfig::new();
        config.insert(OPT_PATH.to_string(), dir.join("volumes").display().to_string());
        VfsDriver::new(&dir.join("vfs"), &config).unwrap()
    }

    fn volume_request(name: &str) -> VolumeRequest {
        VolumeRequest::new(Uuid::new_v4().to_string(), name)
    }

    #[test]
    fn test_requires_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = VfsDriver::new(dir.path(), &DriverConfig::new()).err().unwrap();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_zero_default_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DriverConfig::new();
        config.insert(OPT_PATH.to_string(), dir.path().join("volumes").display().to_string());
        config.insert(OPT_DEFAULT_VOLUME_SIZE.to_string(), "0".to_string());
        assert!(VfsDriver::new(&dir.path().join("vfs"), &config).is_err());
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let request = volume_request("vol1");

        driver.create_volume(&request).await.unwrap();
        assert!(dir.path().join("volumes/vol1").is_dir());
        let info = driver.get_volume_info(&request).await.unwrap();
        assert_eq!(info[keys::SIZE], (100u64 << 30).to_string());
        assert!(matches!(
            driver.create_volume(&request).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));

        let mount_point = driver.mount_volume(&request).await.unwrap();
        assert_eq!(mount_point, dir.path().join("volumes/vol1"));
        assert_eq!(driver.mount_point(&request).await.unwrap(), Some(mount_point));
        assert!(matches!(
            driver.delete_volume(&request).await.unwrap_err(),
            StorageError::Busy(_)
        ));

        let with_target = request.clone().with_mount_point("/mnt/x");
        assert!(driver.mount_volume(&with_target).await.is_err());

        driver.umount_volume(&request).await.unwrap();
        assert_eq!(driver.mount_point(&request).await.unwrap(), None);
        driver.delete_volume(&request).await.unwrap();
        assert!(!dir.path().join("volumes/vol1").exists());
        assert!(driver.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_existing_volume_directory() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());

        let first = volume_request("volume-11111111");
        driver.create_volume(&first).await.unwrap();
        std::fs::write(dir.path().join("volumes/volume-11111111/precious.txt"), b"keep").unwrap();

        // A different volume resolving to the same directory.
        let second = volume_request("volume-11111111");
        assert!(matches!(
            driver.create_volume(&second).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));
        assert!(driver.get_volume_info(&second).await.unwrap_err().is_not_found());
        assert_eq!(
            std::fs::read(dir.path().join("volumes/volume-11111111/precious.txt")).unwrap(),
            b"keep"
        );

        // A directory left behind outside the driver is not adopted either.
        std::fs::create_dir_all(dir.path().join("volumes/stray")).unwrap();
        std::fs::write(dir.path().join("volumes/stray/data.txt"), b"stray").unwrap();
        let stray = volume_request("stray");
        assert!(driver.create_volume(&stray).await.is_err());
        assert!(dir.path().join("volumes/stray/data.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_restore_removes_only_its_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();
        let driver = driver(dir.path());
        let missing = format!(
            "vfs://{}/?backup={}&volume={}",
            store.display(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );

        let fresh = volume_request("fresh").with_backup_url(missing.clone());
        assert!(driver.create_volume(&fresh).await.is_err());
        assert!(!dir.path().join("volumes/fresh").exists());

        std::fs::create_dir_all(dir.path().join("volumes/taken")).unwrap();
        std::fs::write(dir.path().join("volumes/taken/data.txt"), b"mine").unwrap();
        let taken = volume_request("taken").with_backup_url(missing);
        assert!(matches!(
            driver.create_volume(&taken).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));
        assert!(dir.path().join("volumes/taken/data.txt").exists());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let request = volume_request("vol1");
        {
            let driver = driver(dir.path());
            driver.create_volume(&request.clone().with_size(4096)).await.unwrap();
        }

        // The persisted configuration is used even without vfs.path.
        let driver = VfsDriver::new(&dir.path().join("vfs"), &DriverConfig::new()).unwrap();
        let volumes = driver.list_volumes().await.unwrap();
        assert_eq!(volumes[&request.id][keys::SIZE], "4096");
    }

    #[tokio::test]
    async fn test_snapshot_backup_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();
        let driver = driver(dir.path());

        let source = volume_request("vol1");
        driver.create_volume(&source).await.unwrap();
        std::fs::write(dir.path().join("volumes/vol1/data.txt"), b"hello").unwrap();

        let mut snapshot = SnapshotRequest::new(Uuid::new_v4().to_string(), source.id.clone());
        snapshot.name = Some("snap1".to_string());
        driver.create_snapshot(&snapshot).await.unwrap();
        let info = driver.get_snapshot_info(&snapshot).await.unwrap();
        assert_eq!(info[keys::SNAPSHOT_NAME], "snap1");
        assert!(Path::new(&info[keys::SNAPSHOT_FILE_PATH]).exists());

        let dest = format!("vfs://{}/", store.display());
        let url = driver
            .create_backup(&BackupRequest {
                snapshot_id: snapshot.id.clone(),
                volume_id: source.id.clone(),
                dest_url: dest.clone(),
                volume_name: "vol1".to_string(),
                snapshot_name: "snap1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(driver.list_backups(&dest, Some("vol1")).await.unwrap().len(), 1);
        assert_eq!(driver.get_backup_info(&url).await.unwrap()[keys::SNAPSHOT_UUID], snapshot.id);

        let restored = volume_request("vol2").with_backup_url(url.clone());
        driver.create_volume(&restored).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("volumes/vol2/data.txt")).unwrap(),
            b"hello"
        );

        driver.delete_backup(&url).await.unwrap();
        assert!(driver.get_backup_info(&url).await.unwrap_err().is_not_found());

        driver.delete_snapshot(&snapshot).await.unwrap();
        assert!(driver.get_snapshot_info(&snapshot).await.unwrap_err().is_not_found());
    }
}
