//! Backup object store.
//!
//! Single-file backups of driver snapshots, stored at a destination URL
//! under a fixed layout:
//!
//! ```text
//! convoy-objectstore/volumes/<volume-uuid>/volume.cfg
//! convoy-objectstore/volumes/<volume-uuid>/backups/backup_<snapshot-uuid>.cfg
//! convoy-objectstore/volumes/<volume-uuid>/blobs/<snapshot-uuid>.blk
//! ```
//!
//! Every object path is a function of the volume and snapshot UUIDs, so
//! creating the same backup twice overwrites the same objects.

mod codec;
mod types;
mod vfs;

pub use codec::{checksum, compress_file, decompress_file};
pub use types::*;
pub use vfs::VfsBackend;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::driver::{keys, DriverInfo};
use crate::error::{Result, StorageError};
use crate::util::now;

const OBJECTSTORE_BASE: &str = "convoy-objectstore";
const VOLUME_DIRECTORY: &str = "volumes";
const VOLUME_CONFIG_FILE: &str = "volume.cfg";
const BACKUP_DIRECTORY: &str = "backups";
const BACKUP_CONFIG_PREFIX: &str = "backup_";
const CONFIG_SUFFIX: &str = ".cfg";
const BLOB_DIRECTORY: &str = "blobs";
const BLOB_SUFFIX: &str = ".blk";

/// Storage primitive behind a destination URL scheme.
#[async_trait]
pub trait ObjectStoreBackend: Send + Sync {
    /// Scheme this backend serves.
    fn kind(&self) -> &str;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> bool;

    /// Read a small object.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Write a small object.
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Upload a local file.
    async fn upload(&self, src: &Path, key: &str) -> Result<()>;

    /// Download an object into a local file.
    async fn download(&self, key: &str, dst: &Path) -> Result<()>;

    /// Remove an object or a whole prefix; missing objects are ignored.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Names directly under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Opens the backend for a destination URL.
pub type BackendFactory = fn(&Url) -> Result<Box<dyn ObjectStoreBackend>>;

fn open_vfs(url: &Url) -> Result<Box<dyn ObjectStoreBackend>> {
    Ok(Box::new(VfsBackend::open(url)?))
}

fn volume_dir(volume_uuid: &str) -> String {
    format!("{}/{}/{}", OBJECTSTORE_BASE, VOLUME_DIRECTORY, volume_uuid)
}

fn volume_config_key(volume_uuid: &str) -> String {
    format!("{}/{}", volume_dir(volume_uuid), VOLUME_CONFIG_FILE)
}

fn backup_dir(volume_uuid: &str) -> String {
    format!("{}/{}", volume_dir(volume_uuid), BACKUP_DIRECTORY)
}

fn backup_config_key(volume_uuid: &str, backup_uuid: &str) -> String {
    format!(
        "{}/{}{}{}",
        backup_dir(volume_uuid),
        BACKUP_CONFIG_PREFIX,
        backup_uuid,
        CONFIG_SUFFIX
    )
}

fn blob_key(volume_uuid: &str, snapshot_uuid: &str) -> String {
    format!(
        "{}/{}/{}{}",
        volume_dir(volume_uuid),
        BLOB_DIRECTORY,
        snapshot_uuid,
        BLOB_SUFFIX
    )
}

/// Backup object store, dispatching to backends by URL scheme.
#[derive(Clone)]
pub struct ObjectStore {
    backends: HashMap<String, BackendFactory>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<&String> = self.backends.keys().collect();
        schemes.sort();
        f.debug_struct("ObjectStore").field("schemes", &schemes).finish()
    }
}

impl ObjectStore {
    /// Object store with the `vfs` backend registered.
    pub fn new() -> Self {
        let mut store = Self {
            backends: HashMap::new(),
        };
        store.register(vfs::SCHEME, open_vfs);
        store
    }

    /// Register a backend for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: &str, factory: BackendFactory) {
        self.backends.insert(scheme.to_string(), factory);
    }

    /// Whether `url` is addressed to a registered backend rather than to a
    /// driver.
    pub fn is_backend_url(&self, url: &str) -> bool {
        parse_url(url)
            .map(|u| self.backends.contains_key(u.scheme()))
            .unwrap_or(false)
    }

    fn open(&self, url: &Url) -> Result<Box<dyn ObjectStoreBackend>> {
        let factory = self
            .backends
            .get(url.scheme())
            .ok_or_else(|| StorageError::not_supported(url.scheme(), "object store"))?;
        factory(url)
    }

    async fn load_volume_record(
        backend: &dyn ObjectStoreBackend,
        volume_uuid: &str,
    ) -> Result<BackupVolume> {
        let data = backend.read(&volume_config_key(volume_uuid)).await.map_err(|e| {
            if e.is_not_found() {
                StorageError::NotFound(format!("backup volume {}", volume_uuid))
            } else {
                e
            }
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn load_backup_record(
        backend: &dyn ObjectStoreBackend,
        volume_uuid: &str,
        backup_uuid: &str,
    ) -> Result<Backup> {
        let data = backend
            .read(&backup_config_key(volume_uuid, backup_uuid))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    StorageError::NotFound(format!("backup {} of volume {}", backup_uuid, volume_uuid))
                } else {
                    e
                }
            })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Name of the driver that must handle `backup_url`.
    ///
    /// For an object-store URL the stored volume record decides; otherwise
    /// the URL scheme is the driver name.
    pub async fn driver_for_backup(&self, backup_url: &str) -> Result<String> {
        let url = parse_url(backup_url)?;
        if !self.backends.contains_key(url.scheme()) {
            return Ok(url.scheme().to_string());
        }
        Ok(self.load_volume(backup_url).await?.driver)
    }

    /// Upload `file` as the backup of `snapshot`; returns the backup URL.
    #[instrument(skip_all, fields(volume = %volume.uuid, snapshot = %snapshot.uuid, dest_url = %dest_url))]
    pub async fn create_single_file_backup(
        &self,
        volume: &BackupVolume,
        snapshot: &BackupSnapshot,
        file: &Path,
        dest_url: &str,
    ) -> Result<String> {
        let dest = parse_url(dest_url)?;
        let backend = self.open(&dest)?;

        let staging = tempfile::Builder::new().prefix("convoy-blob-").tempfile()?;
        let src = file.to_path_buf();
        let staged = staging.path().to_path_buf();
        let (checksum, size) = tokio::task::spawn_blocking(move || compress_file(&src, &staged))
            .await
            .map_err(|e| StorageError::Internal(format!("compression task failed: {}", e)))??;

        let blob = blob_key(&volume.uuid, &snapshot.uuid);
        debug!(blob = %blob, checksum = %checksum, size, "Uploading backup blob");
        backend.upload(staging.path(), &blob).await?;

        let backup = Backup {
            uuid: snapshot.uuid.clone(),
            volume_uuid: volume.uuid.clone(),
            snapshot_uuid: snapshot.uuid.clone(),
            snapshot_name: snapshot.name.clone(),
            snapshot_created_time: snapshot.created_time.clone(),
            created_time: now(),
            file: BackupFile {
                path: blob,
                checksum,
                size,
            },
        };
        backend
            .write(
                &backup_config_key(&volume.uuid, &backup.uuid),
                &serde_json::to_vec_pretty(&backup)?,
            )
            .await?;

        let mut record = volume.clone();
        record.last_backup = Some(backup.uuid.clone());
        backend
            .write(&volume_config_key(&volume.uuid), &serde_json::to_vec_pretty(&record)?)
            .await?;

        let url = encode_backup_url(&dest, &backup.uuid, &volume.uuid);
        info!(backup_url = %url, "Backup created");
        Ok(url)
    }

    /// Download and verify the backup at `backup_url` into `dst` on behalf
    /// of `driver`.
    #[instrument(skip_all, fields(backup_url = %backup_url, driver = %driver))]
    pub async fn restore_single_file_backup(&self, backup_url: &str, driver: &str, dst: &Path) -> Result<()> {
        let target = BackupTarget::parse(backup_url)?;
        let backend = self.open(&target.dest)?;

        let volume = Self::load_volume_record(backend.as_ref(), &target.volume_uuid).await?;
        if volume.driver != driver {
            return Err(StorageError::InvalidArgument(format!(
                "cannot restore backup of driver {} to driver {}",
                volume.driver, driver
            )));
        }
        let backup =
            Self::load_backup_record(backend.as_ref(), &target.volume_uuid, &target.backup_uuid).await?;

        let staging = tempfile::Builder::new().prefix("convoy-blob-").tempfile()?;
        backend.download(&backup.file.path, staging.path()).await?;

        let staged = staging.path().to_path_buf();
        let out = dst.to_path_buf();
        let expected = backup.file.checksum.clone();
        tokio::task::spawn_blocking(move || decompress_file(&staged, &out, &expected))
            .await
            .map_err(|e| StorageError::Internal(format!("decompression task failed: {}", e)))??;

        info!(dst = %dst.display(), "Backup restored");
        Ok(())
    }

    /// Remove the backup at `backup_url`, which must have been made by
    /// `driver`.
    ///
    /// The volume record goes with its last backup.
    #[instrument(skip_all, fields(backup_url = %backup_url, driver = %driver))]
    pub async fn delete_single_file_backup(&self, backup_url: &str, driver: &str) -> Result<()> {
        let target = BackupTarget::parse(backup_url)?;
        let backend = self.open(&target.dest)?;

        let volume = Self::load_volume_record(backend.as_ref(), &target.volume_uuid).await?;
        if volume.driver != driver {
            return Err(StorageError::InvalidArgument(format!(
                "backup {} belongs to driver {}, not {}",
                backup_url, volume.driver, driver
            )));
        }
        let backup =
            Self::load_backup_record(backend.as_ref(), &target.volume_uuid, &target.backup_uuid).await?;

        backend.remove(&backup.file.path).await?;
        backend
            .remove(&backup_config_key(&target.volume_uuid, &target.backup_uuid))
            .await?;

        if backend.list(&backup_dir(&target.volume_uuid)).await?.is_empty() {
            debug!(volume = %target.volume_uuid, "Last backup removed, removing volume record");
            backend.remove(&volume_dir(&target.volume_uuid)).await?;
        }

        info!("Backup deleted");
        Ok(())
    }

    /// Stored volume record of `backup_url`.
    pub async fn load_volume(&self, backup_url: &str) -> Result<BackupVolume> {
        let target = BackupTarget::parse(backup_url)?;
        let backend = self.open(&target.dest)?;
        Self::load_volume_record(backend.as_ref(), &target.volume_uuid).await
    }

    /// Flat description of the backup at `backup_url`.
    pub async fn get_backup_info(&self, backup_url: &str) -> Result<DriverInfo> {
        let target = BackupTarget::parse(backup_url)?;
        let backend = self.open(&target.dest)?;

        let volume = Self::load_volume_record(backend.as_ref(), &target.volume_uuid).await?;
        let backup =
            Self::load_backup_record(backend.as_ref(), &target.volume_uuid, &target.backup_uuid).await?;
        Ok(backup_info(&target.to_url_string(), &volume, &backup))
    }

    /// Backups under `dest_url` made by `driver`, keyed by backup URL.
    ///
    /// `volume_filter` matches the recorded volume name or UUID.
    #[instrument(skip_all, fields(dest_url = %dest_url, driver = %driver))]
    pub async fn list(
        &self,
        dest_url: &str,
        volume_filter: Option<&str>,
        driver: &str,
    ) -> Result<BTreeMap<String, DriverInfo>> {
        let mut dest = parse_url(dest_url)?;
        dest.set_query(None);
        dest.set_fragment(None);
        let backend = self.open(&dest)?;

        let mut result = BTreeMap::new();
        let volume_root = format!("{}/{}", OBJECTSTORE_BASE, VOLUME_DIRECTORY);
        for volume_uuid in backend.list(&volume_root).await? {
            let volume = match Self::load_volume_record(backend.as_ref(), &volume_uuid).await {
                Ok(volume) => volume,
                Err(e) => {
                    warn!(volume = %volume_uuid, error = %e, "Skipping unreadable backup volume");
                    continue;
                }
            };
            if volume.driver != driver {
                continue;
            }
            if let Some(filter) = volume_filter {
                if volume.name != filter && volume.uuid != filter {
                    continue;
                }
            }

            for name in backend.list(&backup_dir(&volume_uuid)).await? {
                let Some(backup_uuid) = name
                    .strip_prefix(BACKUP_CONFIG_PREFIX)
                    .and_then(|rest| rest.strip_suffix(CONFIG_SUFFIX))
                else {
                    continue;
                };
                let backup = Self::load_backup_record(backend.as_ref(), &volume_uuid, backup_uuid).await?;
                let url = encode_backup_url(&dest, &backup.uuid, &volume.uuid);
                let info = backup_info(&url, &volume, &backup);
                result.insert(url, info);
            }
        }
        Ok(result)
    }
}

fn backup_info(url: &str, volume: &BackupVolume, backup: &Backup) -> DriverInfo {
    let mut info = DriverInfo::new();
    info.insert(keys::BACKUP_URL.to_string(), url.to_string());
    info.insert(keys::DRIVER_NAME.to_string(), volume.driver.clone());
    info.insert(keys::VOLUME_UUID.to_string(), volume.uuid.clone());
    info.insert(keys::VOLUME_NAME.to_string(), volume.name.clone());
    info.insert(keys::VOLUME_SIZE.to_string(), volume.size.to_string());
    info.insert(keys::VOLUME_CREATED_TIME.to_string(), volume.created_time.clone());
    info.insert(keys::VOLUME_FILE_SYSTEM.to_string(), volume.file_system.clone());
    info.insert(keys::SNAPSHOT_UUID.to_string(), backup.snapshot_uuid.clone());
    info.insert(keys::SNAPSHOT_NAME.to_string(), backup.snapshot_name.clone());
    info.insert(keys::SNAPSHOT_CREATED_TIME.to_string(), backup.snapshot_created_time.clone());
    info.insert(keys::CREATED_TIME.to_string(), backup.created_time.clone());
    info.insert(keys::SIZE.to_string(), backup.file.size.to_string());
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn volume(driver: &str) -> BackupVolume {
        BackupVolume {
            uuid: Uuid::new_v4().to_string(),
            name: "vol1".to_string(),
            driver: driver.to_string(),
            file_system: String::new(),
            size: 1024,
            created_time: now(),
            last_backup: None,
        }
    }

    fn snapshot(name: &str) -> BackupSnapshot {
        BackupSnapshot {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_time: now(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        dest: String,
        file: std::path::PathBuf,
        store: ObjectStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        std::fs::create_dir(&store_dir).unwrap();
        let file = dir.path().join("snapshot.tar.gz");
        std::fs::write(&file, b"snapshot bytes").unwrap();
        Fixture {
            dest: format!("vfs://{}/", store_dir.display()),
            file,
            store: ObjectStore::new(),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_backup_lifecycle() {
        let f = fixture();
        let vol = volume("vfs");
        let snap = snapshot("snap1");

        let url = f
            .store
            .create_single_file_backup(&vol, &snap, &f.file, &f.dest)
            .await
            .unwrap();
        assert!(url.starts_with("vfs://"));
        assert!(url.contains(&vol.uuid));
        assert!(url.contains(&snap.uuid));

        assert_eq!(f.store.driver_for_backup(&url).await.unwrap(), "vfs");

        let info = f.store.get_backup_info(&url).await.unwrap();
        assert_eq!(info[keys::VOLUME_UUID], vol.uuid);
        assert_eq!(info[keys::SNAPSHOT_UUID], snap.uuid);
        assert_eq!(info[keys::SNAPSHOT_NAME], "snap1");
        assert_eq!(info[keys::DRIVER_NAME], "vfs");

        let listed = f.store.list(&f.dest, None, "vfs").await.unwrap();
        assert_eq!(listed.keys().collect::<Vec<_>>(), vec![&url]);
        assert!(f.store.list(&f.dest, Some("vol1"), "vfs").await.unwrap().contains_key(&url));
        assert!(f.store.list(&f.dest, Some(&vol.uuid), "vfs").await.unwrap().contains_key(&url));
        assert!(f.store.list(&f.dest, Some("other"), "vfs").await.unwrap().is_empty());
        assert!(f.store.list(&f.dest, None, "ceph").await.unwrap().is_empty());

        f.store.delete_single_file_backup(&url, "vfs").await.unwrap();
        assert!(f.store.get_backup_info(&url).await.unwrap_err().is_not_found());
        assert!(f.store.load_volume(&url).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_restore_verifies_driver_and_content() {
        let f = fixture();
        let vol = volume("vfs");
        let snap = snapshot("snap1");
        let url = f
            .store
            .create_single_file_backup(&vol, &snap, &f.file, &f.dest)
            .await
            .unwrap();

        let out = f.file.with_file_name("restored");
        let err = f
            .store
            .restore_single_file_backup(&url, "ceph", &out)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: cannot restore backup of driver vfs to driver ceph"
        );
        assert!(!out.exists());

        f.store.restore_single_file_backup(&url, "vfs", &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"snapshot bytes");
    }

    #[tokio::test]
    async fn test_volume_record_outlives_other_backups() {
        let f = fixture();
        let vol = volume("vfs");
        let first = f
            .store
            .create_single_file_backup(&vol, &snapshot("a1"), &f.file, &f.dest)
            .await
            .unwrap();
        let second = f
            .store
            .create_single_file_backup(&vol, &snapshot("b1"), &f.file, &f.dest)
            .await
            .unwrap();

        let err = f.store.delete_single_file_backup(&first, "nfs").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        f.store.delete_single_file_backup(&first, "vfs").await.unwrap();
        assert_eq!(f.store.load_volume(&second).await.unwrap().uuid, vol.uuid);
        assert!(f.store.get_backup_info(&second).await.is_ok());
    }

    #[tokio::test]
    async fn test_driver_for_non_objectstore_scheme() {
        let store = ObjectStore::new();
        let url = format!(
            "mock:///somewhere?backup={}&volume={}",
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        assert!(!store.is_backend_url(&url));
        assert_eq!(store.driver_for_backup(&url).await.unwrap(), "mock");

        let err = store.list("s3://bucket/", None, "vfs").await.unwrap_err();
        assert!(matches!(err, StorageError::NotSupported { .. }));
    }
}
