//! NFS share driver.
//!
//! A volume is an existing NFS export named `server//export/path`; the
//! driver only mounts and unmounts it. Nothing is created or destroyed on
//! the server. Each mount gets a fresh directory under the driver root.
//!
//! ## Configuration
//! - `nfs.defaultmountoptions`: `-o` options added to every mount

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::mount::{MountableVolume, Mounter};
use super::traits::{BackupOperations, ConvoyDriver, SnapshotOperations, VolumeOperations};
use super::types::{keys, DriverConfig, DriverInfo, VolumeRequest, OPT_MOUNT_NAMESPACE};

/// Registered driver name.
pub const DRIVER_NAME: &str = "nfs";

/// Mount options added to every mount.
pub const OPT_DEFAULT_MOUNT_OPTIONS: &str = "nfs.defaultmountoptions";

/// A mounted NFS export.
#[derive(Debug, Clone)]
struct NfsVolume {
    name: String,
    mount_options: String,
    mount_point: Option<PathBuf>,
    mount_dir: PathBuf,
}

impl NfsVolume {
    /// `server//export` names the export `server:/export`.
    fn share(name: &str) -> String {
        match name.split_once("//") {
            Some((server, export)) => format!("{}:/{}", server, export),
            None => name.to_string(),
        }
    }
}

impl MountableVolume for NfsVolume {
    fn volume_id(&self) -> &str {
        &self.name
    }

    fn device(&self) -> Result<String> {
        if self.name.is_empty() {
            return Err(StorageError::InvalidArgument("NFS volume has no share name".to_string()));
        }
        Ok(Self::share(&self.name))
    }

    fn mount_options(&self) -> Vec<String> {
        let mut options = vec!["-t".to_string(), "nfs".to_string()];
        if !self.mount_options.is_empty() {
            options.push("-o".to_string());
            options.push(self.mount_options.clone());
        }
        options
    }

    fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    fn set_mount_point(&mut self, mount_point: Option<PathBuf>) {
        self.mount_point = mount_point;
    }

    fn default_mount_point(&self) -> PathBuf {
        self.mount_dir.clone()
    }
}

/// NFS driver; supports volume operations only.
pub struct NfsDriver {
    root: PathBuf,
    default_mount_options: String,
    mounter: Mounter,
    volumes: RwLock<HashMap<String, NfsVolume>>,
}

impl NfsDriver {
    /// Create the driver rooted at `root`.
    pub fn new(root: &Path, config: &DriverConfig) -> Result<Self> {
        crate::util::ensure_dir(root)?;
        let mounter = match config.get(OPT_MOUNT_NAMESPACE) {
            Some(ns) => Mounter::with_namespace(ns.as_str())?,
            None => Mounter::new(),
        };
        Ok(Self {
            root: root.to_path_buf(),
            default_mount_options: config
                .get(OPT_DEFAULT_MOUNT_OPTIONS)
                .cloned()
                .unwrap_or_default(),
            mounter,
            volumes: RwLock::new(HashMap::new()),
        })
    }

    fn volume_info(name: &str, volume: Option<&NfsVolume>) -> DriverInfo {
        let mut info = DriverInfo::new();
        info.insert(keys::VOLUME_NAME.to_string(), name.to_string());
        info.insert(keys::DEVICE.to_string(), NfsVolume::share(name));
        info.insert(
            keys::MOUNT_POINT.to_string(),
            volume
                .and_then(|v| v.mount_point.as_ref())
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        info
    }
}

impl ConvoyDriver for NfsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<DriverInfo> {
        let mut info = DriverInfo::new();
        info.insert("Root".to_string(), self.root.display().to_string());
        info.insert("DefaultMountOptions".to_string(), self.default_mount_options.clone());
        if let Some(ns) = self.mounter.namespace() {
            info.insert("MountNamespace".to_string(), ns.to_string());
        }
        Ok(info)
    }

    fn volume_ops(&self) -> Result<&dyn VolumeOperations> {
        Ok(self)
    }

    fn snapshot_ops(&self) -> Result<&dyn SnapshotOperations> {
        Err(StorageError::not_supported(DRIVER_NAME, "snapshot"))
    }

    fn backup_ops(&self) -> Result<&dyn BackupOperations> {
        Err(StorageError::not_supported(DRIVER_NAME, "backup"))
    }
}

#[async_trait]
impl VolumeOperations for NfsDriver {
    async fn create_volume(&self, request: &VolumeRequest) -> Result<()> {
        if request.backup_url.is_some() {
            return Err(StorageError::InvalidArgument(
                "nfs driver cannot restore backups".to_string(),
            ));
        }
        if request.name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "nfs volume needs the share as its name".to_string(),
            ));
        }
        Ok(())
    }

    async fn delete_volume(&self, request: &VolumeRequest) -> Result<()> {
        let volumes = self.volumes.read().await;
        if let Some(mount_point) = volumes.get(&request.name).and_then(|v| v.mount_point.as_ref()) {
            return Err(StorageError::Busy(format!(
                "cannot delete volume {}, it is still mounted at {}",
                request.name,
                mount_point.display()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(volume = %request.name))]
    async fn mount_volume(&self, request: &VolumeRequest) -> Result<PathBuf> {
        let mut volumes = self.volumes.write().await;
        if let Some(existing) = volumes.get_mut(&request.name) {
            return self.mounter.mount(existing, request.mount_point.as_deref());
        }

        let mount_dir = tempfile::Builder::new()
            .prefix("nfs-")
            .tempdir_in(&self.root)?
            .into_path();
        let mut volume = NfsVolume {
            name: request.name.clone(),
            mount_options: self.default_mount_options.clone(),
            mount_point: None,
            mount_dir,
        };

        match self.mounter.mount(&mut volume, request.mount_point.as_deref()) {
            Ok(mount_point) => {
                info!(mount_point = %mount_point.display(), "Mounted NFS share");
                volumes.insert(request.name.clone(), volume);
                Ok(mount_point)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir(&volume.mount_dir) {
                    warn!(error = %cleanup, "Cannot remove mount directory");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, request), fields(volume = %request.name))]
    async fn umount_volume(&self, request: &VolumeRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let Some(volume) = volumes.get_mut(&request.name) else {
            return Ok(());
        };

        self.mounter.umount(volume, &["-l"])?;
        volumes.remove(&request.name);
        Ok(())
    }

    async fn mount_point(&self, request: &VolumeRequest) -> Result<Option<PathBuf>> {
        let volumes = self.volumes.read().await;
        Ok(volumes.get(&request.name).and_then(|v| v.mount_point.clone()))
    }

    async fn get_volume_info(&self, request: &VolumeRequest) -> Result<DriverInfo> {
        let volumes = self.volumes.read().await;
        Ok(Self::volume_info(&request.name, volumes.get(&request.name)))
    }

    async fn list_volumes(&self) -> Result<BTreeMap<String, DriverInfo>> {
        let volumes = self.volumes.read().await;
        Ok(volumes
            .iter()
            .map(|(name, volume)| (name.clone(), Self::volume_info(name, Some(volume))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_name() {
        assert_eq!(NfsVolume::share("10.0.0.5//exports/data"), "10.0.0.5:/exports/data");
        assert_eq!(NfsVolume::share("server:/export"), "server:/export");
    }

    #[test]
    fn test_mount_options() {
        let volume = NfsVolume {
            name: "srv//x".to_string(),
            mount_options: "vers=4.1,soft".to_string(),
            mount_point: None,
            mount_dir: PathBuf::from("/tmp/nfs-x"),
        };
        assert_eq!(volume.mount_options(), vec!["-t", "nfs", "-o", "vers=4.1,soft"]);
    }

    #[tokio::test]
    async fn test_only_volume_capability() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NfsDriver::new(dir.path(), &DriverConfig::new()).unwrap();
        assert!(driver.volume_ops().is_ok());
        assert!(matches!(
            driver.snapshot_ops().err().unwrap(),
            StorageError::NotSupported { .. }
        ));
        assert!(matches!(
            driver.backup_ops().err().unwrap(),
            StorageError::NotSupported { .. }
        ));
    }

    #[tokio::test]
    async fn test_unmounted_share_info() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NfsDriver::new(dir.path(), &DriverConfig::new()).unwrap();
        let request = VolumeRequest::new("id", "srv//data");

        driver.create_volume(&request).await.unwrap();
        assert_eq!(driver.mount_point(&request).await.unwrap(), None);
        let info = driver.get_volume_info(&request).await.unwrap();
        assert_eq!(info[keys::DEVICE], "srv:/data");
        driver.umount_volume(&request).await.unwrap();
        driver.delete_volume(&request).await.unwrap();
    }
}
