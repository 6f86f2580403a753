//! Ceph RBD driver.
//!
//! A volume is an RBD image named after the volume (`pool/image` or just
//! `image`). The image is created and mapped lazily on mount, formatted if
//! it carries no filesystem, optionally opened through LUKS, then mounted
//! under `<root>/mounts/<name>`.
//!
//! ## Prerequisites
//! - `ceph-common` (provides the `rbd` CLI) with a working client keyring
//! - `cryptsetup` for encrypted volumes
//!
//! ## Configuration
//! - `ceph.defaultvolumesize` (default `10G`)
//! - `ceph.defaultencrypted` (default `false`)
//! - `ceph.defaultfilesystem` (default `ext4`)
//! - `ceph.defaultfilesystemoptions` (default empty)

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::fs::{self as devfs, CRYPTO_LUKS_FS_TYPE, SUPPORTED_FILESYSTEMS};
use crate::mount::{MountableVolume, Mounter};
use crate::util::{ensure_dir, execute, parse_size};
use super::traits::{BackupOperations, ConvoyDriver, SnapshotOperations, VolumeOperations};
use super::types::{keys, DriverConfig, DriverInfo, VolumeRequest, OPT_MOUNT_NAMESPACE};

/// Registered driver name.
pub const DRIVER_NAME: &str = "ceph";

pub const OPT_DEFAULT_VOLUME_SIZE: &str = "ceph.defaultvolumesize";
pub const OPT_DEFAULT_ENCRYPTED: &str = "ceph.defaultencrypted";
pub const OPT_DEFAULT_FILESYSTEM: &str = "ceph.defaultfilesystem";
pub const OPT_DEFAULT_FILESYSTEM_OPTIONS: &str = "ceph.defaultfilesystemoptions";

const DEFAULT_VOLUME_SIZE: &str = "10G";
const DEFAULT_FILESYSTEM: &str = "ext4";
const RBD_BINARY: &str = "rbd";
const CRYPTSETUP_BINARY: &str = "cryptsetup";
const LUKS_MAPPER_PATH: &str = "/dev/mapper";
const MOUNTS_DIRECTORY: &str = "mounts";
const KEYS_DIRECTORY: &str = "keys";
/// `rbd create` exits with EEXIST when the image is already there.
const EEXIST_STATUS: &str = "exit status: 17";

/// Driver-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Device {
    root: PathBuf,
    default_volume_size_mb: u64,
    default_encrypted: bool,
    default_fs_type: String,
    default_fs_options: String,
}

impl Device {
    fn from_config(root: &Path, config: &DriverConfig) -> Result<Self> {
        let get = |key: &str, default: &str| -> String {
            config
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let size = parse_size(&get(OPT_DEFAULT_VOLUME_SIZE, DEFAULT_VOLUME_SIZE))?;
        let encrypted = get(OPT_DEFAULT_ENCRYPTED, "false");
        let default_encrypted = encrypted.parse::<bool>().map_err(|_| {
            StorageError::InvalidConfig(format!("{} must be true or false, got {:?}", OPT_DEFAULT_ENCRYPTED, encrypted))
        })?;
        let default_fs_type = get(OPT_DEFAULT_FILESYSTEM, DEFAULT_FILESYSTEM);
        if !SUPPORTED_FILESYSTEMS.contains(&default_fs_type.as_str()) {
            return Err(StorageError::InvalidConfig(format!(
                "unsupported default filesystem {:?}",
                default_fs_type
            )));
        }

        Ok(Self {
            root: root.to_path_buf(),
            default_volume_size_mb: size >> 20,
            default_encrypted,
            default_fs_type,
            default_fs_options: get(OPT_DEFAULT_FILESYSTEM_OPTIONS, ""),
        })
    }
}

/// An RBD image and its local mapping.
#[derive(Debug, Clone)]
struct CephVolume {
    name: String,
    size_mb: u64,
    /// Mapped RBD device, e.g. `/dev/rbd0`.
    device: Option<String>,
    /// Opened LUKS device, e.g. `/dev/mapper/pool--image`.
    luks_device: Option<String>,
    mount_point: Option<PathBuf>,
    mount_prefix: PathBuf,
}

impl CephVolume {
    fn mapper_name(&self) -> String {
        self.name.replace('/', "--")
    }

    fn info(&self) -> DriverInfo {
        let mut info = DriverInfo::new();
        info.insert(keys::VOLUME_NAME.to_string(), self.name.clone());
        info.insert(
            keys::MOUNT_POINT.to_string(),
            self.mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        info.insert(keys::DEVICE.to_string(), self.device.clone().unwrap_or_default());
        info.insert("LuksDevice".to_string(), self.luks_device.clone().unwrap_or_default());
        info.insert(keys::SIZE.to_string(), (self.size_mb << 20).to_string());
        info
    }
}

impl MountableVolume for CephVolume {
    fn volume_id(&self) -> &str {
        &self.name
    }

    fn device(&self) -> Result<String> {
        self.luks_device
            .clone()
            .or_else(|| self.device.clone())
            .ok_or_else(|| StorageError::InvalidArgument(format!("ceph volume {} is not mapped", self.name)))
    }

    fn mount_options(&self) -> Vec<String> {
        Vec::new()
    }

    fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    fn set_mount_point(&mut self, mount_point: Option<PathBuf>) {
        self.mount_point = mount_point;
    }

    fn default_mount_point(&self) -> PathBuf {
        self.mount_prefix.join(MOUNTS_DIRECTORY).join(&self.name)
    }
}

/// Ceph RBD driver; supports volume operations only.
pub struct CephDriver {
    device: Device,
    mounter: Mounter,
    volumes: RwLock<HashMap<String, CephVolume>>,
}

impl CephDriver {
    /// Create the driver rooted at `root`.
    pub fn new(root: &Path, config: &DriverConfig) -> Result<Self> {
        ensure_dir(root)?;
        let device = Device::from_config(root, config)?;
        let mounter = match config.get(OPT_MOUNT_NAMESPACE) {
            Some(ns) => Mounter::with_namespace(ns.as_str())?,
            None => Mounter::new(),
        };
        info!(
            default_size_mb = device.default_volume_size_mb,
            default_fs = %device.default_fs_type,
            encrypted = device.default_encrypted,
            "Initialized ceph driver"
        );
        Ok(Self {
            device,
            mounter,
            volumes: RwLock::new(HashMap::new()),
        })
    }

    fn new_volume(&self, name: &str, size: u64) -> CephVolume {
        CephVolume {
            name: name.to_string(),
            size_mb: if size == 0 { self.device.default_volume_size_mb } else { size >> 20 },
            device: None,
            luks_device: None,
            mount_point: None,
            mount_prefix: self.device.root.clone(),
        }
    }

    /// Create the image if needed and map it.
    fn map(&self, volume: &mut CephVolume) -> Result<()> {
        let size = volume.size_mb.to_string();
        match execute(RBD_BINARY, &["create", &volume.name, "--size", &size]) {
            Ok(_) => info!(volume = %volume.name, size_mb = volume.size_mb, "Created RBD image"),
            Err(e) if image_exists(&e, &volume.name) => {
                debug!(volume = %volume.name, "RBD image already exists");
            }
            Err(e) => return Err(e),
        }

        let device = execute(RBD_BINARY, &["map", &volume.name])?.trim().to_string();
        info!(volume = %volume.name, device = %device, "Mapped RBD image");
        volume.device = Some(device);
        Ok(())
    }

    fn unmap(&self, volume: &mut CephVolume) -> Result<()> {
        if volume.luks_device.take().is_some() {
            execute(CRYPTSETUP_BINARY, &["luksClose", &volume.mapper_name()])?;
        }
        if let Some(device) = volume.device.take() {
            if let Err(e) = execute(RBD_BINARY, &["unmap", &device]) {
                volume.device = Some(device);
                return Err(e);
            }
            info!(volume = %volume.name, device = %device, "Unmapped RBD image");
        }
        Ok(())
    }

    /// Key material of an encrypted volume, generated on first use.
    fn luks_key(&self, volume: &CephVolume) -> Result<String> {
        let dir = self.device.root.join(KEYS_DIRECTORY);
        ensure_dir(&dir)?;
        let path = dir.join(format!("{}.key", volume.mapper_name()));
        if path.exists() {
            return Ok(std::fs::read_to_string(&path)?.trim().to_string());
        }

        let key = Uuid::new_v4().simple().to_string();
        std::fs::write(&path, &key)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        Ok(key)
    }

    fn cryptsetup(&self, args: &[&str], key: &str) -> Result<()> {
        debug!(command = CRYPTSETUP_BINARY, args = ?args, "Executing command");
        let failed = |reason: String| StorageError::CommandFailed {
            command: format!("{} {}", CRYPTSETUP_BINARY, args.join(" ")),
            reason,
        };

        let mut child = Command::new(CRYPTSETUP_BINARY)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(key.as_bytes())?;
        }
        let output = child.wait_with_output().map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(format!(
                "{} ({})",
                String::from_utf8_lossy(&output.stderr).trim_end(),
                output.status
            )));
        }
        Ok(())
    }

    /// Bring a mapped device to a mountable state.
    fn prepare(&self, volume: &mut CephVolume) -> Result<()> {
        let device = volume.device()?;
        let mut fs_type = detect(&device)?;

        if fs_type.as_deref() == Some(CRYPTO_LUKS_FS_TYPE)
            || (fs_type.is_none() && self.device.default_encrypted)
        {
            let key = self.luks_key(volume)?;
            if fs_type.is_none() {
                info!(volume = %volume.name, "Creating LUKS container");
                self.cryptsetup(&["luksFormat", "--batch-mode", "--key-file=-", &device], &key)?;
            }
            let mapper = volume.mapper_name();
            self.cryptsetup(&["luksOpen", "--allow-discards", "--key-file=-", &device, &mapper], &key)?;
            let luks_device = format!("{}/{}", LUKS_MAPPER_PATH, mapper);
            fs_type = detect(&luks_device)?;
            volume.luks_device = Some(luks_device);
        }

        let device = volume.device()?;
        match fs_type {
            None => {
                devfs::format_device(&device, &self.device.default_fs_type, &self.device.default_fs_options)?;
                debug!(device = %device, fs_type = %self.device.default_fs_type, "Formatted device");
            }
            Some(_) => {
                match devfs::resize(&device) {
                    Ok(()) => debug!(device = %device, "Resized device if necessary"),
                    Err(StorageError::InvalidArgument(reason)) => debug!(reason = %reason, "Skipping resize"),
                    Err(e) => return Err(e),
                }
                devfs::check(&device)?;
            }
        }
        Ok(())
    }

    /// Names of the images currently mapped on this host.
    fn mapped_images(&self) -> Result<Vec<String>> {
        let output = execute(RBD_BINARY, &["showmapped", "--format=json"])?;
        parse_showmapped(&output)
    }
}

fn detect(device: &str) -> Result<Option<String>> {
    match devfs::detect(device) {
        Ok(fs_type) => Ok(Some(fs_type)),
        Err(StorageError::NoFilesystem(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn image_exists(err: &StorageError, name: &str) -> bool {
    let image = name.rsplit('/').next().unwrap_or(name);
    match err {
        StorageError::CommandFailed { reason, .. } => {
            reason.contains(EEXIST_STATUS) || reason.contains(&format!("rbd image {} already exists", image))
        }
        _ => false,
    }
}

/// Parse `rbd showmapped --format=json`, which is an object keyed by device
/// id on older releases and an array on newer ones.
fn parse_showmapped(output: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(output.trim())?;
    let entries: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| entry.get("name").and_then(|n| n.as_str()))
        .map(str::to_string)
        .collect())
}

impl ConvoyDriver for CephDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<DriverInfo> {
        let mut info = DriverInfo::new();
        info.insert("Root".to_string(), self.device.root.display().to_string());
        info.insert("DefaultVolumeSize".to_string(), (self.device.default_volume_size_mb << 20).to_string());
        info.insert("DefaultEncrypted".to_string(), self.device.default_encrypted.to_string());
        info.insert("DefaultFileSystem".to_string(), self.device.default_fs_type.clone());
        info.insert("DefaultFileSystemOptions".to_string(), self.device.default_fs_options.clone());
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
impl VolumeOperations for CephDriver {
    async fn create_volume(&self, request: &VolumeRequest) -> Result<()> {
        if request.backup_url.is_some() {
            return Err(StorageError::InvalidArgument(
                "ceph driver cannot restore backups".to_string(),
            ));
        }
        let mut volumes = self.volumes.write().await;
        volumes
            .entry(request.name.clone())
            .or_insert_with(|| self.new_volume(&request.name, request.size));
        Ok(())
    }

    #[instrument(skip(self, request), fields(volume = %request.name))]
    async fn delete_volume(&self, request: &VolumeRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        if let Some(mount_point) = volumes.get(&request.name).and_then(|v| v.mount_point.as_ref()) {
            return Err(StorageError::Busy(format!(
                "cannot delete volume {}, it is still mounted at {}",
                request.name,
                mount_point.display()
            )));
        }

        if self.mapped_images()?.iter().any(|image| image == &request.name) {
            warn!("RBD image is still mapped, keeping its state");
            return Ok(());
        }
        volumes.remove(&request.name);
        Ok(())
    }

    #[instrument(skip(self, request), fields(volume = %request.name))]
    async fn mount_volume(&self, request: &VolumeRequest) -> Result<PathBuf> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .entry(request.name.clone())
            .or_insert_with(|| self.new_volume(&request.name, request.size));

        if volume.mount_point.is_some() {
            return self.mounter.mount(volume, request.mount_point.as_deref());
        }

        self.map(volume)?;
        let mounted = self
            .prepare(volume)
            .and_then(|()| self.mounter.mount(volume, request.mount_point.as_deref()));
        match mounted {
            Ok(mount_point) => {
                info!(mount_point = %mount_point.display(), "Mounted ceph volume");
                Ok(mount_point)
            }
            Err(e) => {
                if let Err(unmap) = self.unmap(volume) {
                    error!(error = %unmap, "Cannot unmap ceph volume after failed mount");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, request), fields(volume = %request.name))]
    async fn umount_volume(&self, request: &VolumeRequest) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes.get_mut(&request.name).ok_or_else(|| {
            StorageError::NotFound(format!("ceph volume {} in driver state", request.name))
        })?;

        self.mounter.umount(volume, &[])?;
        self.unmap(volume)
    }

    async fn mount_point(&self, request: &VolumeRequest) -> Result<Option<PathBuf>> {
        let volumes = self.volumes.read().await;
        Ok(volumes.get(&request.name).and_then(|v| v.mount_point.clone()))
    }

    async fn get_volume_info(&self, request: &VolumeRequest) -> Result<DriverInfo> {
        let volumes = self.volumes.read().await;
        volumes
            .get(&request.name)
            .map(CephVolume::info)
            .ok_or_else(|| StorageError::NotFound(format!("ceph volume {}", request.name)))
    }

    async fn list_volumes(&self) -> Result<BTreeMap<String, DriverInfo>> {
        let volumes = self.volumes.read().await;
        Ok(volumes
            .iter()
            .map(|(name, volume)| (name.clone(), volume.info()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> DriverConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let device = Device::from_config(Path::new("/var/lib/convoy/ceph"), &DriverConfig::new()).unwrap();
        assert_eq!(device.default_volume_size_mb, 10 * 1024);
        assert!(!device.default_encrypted);
        assert_eq!(device.default_fs_type, "ext4");
        assert_eq!(device.default_fs_options, "");
    }

    #[test]
    fn test_invalid_config() {
        let root = Path::new("/tmp");
        assert!(Device::from_config(root, &config(&[(OPT_DEFAULT_ENCRYPTED, "maybe")])).is_err());
        assert!(Device::from_config(root, &config(&[(OPT_DEFAULT_FILESYSTEM, "ntfs")])).is_err());
        assert!(Device::from_config(root, &config(&[(OPT_DEFAULT_VOLUME_SIZE, "g")])).is_err());

        let device = Device::from_config(
            root,
            &config(&[(OPT_DEFAULT_VOLUME_SIZE, "2g"), (OPT_DEFAULT_ENCRYPTED, "true")]),
        )
        .unwrap();
        assert_eq!(device.default_volume_size_mb, 2048);
        assert!(device.default_encrypted);
    }

    #[test]
    fn test_parse_showmapped() {
        let old = r#"{"0":{"pool":"rbd","name":"vol1","snap":"-","device":"/dev/rbd0"}}"#;
        assert_eq!(parse_showmapped(old).unwrap(), vec!["vol1"]);

        let new = r#"[{"id":"0","pool":"rbd","namespace":"","name":"vol2","snap":"-","device":"/dev/rbd0"}]"#;
        assert_eq!(parse_showmapped(new).unwrap(), vec!["vol2"]);

        assert!(parse_showmapped("{}").unwrap().is_empty());
        assert!(parse_showmapped("not json").is_err());
    }

    #[test]
    fn test_image_exists() {
        let exists = StorageError::CommandFailed {
            command: "rbd create rbd/vol1 --size 10240".to_string(),
            reason: "rbd: create error: (17) File exists (exit status: 17)".to_string(),
        };
        assert!(image_exists(&exists, "rbd/vol1"));

        let other = StorageError::CommandFailed {
            command: "rbd create vol1 --size 10240".to_string(),
            reason: "rbd: couldn't connect to the cluster! (exit status: 1)".to_string(),
        };
        assert!(!image_exists(&other, "vol1"));
    }

    #[tokio::test]
    async fn test_create_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = CephDriver::new(dir.path(), &DriverConfig::new()).unwrap();
        let request = VolumeRequest::new("id", "rbd/vol1").with_size(1 << 30);

        driver.create_volume(&request).await.unwrap();
        let info = driver.get_volume_info(&request).await.unwrap();
        assert_eq!(info[keys::SIZE], (1u64 << 30).to_string());
        assert_eq!(info[keys::DEVICE], "");
        assert_eq!(driver.mount_point(&request).await.unwrap(), None);
        assert!(driver.snapshot_ops().is_err());

        let volume = driver.new_volume("rbd/vol1", 0);
        assert_eq!(volume.mapper_name(), "rbd--vol1");
        assert_eq!(volume.default_mount_point(), dir.path().join("mounts/rbd/vol1"));
    }
}
