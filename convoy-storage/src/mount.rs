//! Mounting of driver volumes.
//!
//! Every driver volume type that can be mounted implements
//! [`MountableVolume`]; [`Mounter`] then performs the mount/umount dance
//! generically, optionally inside another mount namespace via `nsenter`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::util::{ensure_dir, execute};

const MOUNT_BINARY: &str = "mount";
const UMOUNT_BINARY: &str = "umount";
const NSENTER_BINARY: &str = "nsenter";

/// Accessors a driver volume exposes so it can be mounted.
pub trait MountableVolume {
    /// Identity used in log and error messages.
    fn volume_id(&self) -> &str;

    /// Device or remote share to mount.
    fn device(&self) -> Result<String>;

    /// Extra arguments passed to `mount` before the device.
    fn mount_options(&self) -> Vec<String>;

    /// Current mount point, if mounted.
    fn mount_point(&self) -> Option<&Path>;

    /// Record the current mount point.
    fn set_mount_point(&mut self, mount_point: Option<PathBuf>);

    /// Mount point used when the caller does not specify one.
    fn default_mount_point(&self) -> PathBuf;
}

/// Runs `mount`/`umount`, optionally inside a mount namespace.
#[derive(Debug, Clone, Default)]
pub struct Mounter {
    /// Path of a mount-namespace file (e.g. `/proc/1/ns/mnt`).
    namespace_fd: Option<String>,
}

impl Mounter {
    /// Mount in the daemon's own namespace.
    pub fn new() -> Self {
        Self { namespace_fd: None }
    }

    /// Mount inside the namespace referenced by `fd`.
    ///
    /// Verifies that `nsenter` is available and can enter the namespace.
    pub fn with_namespace(fd: impl Into<String>) -> Result<Self> {
        let fd = fd.into();
        if fd.is_empty() {
            return Ok(Self::new());
        }

        execute(NSENTER_BINARY, &["-V"]).map_err(|_| {
            StorageError::InvalidConfig("cannot find nsenter for namespace switching".into())
        })?;
        let ns_arg = format!("--mount={}", fd);
        execute(NSENTER_BINARY, &[&ns_arg, MOUNT_BINARY]).map_err(|e| {
            StorageError::InvalidConfig(format!("invalid mount namespace {}: {}", fd, e))
        })?;

        info!(namespace = %fd, "Mounting inside mount namespace");
        Ok(Self { namespace_fd: Some(fd) })
    }

    /// Namespace this mounter enters, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace_fd.as_deref()
    }

    /// Mount `volume` at `mount_point`, or at its default mount point.
    ///
    /// Mounting an already-mounted volume at the same place is a no-op;
    /// asking for a different place is an error.
    pub fn mount<V: MountableVolume + ?Sized>(
        &self,
        volume: &mut V,
        mount_point: Option<&Path>,
    ) -> Result<PathBuf> {
        let device = volume.device()?;
        let options = volume.mount_options();

        let target = match mount_point {
            Some(p) => p.to_path_buf(),
            None => {
                let p = volume.default_mount_point();
                ensure_dir(&p)?;
                p
            }
        };

        if !target.is_dir() {
            return Err(StorageError::InvalidArgument(format!(
                "mount point {} is not a directory",
                target.display()
            )));
        }

        if let Some(existing) = volume.mount_point() {
            if existing != target {
                return Err(StorageError::Busy(format!(
                    "volume {} is already mounted at {}, but asked to mount at {}",
                    volume.volume_id(),
                    existing.display(),
                    target.display()
                )));
            }
        }

        let target_str = target.to_string_lossy().to_string();
        if !self.is_mounted(&device, &target_str) {
            debug!(
                volume = %volume.volume_id(),
                device = %device,
                mount_point = %target_str,
                options = ?options,
                "Volume is not mounted, mounting now"
            );
            let mut args = options;
            args.push(device);
            args.push(target_str);
            self.call(MOUNT_BINARY, &args)?;
        }

        volume.set_mount_point(Some(target.clone()));
        Ok(target)
    }

    /// Unmount `volume`; unmounting an unmounted volume is a no-op.
    ///
    /// The mount point directory is removed when it is the volume's default.
    pub fn umount<V: MountableVolume + ?Sized>(&self, volume: &mut V, extra_args: &[&str]) -> Result<()> {
        let Some(mount_point) = volume.mount_point().map(Path::to_path_buf) else {
            debug!(volume = %volume.volume_id(), "Umount of an unmounted volume");
            return Ok(());
        };

        let mut args: Vec<String> = extra_args.iter().map(|a| a.to_string()).collect();
        args.push(mount_point.to_string_lossy().to_string());
        self.call(UMOUNT_BINARY, &args)?;

        if mount_point == volume.default_mount_point() {
            if let Err(e) = fs::remove_dir(&mount_point) {
                warn!(
                    error = %e,
                    mount_point = %mount_point.display(),
                    "Cannot clean up mount point directory"
                );
            }
        }

        volume.set_mount_point(None);
        Ok(())
    }

    fn is_mounted(&self, device: &str, mount_point: &str) -> bool {
        match self.call(MOUNT_BINARY, &[]) {
            Ok(output) => output
                .lines()
                .any(|line| line.contains(device) && line.contains(mount_point)),
            Err(_) => false,
        }
    }

    fn call(&self, binary: &str, args: &[String]) -> Result<String> {
        let mut full: Vec<String> = Vec::with_capacity(args.len() + 2);
        let program = match &self.namespace_fd {
            Some(fd) => {
                full.push(format!("--mount={}", fd));
                full.push(binary.to_string());
                NSENTER_BINARY
            }
            None => binary,
        };
        full.extend(args.iter().cloned());

        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        execute(program, &refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestVolume {
        mount_point: Option<PathBuf>,
        default: PathBuf,
    }

    impl MountableVolume for TestVolume {
        fn volume_id(&self) -> &str {
            "test"
        }
        fn device(&self) -> Result<String> {
            Ok("/dev/test".to_string())
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
            self.default.clone()
        }
    }

    #[test]
    fn test_mount_rejects_different_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut volume = TestVolume {
            mount_point: Some(PathBuf::from("/somewhere/else")),
            default: dir.path().join("default"),
        };

        let err = Mounter::new().mount(&mut volume, Some(dir.path())).unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
        assert_eq!(volume.mount_point(), Some(Path::new("/somewhere/else")));
    }

    #[test]
    fn test_mount_rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        let mut volume = TestVolume {
            mount_point: None,
            default: dir.path().join("default"),
        };

        let err = Mounter::new().mount(&mut volume, Some(&file)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_umount_unmounted_is_noop() {
        let mut volume = TestVolume {
            mount_point: None,
            default: PathBuf::from("/nonexistent"),
        };
        Mounter::new().umount(&mut volume, &[]).unwrap();
        assert!(volume.mount_point().is_none());
    }
}
