//! Backup requests.
//!
//! A backup URL names its driver either through the object store record it
//! points at or, for drivers with their own backup transport, through the
//! URL scheme.

use std::collections::BTreeMap;

use convoy_common::logging::{event, object, reason};
use convoy_storage::{keys, unescape_url, BackupOperations, BackupRequest, DriverInfo, StorageError};
use tracing::{debug, info, instrument};

use super::Daemon;
use crate::api::{BackupCreateRequest, BackupCreateResponse, BackupListQuery};
use crate::error::{DaemonError, Result};

impl Daemon {
    /// Back a snapshot up to `dest_url`.
    ///
    /// State is only read to build the driver request; the global lock is
    /// released before the driver uploads anything.
    #[instrument(skip(self, request), fields(snapshot = %request.snapshot, dest_url = %request.dest_url))]
    pub async fn create_backup(&self, request: BackupCreateRequest) -> Result<BackupCreateResponse> {
        if request.dest_url.is_empty() {
            return Err(DaemonError::Validation("destination URL is required".to_string()));
        }
        let dest_url = unescape_url(&request.dest_url);

        let (driver_name, backup_request) = {
            let state = self.state.read().await;
            let (uuid, volume_uuid) = state.resolve_snapshot(&request.snapshot)?;
            let volume = state.volume(&volume_uuid)?;
            let snapshot = volume.snapshots.get(&uuid).ok_or_else(|| {
                DaemonError::NotFound(format!("snapshot {} of volume {}", uuid, volume_uuid))
            })?;
            self.backup_ops(&volume.driver_name)?;

            let volume_info = self
                .volume_ops(volume)?
                .get_volume_info(&volume.request())
                .await
                .map_err(|e| DaemonError::driver(&volume.driver_name, format!("inspect volume {}", volume_uuid), e))?;

            let backup_request = BackupRequest {
                snapshot_id: uuid.clone(),
                volume_id: volume_uuid.clone(),
                dest_url: dest_url.clone(),
                volume_name: volume.driver_volume_name(),
                volume_size: volume.size,
                volume_created_time: volume.created_time.clone(),
                file_system: volume_info.get(keys::FILE_SYSTEM).cloned().unwrap_or_default(),
                snapshot_name: snapshot.name.clone().unwrap_or_default(),
                snapshot_created_time: snapshot.created_time.clone(),
            };
            (volume.driver_name.clone(), backup_request)
        };

        let ops = self.backup_ops(&driver_name)?;
        debug!(
            reason = reason::PREPARE,
            event = event::BACKUP,
            object = object::SNAPSHOT,
            snapshot = %backup_request.snapshot_id,
            volume = %backup_request.volume_id,
            driver = %driver_name,
            dest_url = %dest_url,
            "Preparing backup create"
        );
        let url = ops
            .create_backup(&backup_request)
            .await
            .map_err(|e| DaemonError::driver(&driver_name, format!("backup to {}", dest_url), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::BACKUP,
            object = object::SNAPSHOT,
            snapshot = %backup_request.snapshot_id,
            volume = %backup_request.volume_id,
            driver = %driver_name,
            dest_url = %dest_url,
            "Completed backup create"
        );
        info!(backup_url = %url, "Backup created");

        let info = if request.verbose {
            Some(
                ops.get_backup_info(&url)
                    .await
                    .map_err(|e| DaemonError::driver(&driver_name, format!("inspect backup {}", url), e))?,
            )
        } else {
            None
        };
        Ok(BackupCreateResponse { url, info })
    }

    /// Delete the backup at `url`.
    #[instrument(skip(self))]
    pub async fn delete_backup(&self, url: &str) -> Result<()> {
        let _state = self.state.write().await;
        let url = unescape_url(url);
        let (driver_name, ops) = self.backup_ops_for_url(&url).await?;

        debug!(
            reason = reason::PREPARE,
            event = event::REMOVE,
            object = object::BACKUP,
            dest_url = %url,
            driver = %driver_name,
            "Preparing backup delete"
        );
        ops.delete_backup(&url)
            .await
            .map_err(|e| DaemonError::driver(&driver_name, format!("delete backup {}", url), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::REMOVE,
            object = object::BACKUP,
            dest_url = %url,
            driver = %driver_name,
            "Completed backup delete"
        );
        Ok(())
    }

    /// Flat metadata of the backup at `url`.
    pub async fn inspect_backup(&self, url: &str) -> Result<DriverInfo> {
        let _state = self.state.read().await;
        let url = unescape_url(url);
        let (driver_name, ops) = self.backup_ops_for_url(&url).await?;
        ops.get_backup_info(&url)
            .await
            .map_err(|e| DaemonError::driver(&driver_name, format!("inspect backup {}", url), e))
    }

    /// Backups under a destination, keyed by backup URL, from every driver
    /// that supports backups.
    pub async fn list_backups(&self, query: BackupListQuery) -> Result<BTreeMap<String, DriverInfo>> {
        if query.dest_url.is_empty() {
            return Err(DaemonError::Validation("destination URL is required".to_string()));
        }
        let _state = self.state.read().await;
        let dest_url = unescape_url(&query.dest_url);
        let volume_name = query.volume_name.as_deref().filter(|n| !n.is_empty());

        let mut result = BTreeMap::new();
        for (name, driver) in &self.drivers {
            let ops = match driver.backup_ops() {
                Ok(ops) => ops,
                Err(StorageError::NotSupported { .. }) => continue,
                Err(e) => return Err(DaemonError::driver(name, "backup operations", e)),
            };
            let backups = ops
                .list_backups(&dest_url, volume_name)
                .await
                .map_err(|e| DaemonError::driver(name, format!("list backups in {}", dest_url), e))?;
            debug!(driver = %name, event = event::LIST, count = backups.len(), "Listed backups");
            result.extend(backups);
        }
        Ok(result)
    }

    fn backup_ops(&self, driver_name: &str) -> Result<&dyn BackupOperations> {
        self.driver(driver_name)?
            .backup_ops()
            .map_err(|e| DaemonError::driver(driver_name, "backup operations", e))
    }

    async fn backup_ops_for_url(&self, url: &str) -> Result<(String, &dyn BackupOperations)> {
        let driver_name = self
            .objectstore
            .driver_for_backup(url)
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => DaemonError::NotFound(format!("backup {}", url)),
                StorageError::InvalidArgument(msg) => DaemonError::Validation(msg),
                e => DaemonError::driver("objectstore", format!("resolve backup {}", url), e),
            })?;
        let ops = self.backup_ops(&driver_name)?;
        Ok((driver_name, ops))
    }
}
