//! Volume requests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use convoy_common::logging::{event, object, reason};
use convoy_storage::{keys, unescape_url, util, VolumeOperations};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Daemon, DaemonState, Volume, KIND_VOLUME};
use crate::api::{
    VolumeCreateRequest, VolumeDeleteRequest, VolumeListQuery, VolumeMountRequest,
    VolumeResponse, VolumeUmountRequest,
};
use crate::error::{DaemonError, Result};

impl Daemon {
    /// Create a volume, optionally restored from a backup.
    #[instrument(skip(self, request), fields(name = ?request.name))]
    pub async fn create_volume(&self, request: VolumeCreateRequest) -> Result<VolumeResponse> {
        let mut state = self.state.write().await;

        let driver_name = request
            .driver_name
            .clone()
            .unwrap_or_else(|| self.default_driver.clone());
        let driver = self.driver(&driver_name)?;

        let name = request.name.filter(|n| !n.is_empty());
        if let Some(ref name) = name {
            state.check_new_name(name)?;
        }

        let uuid = match request.uuid.filter(|u| !u.is_empty()) {
            Some(uuid) => {
                util::check_uuid(&uuid).map_err(|e| DaemonError::Validation(e.to_string()))?;
                if state.uuid_index.contains(&uuid) {
                    return Err(DaemonError::Conflict(format!("UUID {} is already in use", uuid)));
                }
                uuid
            }
            None => Uuid::new_v4().to_string(),
        };

        let size = match request.size.as_deref() {
            Some(size) => util::parse_size(size).map_err(|e| DaemonError::Validation(e.to_string()))?,
            None => 0,
        };

        let backup_url = request.backup_url.as_deref().map(unescape_url);
        if let Some(ref url) = backup_url {
            let backup_driver = self
                .objectstore
                .driver_for_backup(url)
                .await
                .map_err(|e| DaemonError::driver(&driver_name, format!("resolve backup {}", url), e))?;
            if backup_driver != driver_name {
                return Err(DaemonError::Validation(format!(
                    "cannot restore backup of driver {} to driver {}",
                    backup_driver, driver_name
                )));
            }
        }

        let ops = driver
            .volume_ops()
            .map_err(|e| DaemonError::driver(&driver_name, "create volume", e))?;

        let mut volume = Volume {
            uuid: uuid.clone(),
            name: name.clone(),
            driver_name: driver_name.clone(),
            size,
            created_time: util::now(),
            snapshots: BTreeMap::new(),
        };
        let mut driver_request = volume.request();
        driver_request.backup_url = backup_url;

        debug!(
            reason = reason::PREPARE,
            event = event::CREATE,
            object = object::VOLUME,
            volume = %uuid,
            driver = %driver_name,
            "Preparing volume create"
        );
        ops.create_volume(&driver_request)
            .await
            .map_err(|e| DaemonError::driver(&driver_name, format!("create volume {}", uuid), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::CREATE,
            object = object::VOLUME,
            volume = %uuid,
            driver = %driver_name,
            "Completed volume create"
        );

        // The driver may have applied its default size.
        if let Ok(info) = ops.get_volume_info(&driver_request).await {
            if let Some(reported) = info.get(keys::SIZE).and_then(|s| s.parse().ok()) {
                volume.size = reported;
            }
        }

        self.save_volume(&volume)?;
        state.uuid_index.add(&uuid, KIND_VOLUME)?;
        if let Some(ref name) = name {
            state.name_index.add(name, &uuid)?;
        }
        state.volumes.insert(uuid.clone(), volume);

        info!(volume = %uuid, driver = %driver_name, "Volume created");
        self.volume_response(&state, &uuid).await
    }

    /// Delete a volume and forget its snapshots.
    #[instrument(skip(self, request), fields(volume = %request.volume))]
    pub async fn delete_volume(&self, request: VolumeDeleteRequest) -> Result<()> {
        let mut state = self.state.write().await;
        let uuid = state.resolve_volume(&request.volume)?;
        let volume = state.volume(&uuid)?.clone();
        let driver = self.driver(&volume.driver_name)?;
        let ops = driver
            .volume_ops()
            .map_err(|e| DaemonError::driver(&volume.driver_name, "delete volume", e))?;

        let mut driver_request = volume.request();
        driver_request.reference_only = request.reference_only;

        let mount_point = ops
            .mount_point(&driver_request)
            .await
            .map_err(|e| DaemonError::driver(&volume.driver_name, format!("mount point of {}", uuid), e))?;
        if let Some(mount_point) = mount_point {
            return Err(DaemonError::Conflict(format!(
                "volume {} is still mounted at {}",
                uuid,
                mount_point.display()
            )));
        }

        debug!(
            reason = reason::PREPARE,
            event = event::DELETE,
            object = object::VOLUME,
            volume = %uuid,
            driver = %volume.driver_name,
            "Preparing volume delete"
        );
        ops.delete_volume(&driver_request)
            .await
            .map_err(|e| DaemonError::driver(&volume.driver_name, format!("delete volume {}", uuid), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::DELETE,
            object = object::VOLUME,
            volume = %uuid,
            driver = %volume.driver_name,
            "Completed volume delete"
        );

        for snapshot in volume.snapshots.values() {
            state.snapshot_volume_index.delete(&snapshot.uuid)?;
            state.uuid_index.delete(&snapshot.uuid)?;
            if let Some(ref name) = snapshot.name {
                state.name_index.delete(name)?;
            }
        }
        state.uuid_index.delete(&uuid)?;
        if let Some(ref name) = volume.name {
            state.name_index.delete(name)?;
        }
        self.remove_volume_record(&uuid)?;
        state.volumes.remove(&uuid);

        info!(volume = %uuid, reference_only = request.reference_only, "Volume deleted");
        Ok(())
    }

    /// Mount a volume; returns the volume with its mount point.
    #[instrument(skip(self, request), fields(volume = %request.volume))]
    pub async fn mount_volume(&self, request: VolumeMountRequest) -> Result<VolumeResponse> {
        let state = self.state.write().await;
        let uuid = state.resolve_volume(&request.volume)?;
        let volume = state.volume(&uuid)?;
        let ops = self.volume_ops(volume)?;

        let mut driver_request = volume.request();
        driver_request.mount_point = request
            .mount_point
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        debug!(
            reason = reason::PREPARE,
            event = event::MOUNT,
            object = object::VOLUME,
            volume = %uuid,
            driver = %volume.driver_name,
            "Preparing volume mount"
        );
        let mount_point = ops
            .mount_volume(&driver_request)
            .await
            .map_err(|e| DaemonError::driver(&volume.driver_name, format!("mount volume {}", uuid), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::MOUNT,
            object = object::VOLUME,
            volume = %uuid,
            mount_point = %mount_point.display(),
            "Completed volume mount"
        );

        self.volume_response(&state, &uuid).await
    }

    /// Unmount a volume.
    #[instrument(skip(self, request), fields(volume = %request.volume))]
    pub async fn umount_volume(&self, request: VolumeUmountRequest) -> Result<()> {
        let state = self.state.write().await;
        let uuid = state.resolve_volume(&request.volume)?;
        let volume = state.volume(&uuid)?;
        let ops = self.volume_ops(volume)?;

        debug!(
            reason = reason::PREPARE,
            event = event::UMOUNT,
            object = object::VOLUME,
            volume = %uuid,
            driver = %volume.driver_name,
            "Preparing volume umount"
        );
        ops.umount_volume(&volume.request())
            .await
            .map_err(|e| DaemonError::driver(&volume.driver_name, format!("umount volume {}", uuid), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::UMOUNT,
            object = object::VOLUME,
            volume = %uuid,
            "Completed volume umount"
        );
        Ok(())
    }

    pub async fn inspect_volume(&self, volume: &str) -> Result<VolumeResponse> {
        let state = self.state.read().await;
        let uuid = state.resolve_volume(volume)?;
        self.volume_response(&state, &uuid).await
    }

    /// All volumes keyed by UUID, optionally only those of one driver.
    pub async fn list_volumes(&self, query: VolumeListQuery) -> Result<BTreeMap<String, VolumeResponse>> {
        let state = self.state.read().await;
        if let Some(ref driver) = query.driver {
            self.driver(driver)?;
        }

        let mut result = BTreeMap::new();
        for volume in state.volumes.values() {
            if query.driver.as_ref().is_some_and(|d| d != &volume.driver_name) {
                continue;
            }
            result.insert(volume.uuid.clone(), self.volume_response(&state, &volume.uuid).await?);
        }
        Ok(result)
    }

    pub(super) fn volume_ops(&self, volume: &Volume) -> Result<&dyn VolumeOperations> {
        self.driver(&volume.driver_name)?
            .volume_ops()
            .map_err(|e| DaemonError::driver(&volume.driver_name, "volume operations", e))
    }

    /// Volume metadata merged with what the driver reports.
    pub(super) async fn volume_response(&self, state: &DaemonState, uuid: &str) -> Result<VolumeResponse> {
        let volume = state.volume(uuid)?;
        let ops = self.volume_ops(volume)?;
        let request = volume.request();

        let driver_info = ops
            .get_volume_info(&request)
            .await
            .map_err(|e| DaemonError::driver(&volume.driver_name, format!("inspect volume {}", uuid), e))?;
        let mount_point = ops
            .mount_point(&request)
            .await
            .map_err(|e| DaemonError::driver(&volume.driver_name, format!("mount point of {}", uuid), e))?;

        let mut snapshots = BTreeMap::new();
        for snapshot in volume.snapshots.values() {
            snapshots.insert(snapshot.uuid.clone(), self.snapshot_response(volume, snapshot).await?);
        }

        Ok(VolumeResponse {
            uuid: volume.uuid.clone(),
            name: volume.name.clone(),
            driver: volume.driver_name.clone(),
            size: volume.size,
            mount_point: mount_point.map(|p| p.display().to_string()),
            created_time: volume.created_time.clone(),
            driver_info,
            snapshots,
        })
    }
}
