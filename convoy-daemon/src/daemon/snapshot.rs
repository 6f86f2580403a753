//! Snapshot requests.
//!
//! Index updates after a successful driver call are applied one after the
//! other without rollback; a failure between them leaves the earlier ones
//! in place and is reported as that step's error.

use convoy_common::logging::{event, object, reason};
use convoy_storage::{keys, util, DriverInfo, SnapshotOperations, SnapshotRequest};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Daemon, Snapshot, Volume, KIND_SNAPSHOT};
use crate::api::{SnapshotCreateRequest, SnapshotResponse};
use crate::error::{DaemonError, Result};

impl Daemon {
    /// Snapshot a volume. The snapshot UUID is always minted here.
    #[instrument(skip(self, request), fields(volume = %request.volume))]
    pub async fn create_snapshot(&self, request: SnapshotCreateRequest) -> Result<SnapshotResponse> {
        let mut state = self.state.write().await;
        let verbose = request.verbose;

        let volume_uuid = state.resolve_volume(&request.volume)?;
        let name = request.name.filter(|n| !n.is_empty());
        if let Some(ref name) = name {
            state.check_new_name(name)?;
        }

        let volume = state.volume(&volume_uuid)?;
        let ops = self.snapshot_ops(volume)?;
        let driver_name = volume.driver_name.clone();

        let uuid = Uuid::new_v4().to_string();
        if state.uuid_index.contains(&uuid) {
            return Err(DaemonError::Conflict(format!("snapshot {} already exists", uuid)));
        }
        let driver_request = SnapshotRequest {
            id: uuid.clone(),
            volume_id: volume_uuid.clone(),
            name: name.clone(),
        };

        debug!(
            reason = reason::PREPARE,
            event = event::CREATE,
            object = object::SNAPSHOT,
            snapshot = %uuid,
            volume = %volume_uuid,
            "Preparing snapshot create"
        );
        ops.create_snapshot(&driver_request)
            .await
            .map_err(|e| DaemonError::driver(&driver_name, format!("create snapshot {}", uuid), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::CREATE,
            object = object::SNAPSHOT,
            snapshot = %uuid,
            volume = %volume_uuid,
            "Completed snapshot create"
        );

        let created_time = ops
            .get_snapshot_info(&driver_request)
            .await
            .ok()
            .and_then(|info| info.get(keys::SNAPSHOT_CREATED_TIME).cloned())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(util::now);
        let snapshot = Snapshot {
            uuid: uuid.clone(),
            volume_uuid: volume_uuid.clone(),
            name: name.clone(),
            created_time,
        };

        state
            .volume_mut(&volume_uuid)?
            .snapshots
            .insert(uuid.clone(), snapshot);
        state.uuid_index.add(&uuid, KIND_SNAPSHOT)?;
        state.snapshot_volume_index.add(&uuid, &volume_uuid)?;
        if let Some(ref name) = name {
            state.name_index.add(name, &uuid)?;
        }
        let volume = state.volume(&volume_uuid)?;
        self.save_volume(volume)?;

        info!(snapshot = %uuid, volume = %volume_uuid, "Snapshot created");
        let snapshot = volume
            .snapshots
            .get(&uuid)
            .ok_or_else(|| DaemonError::invariant(format!("snapshot {} vanished", uuid)))?;
        if verbose {
            return self.snapshot_response(volume, snapshot).await;
        }

        // The snapshot exists now; a bare reply needs nothing more from the driver.
        let mut driver_info = DriverInfo::new();
        driver_info.insert(keys::DRIVER.to_string(), driver_name);
        Ok(Self::snapshot_record_response(volume, snapshot, driver_info))
    }

    /// Delete a snapshot, mirroring create in reverse.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let (uuid, volume_uuid) = state.resolve_snapshot(snapshot)?;
        let volume = state.volume(&volume_uuid)?;
        let ops = self.snapshot_ops(volume)?;
        let driver_name = volume.driver_name.clone();
        let name = volume.snapshots.get(&uuid).and_then(|s| s.name.clone());

        debug!(
            reason = reason::PREPARE,
            event = event::DELETE,
            object = object::SNAPSHOT,
            snapshot = %uuid,
            volume = %volume_uuid,
            "Preparing snapshot delete"
        );
        ops.delete_snapshot(&SnapshotRequest::new(uuid.clone(), volume_uuid.clone()))
            .await
            .map_err(|e| DaemonError::driver(&driver_name, format!("delete snapshot {}", uuid), e))?;
        debug!(
            reason = reason::COMPLETE,
            event = event::DELETE,
            object = object::SNAPSHOT,
            snapshot = %uuid,
            volume = %volume_uuid,
            "Completed snapshot delete"
        );

        state.snapshot_volume_index.delete(&uuid)?;
        state.uuid_index.delete(&uuid)?;
        if let Some(ref name) = name {
            state.name_index.delete(name)?;
        }
        let volume = state.volume_mut(&volume_uuid)?;
        volume.snapshots.remove(&uuid);
        let volume = state.volume(&volume_uuid)?;
        self.save_volume(volume)?;

        info!(snapshot = %uuid, volume = %volume_uuid, "Snapshot deleted");
        Ok(())
    }

    /// Snapshot metadata with its volume and driver info.
    pub async fn inspect_snapshot(&self, snapshot: &str) -> Result<SnapshotResponse> {
        let state = self.state.read().await;
        let (uuid, volume_uuid) = state.resolve_snapshot(snapshot)?;
        let volume = state.volume(&volume_uuid)?;
        let snapshot = volume
            .snapshots
            .get(&uuid)
            .ok_or_else(|| DaemonError::NotFound(format!("snapshot {}", uuid)))?;
        self.snapshot_response(volume, snapshot).await
    }

    pub(super) fn snapshot_ops(&self, volume: &Volume) -> Result<&dyn SnapshotOperations> {
        self.driver(&volume.driver_name)?
            .snapshot_ops()
            .map_err(|e| DaemonError::driver(&volume.driver_name, "snapshot operations", e))
    }

    pub(super) async fn snapshot_response(&self, volume: &Volume, snapshot: &Snapshot) -> Result<SnapshotResponse> {
        let ops = self.snapshot_ops(volume)?;
        let mut driver_info = ops
            .get_snapshot_info(&SnapshotRequest::new(snapshot.uuid.clone(), volume.uuid.clone()))
            .await
            .map_err(|e| {
                DaemonError::driver(&volume.driver_name, format!("inspect snapshot {}", snapshot.uuid), e)
            })?;
        driver_info.insert(keys::DRIVER.to_string(), volume.driver_name.clone());
        Ok(Self::snapshot_record_response(volume, snapshot, driver_info))
    }

    fn snapshot_record_response(volume: &Volume, snapshot: &Snapshot, driver_info: DriverInfo) -> SnapshotResponse {
        SnapshotResponse {
            uuid: snapshot.uuid.clone(),
            volume_uuid: volume.uuid.clone(),
            volume_name: volume.name.clone(),
            volume_created_time: volume.created_time.clone(),
            name: snapshot.name.clone(),
            created_time: snapshot.created_time.clone(),
            driver_info,
        }
    }
}
