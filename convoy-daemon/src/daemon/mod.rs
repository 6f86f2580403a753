//! The orchestrator.
//!
//! `Daemon` is the only component that mutates volume and snapshot metadata
//! and the three identity indices. Requests take the global state lock:
//! mutations as writers for their whole duration, inspect and list as
//! readers. Backup create only reads state and drops the lock before the
//! upload.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Daemon                     │
//! │  RwLock<DaemonState>                         │
//! │    volumes: uuid -> Volume (+ snapshots)     │
//! │    uuid_index / name_index / snapshot_index  │
//! └───────┬──────────────────────────────┬───────┘
//!         │ Arc<dyn ConvoyDriver>        │
//!         ▼                              ▼
//!   drivers (own locks)           ObjectStore (backup
//!                                 URL -> driver name)
//! ```

mod backup;
mod snapshot;
mod volume;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use convoy_storage::{util, ConvoyDriver, DriverRegistry, ObjectStore, StorageError, VolumeRequest};

use crate::api::DaemonInfo;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::index::Index;

const VOLUME_RECORD_PREFIX: &str = "volume_";
const VOLUME_RECORD_SUFFIX: &str = ".json";

/// Values of the UUID existence index.
const KIND_VOLUME: &str = "volume";
const KIND_SNAPSHOT: &str = "snapshot";

/// A volume as the daemon records it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub uuid: String,
    pub name: Option<String>,
    pub driver_name: String,
    pub size: u64,
    pub created_time: String,
    #[serde(default)]
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl Volume {
    /// Name handed to the driver; unnamed volumes get `volume-<uuid prefix>`.
    pub fn driver_volume_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => default_volume_name(&self.uuid),
        }
    }

    fn request(&self) -> VolumeRequest {
        VolumeRequest::new(self.uuid.clone(), self.driver_volume_name()).with_size(self.size)
    }
}

pub(crate) fn default_volume_name(uuid: &str) -> String {
    format!("volume-{}", &uuid[..uuid.len().min(8)])
}

/// A snapshot as the daemon records it, embedded in its volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub uuid: String,
    pub volume_uuid: String,
    pub name: Option<String>,
    pub created_time: String,
}

/// Everything guarded by the global lock.
#[derive(Debug)]
pub(crate) struct DaemonState {
    volumes: BTreeMap<String, Volume>,
    /// uuid -> "volume" | "snapshot"
    uuid_index: Index,
    /// name -> uuid, for named volumes and snapshots
    name_index: Index,
    /// snapshot uuid -> volume uuid
    snapshot_volume_index: Index,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            volumes: BTreeMap::new(),
            uuid_index: Index::new("uuid"),
            name_index: Index::new("name"),
            snapshot_volume_index: Index::new("snapshot volume"),
        }
    }

    /// Rebuild state from the volume records under `root`.
    fn load(root: &Path) -> Result<Self> {
        let mut state = Self::new();
        let ids = util::list_config_ids(root, VOLUME_RECORD_PREFIX, VOLUME_RECORD_SUFFIX)
            .map_err(DaemonError::persistence)?;

        for id in ids {
            let volume: Volume =
                util::load_json(&volume_record_path(root, &id)).map_err(DaemonError::persistence)?;
            if volume.uuid != id {
                return Err(DaemonError::invariant(format!(
                    "volume record {} holds volume {}",
                    id, volume.uuid
                )));
            }
            state.register_loaded(volume).map_err(|e| {
                DaemonError::invariant(format!("inconsistent volume records: {}", e))
            })?;
        }
        Ok(state)
    }

    fn register_loaded(&mut self, volume: Volume) -> Result<()> {
        self.uuid_index.add(&volume.uuid, KIND_VOLUME)?;
        if let Some(ref name) = volume.name {
            self.name_index.add(name, &volume.uuid)?;
        }
        for snapshot in volume.snapshots.values() {
            self.uuid_index.add(&snapshot.uuid, KIND_SNAPSHOT)?;
            self.snapshot_volume_index.add(&snapshot.uuid, &volume.uuid)?;
            if let Some(ref name) = snapshot.name {
                self.name_index.add(name, &snapshot.uuid)?;
            }
        }
        self.volumes.insert(volume.uuid.clone(), volume);
        Ok(())
    }

    /// UUID of the volume referenced by UUID or name.
    fn resolve_volume(&self, reference: &str) -> Result<String> {
        let uuid = self.resolve(reference, "volume")?;
        if self.uuid_index.get(&uuid) != Some(KIND_VOLUME) || !self.volumes.contains_key(&uuid) {
            return Err(DaemonError::NotFound(format!("volume {}", reference)));
        }
        Ok(uuid)
    }

    /// UUIDs of the snapshot referenced by UUID or name and of its volume.
    ///
    /// Fails when the ownership index and the volume's snapshot map disagree.
    fn resolve_snapshot(&self, reference: &str) -> Result<(String, String)> {
        let uuid = self.resolve(reference, "snapshot")?;
        let volume_uuid = self
            .snapshot_volume_index
            .get(&uuid)
            .ok_or_else(|| DaemonError::NotFound(format!("snapshot {}", reference)))?
            .to_string();

        let volume = self.volumes.get(&volume_uuid).ok_or_else(|| {
            DaemonError::invariant(format!("volume {} of snapshot {} is not loaded", volume_uuid, uuid))
        })?;
        if !volume.snapshots.contains_key(&uuid) {
            return Err(DaemonError::invariant(format!(
                "snapshot {} of volume {} doesn't exist",
                uuid, volume_uuid
            )));
        }
        Ok((uuid, volume_uuid))
    }

    fn resolve(&self, reference: &str, what: &str) -> Result<String> {
        if reference.is_empty() {
            return Err(DaemonError::Validation(format!("{} UUID or name is required", what)));
        }
        if util::is_uuid(reference) {
            return Ok(reference.to_string());
        }
        util::check_name(reference).map_err(|e| DaemonError::Validation(e.to_string()))?;
        self.name_index
            .get(reference)
            .map(str::to_string)
            .ok_or_else(|| DaemonError::NotFound(format!("{} {}", what, reference)))
    }

    fn volume(&self, uuid: &str) -> Result<&Volume> {
        self.volumes
            .get(uuid)
            .ok_or_else(|| DaemonError::invariant(format!("volume {} is indexed but not loaded", uuid)))
    }

    fn volume_mut(&mut self, uuid: &str) -> Result<&mut Volume> {
        self.volumes
            .get_mut(uuid)
            .ok_or_else(|| DaemonError::invariant(format!("volume {} is indexed but not loaded", uuid)))
    }

    /// Fail if `name` is malformed, UUID-shaped or already bound.
    fn check_new_name(&self, name: &str) -> Result<()> {
        util::check_name(name).map_err(|e| DaemonError::Validation(e.to_string()))?;
        // References that parse as a UUID never reach the name index.
        if util::is_uuid(name) {
            return Err(DaemonError::Validation(format!("name {} cannot be a UUID", name)));
        }
        if let Some(existing) = self.name_index.get(name) {
            return Err(DaemonError::Conflict(format!(
                "name {} is already associated with {}",
                name, existing
            )));
        }
        Ok(())
    }
}

fn volume_record_path(root: &Path, uuid: &str) -> PathBuf {
    root.join(format!("{}{}{}", VOLUME_RECORD_PREFIX, uuid, VOLUME_RECORD_SUFFIX))
}

/// Volume, snapshot and backup orchestration over the loaded drivers.
pub struct Daemon {
    root: PathBuf,
    drivers: BTreeMap<String, Arc<dyn ConvoyDriver>>,
    default_driver: String,
    objectstore: ObjectStore,
    state: RwLock<DaemonState>,
}

impl Daemon {
    /// Initialize the configured drivers and rebuild state from the volume
    /// records under the root.
    #[instrument(skip_all, fields(root = %config.root.display()))]
    pub fn new(config: &DaemonConfig, registry: &DriverRegistry) -> Result<Self> {
        let default_driver = config
            .drivers
            .first()
            .cloned()
            .ok_or_else(|| DaemonError::Validation("at least one driver must be configured".to_string()))?;

        util::ensure_dir(&config.root).map_err(DaemonError::persistence)?;

        let driver_config = config.driver_config();
        let mut drivers = BTreeMap::new();
        for name in &config.drivers {
            let driver = registry
                .init(name, &config.root, &driver_config)
                .map_err(|e| match e {
                    StorageError::NotFound(_) => DaemonError::NotFound(format!("driver {}", name)),
                    e => DaemonError::driver(name, "initialize", e),
                })?;
            debug!(driver = %name, "Driver loaded");
            drivers.insert(name.clone(), driver);
        }

        let state = DaemonState::load(&config.root)?;
        info!(
            drivers = ?config.drivers,
            volumes = state.volumes.len(),
            "Daemon state loaded"
        );

        Ok(Self {
            root: config.root.clone(),
            drivers,
            default_driver,
            objectstore: ObjectStore::new(),
            state: RwLock::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_driver(&self) -> &str {
        &self.default_driver
    }

    fn driver(&self, name: &str) -> Result<&Arc<dyn ConvoyDriver>> {
        self.drivers
            .get(name)
            .ok_or_else(|| DaemonError::NotFound(format!("driver {}", name)))
    }

    fn save_volume(&self, volume: &Volume) -> Result<()> {
        util::save_json(&volume_record_path(&self.root, &volume.uuid), volume)
            .map_err(DaemonError::persistence)
    }

    fn remove_volume_record(&self, uuid: &str) -> Result<()> {
        util::remove_if_exists(&volume_record_path(&self.root, uuid)).map_err(DaemonError::persistence)
    }

    /// Daemon status with what each driver reports.
    pub async fn info(&self) -> Result<DaemonInfo> {
        let state = self.state.read().await;
        let mut drivers = BTreeMap::new();
        for (name, driver) in &self.drivers {
            let info = driver
                .info()
                .map_err(|e| DaemonError::driver(name, "driver info", e))?;
            drivers.insert(name.clone(), info);
        }
        Ok(DaemonInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            root: self.root.display().to_string(),
            default_driver: self.default_driver.clone(),
            volume_count: state.volumes.len(),
            drivers,
        })
    }

    /// Check the invariants tying the indices to the volume map.
    ///
    /// Every snapshot in the ownership index is in exactly one volume's
    /// snapshot map and every embedded snapshot is indexed.
    pub async fn verify_consistency(&self) -> Result<()> {
        let state = self.state.read().await;
        let mut snapshot_count = 0;
        for volume in state.volumes.values() {
            if state.uuid_index.get(&volume.uuid) != Some(KIND_VOLUME) {
                return Err(DaemonError::invariant(format!("volume {} is not indexed", volume.uuid)));
            }
            for snapshot in volume.snapshots.values() {
                snapshot_count += 1;
                if state.snapshot_volume_index.get(&snapshot.uuid) != Some(volume.uuid.as_str())
                    || state.uuid_index.get(&snapshot.uuid) != Some(KIND_SNAPSHOT)
                {
                    return Err(DaemonError::invariant(format!(
                        "snapshot {} of volume {} is not indexed",
                        snapshot.uuid, volume.uuid
                    )));
                }
            }
        }
        if snapshot_count != state.snapshot_volume_index.len() {
            return Err(DaemonError::invariant(format!(
                "{} snapshots indexed, {} recorded",
                state.snapshot_volume_index.len(),
                snapshot_count
            )));
        }
        if state.uuid_index.len() != state.volumes.len() + snapshot_count {
            return Err(DaemonError::invariant("uuid index holds unknown objects"));
        }
        Ok(())
    }
}
