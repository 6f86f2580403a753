//! End-to-end orchestrator scenarios against the in-memory mock driver and
//! the real vfs driver.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use convoy_daemon::api::{
    BackupCreateRequest, BackupListQuery, SnapshotCreateRequest, VolumeCreateRequest,
    VolumeDeleteRequest, VolumeListQuery, VolumeMountRequest, VolumeUmountRequest,
};
use convoy_daemon::config::DaemonConfig;
use convoy_daemon::{Daemon, DaemonError};
use convoy_storage::{keys, DriverRegistry, MockCapabilities, MockDriver, ObjectStore};

struct Harness {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    store: std::path::PathBuf,
    mock: Arc<MockDriver>,
    registry: DriverRegistry,
    config: DaemonConfig,
}

impl Harness {
    /// Drivers: vfs (default), mock (all capabilities), share (volumes only).
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let store = dir.path().join("store");
        std::fs::create_dir_all(&store).unwrap();

        let mut registry = DriverRegistry::with_defaults();
        let mock = Arc::new(MockDriver::new("mock", MockCapabilities::all()));
        MockDriver::register_shared(&mut registry, mock.clone()).unwrap();
        MockDriver::register(&mut registry, "share", MockCapabilities::volume_only()).unwrap();

        let mut config = DaemonConfig {
            root: root.clone(),
            drivers: vec!["vfs".to_string(), "mock".to_string(), "share".to_string()],
            ..Default::default()
        };
        config.driver_opts.insert(
            "vfs.path".to_string(),
            dir.path().join("volumes").display().to_string(),
        );

        Self {
            _dir: dir,
            root,
            store,
            mock,
            registry,
            config,
        }
    }

    fn daemon(&self) -> Daemon {
        Daemon::new(&self.config, &self.registry).unwrap()
    }

    fn dest(&self) -> String {
        format!("vfs://{}/", self.store.display())
    }
}

fn volume(name: &str, driver: &str) -> VolumeCreateRequest {
    VolumeCreateRequest {
        name: Some(name.to_string()),
        driver_name: Some(driver.to_string()),
        ..Default::default()
    }
}

fn snapshot(volume: &str, name: Option<&str>) -> SnapshotCreateRequest {
    SnapshotCreateRequest {
        volume: volume.to_string(),
        name: name.map(str::to_string),
        verbose: false,
    }
}

#[tokio::test]
async fn test_vfs_backup_lifecycle() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let v1 = daemon.create_volume(volume("v1", "vfs")).await.unwrap();
    assert_eq!(v1.driver, "vfs");
    let mounted = daemon
        .mount_volume(VolumeMountRequest {
            volume: "v1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let mount_point = mounted.mount_point.unwrap();
    std::fs::write(Path::new(&mount_point).join("data.txt"), b"hello").unwrap();

    let s1 = daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap();

    let backup = daemon
        .create_backup(BackupCreateRequest {
            snapshot: s1.uuid.clone(),
            dest_url: harness.dest(),
            verbose: true,
        })
        .await
        .unwrap();
    assert!(backup.url.starts_with("vfs://"));
    assert!(backup.url.contains(&v1.uuid));
    assert!(backup.url.contains(&s1.uuid));
    let info = backup.info.unwrap();
    assert_eq!(info[keys::VOLUME_UUID], v1.uuid);
    assert_eq!(info[keys::SNAPSHOT_UUID], s1.uuid);

    assert_eq!(
        ObjectStore::new().driver_for_backup(&backup.url).await.unwrap(),
        "vfs"
    );
    let inspected = daemon.inspect_backup(&backup.url).await.unwrap();
    assert_eq!(inspected[keys::VOLUME_UUID], v1.uuid);
    assert_eq!(inspected[keys::SNAPSHOT_UUID], s1.uuid);

    let listed = daemon
        .list_backups(BackupListQuery {
            dest_url: harness.dest(),
            volume_name: Some("v1".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed.contains_key(&backup.url));

    // Restore into a new vfs volume.
    let restored = daemon
        .create_volume(VolumeCreateRequest {
            backup_url: Some(backup.url.clone()),
            ..volume("v2", "vfs")
        })
        .await
        .unwrap();
    let restored_path = &restored.driver_info[keys::PATH];
    assert_eq!(
        std::fs::read(Path::new(restored_path).join("data.txt")).unwrap(),
        b"hello"
    );

    daemon.delete_backup(&backup.url).await.unwrap();
    let err = daemon.inspect_backup(&backup.url).await.unwrap_err();
    assert!(err.is_not_found(), "{}", err);

    // The source volume and snapshot are untouched.
    let v1_after = daemon.inspect_volume("v1").await.unwrap();
    assert!(v1_after.snapshots.contains_key(&s1.uuid));
    assert_eq!(daemon.inspect_snapshot("s1").await.unwrap().uuid, s1.uuid);
    daemon.verify_consistency().await.unwrap();
}

#[tokio::test]
async fn test_cross_driver_restore_is_rejected() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    daemon.create_volume(volume("v1", "vfs")).await.unwrap();
    let s1 = daemon.create_snapshot(snapshot("v1", None)).await.unwrap();
    let backup = daemon
        .create_backup(BackupCreateRequest {
            snapshot: s1.uuid,
            dest_url: harness.dest(),
            verbose: false,
        })
        .await
        .unwrap();

    let err = daemon
        .create_volume(VolumeCreateRequest {
            backup_url: Some(backup.url),
            ..volume("copy", "mock")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Validation(_)));
    assert!(err
        .to_string()
        .contains("cannot restore backup of driver vfs to driver mock"));

    assert_eq!(harness.mock.volume_count(), 0);
    assert!(daemon.inspect_volume("copy").await.unwrap_err().is_not_found());
    assert_eq!(daemon.list_volumes(VolumeListQuery::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_snapshot_delete_clears_every_index() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let v1 = daemon.create_volume(volume("v1", "mock")).await.unwrap();
    let s1 = daemon.create_snapshot(snapshot(&v1.uuid, Some("s1"))).await.unwrap();
    assert!(harness.mock.has_snapshot(&v1.uuid, &s1.uuid));

    daemon.delete_snapshot(&s1.uuid).await.unwrap();

    assert!(daemon.inspect_snapshot(&s1.uuid).await.unwrap_err().is_not_found());
    assert!(daemon.inspect_snapshot("s1").await.unwrap_err().is_not_found());
    assert!(!daemon.inspect_volume("v1").await.unwrap().snapshots.contains_key(&s1.uuid));
    assert!(!harness.mock.has_snapshot(&v1.uuid, &s1.uuid));
    daemon.verify_consistency().await.unwrap();

    // The name is free again.
    daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap();
}

#[tokio::test]
async fn test_driver_failure_leaves_state_untouched() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    daemon.create_volume(volume("v1", "mock")).await.unwrap();
    harness.mock.fail_on("create_snapshot");
    let err = daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap_err();
    assert!(matches!(err, DaemonError::Driver { .. }));
    assert!(daemon.inspect_volume("v1").await.unwrap().snapshots.is_empty());
    daemon.verify_consistency().await.unwrap();

    harness.mock.clear_failures();
    let s1 = daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap();

    harness.mock.fail_on("delete_snapshot");
    assert!(daemon.delete_snapshot("s1").await.is_err());
    assert_eq!(daemon.inspect_snapshot("s1").await.unwrap().uuid, s1.uuid);
    daemon.verify_consistency().await.unwrap();
}

#[tokio::test]
async fn test_missing_capability_is_not_supported() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let share = daemon.create_volume(volume("share1", "share")).await.unwrap();
    let err = daemon.create_snapshot(snapshot(&share.uuid, None)).await.unwrap_err();
    assert!(matches!(err, DaemonError::NotSupported(_)), "{}", err);

    // Backup listing skips the driver without backup support.
    let v1 = daemon.create_volume(volume("v1", "mock")).await.unwrap();
    let s1 = daemon.create_snapshot(snapshot(&v1.uuid, None)).await.unwrap();
    daemon
        .create_backup(BackupCreateRequest {
            snapshot: s1.uuid,
            dest_url: harness.dest(),
            verbose: false,
        })
        .await
        .unwrap();
    let listed = daemon
        .list_backups(BackupListQuery {
            dest_url: harness.dest(),
            volume_name: None,
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed.keys().all(|url| url.starts_with("mock://")));
}

#[tokio::test]
async fn test_name_and_uuid_conflicts() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let v1 = daemon.create_volume(volume("v1", "mock")).await.unwrap();
    let err = daemon.create_volume(volume("v1", "mock")).await.unwrap_err();
    assert!(matches!(err, DaemonError::Conflict(_)));

    let err = daemon
        .create_volume(VolumeCreateRequest {
            uuid: Some(v1.uuid.clone()),
            ..volume("other", "mock")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Conflict(_)));

    // Snapshot names share the namespace with volume names.
    let err = daemon.create_snapshot(snapshot("v1", Some("v1"))).await.unwrap_err();
    assert!(matches!(err, DaemonError::Conflict(_)));

    let err = daemon
        .create_volume(VolumeCreateRequest {
            size: Some("m".to_string()),
            ..volume("v2", "mock")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Validation(_)));

    let err = daemon.create_volume(volume("v3", "nope")).await.unwrap_err();
    assert!(matches!(err, DaemonError::NotFound(_)));
    assert_eq!(harness.mock.volume_count(), 1);
}

#[tokio::test]
async fn test_volume_delete_refused_while_mounted() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let v1 = daemon.create_volume(volume("v1", "mock")).await.unwrap();
    let s1 = daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap();
    daemon
        .mount_volume(VolumeMountRequest {
            volume: v1.uuid.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

    let delete = VolumeDeleteRequest {
        volume: "v1".to_string(),
        reference_only: false,
    };
    let err = daemon.delete_volume(delete.clone()).await.unwrap_err();
    assert!(matches!(err, DaemonError::Conflict(_)));

    daemon
        .umount_volume(VolumeUmountRequest {
            volume: "v1".to_string(),
        })
        .await
        .unwrap();
    daemon.delete_volume(delete).await.unwrap();

    assert!(daemon.inspect_volume("v1").await.unwrap_err().is_not_found());
    assert!(daemon.inspect_snapshot(&s1.uuid).await.unwrap_err().is_not_found());
    assert!(!harness.root.join(format!("volume_{}.json", v1.uuid)).exists());
    daemon.verify_consistency().await.unwrap();

    // Both names can be bound again.
    daemon.create_volume(volume("s1", "mock")).await.unwrap();
    daemon.create_volume(volume("v1", "mock")).await.unwrap();
}

#[tokio::test]
async fn test_restart_rebuilds_indices() {
    let harness = Harness::new();
    let (v1, s1) = {
        let daemon = harness.daemon();
        let v1 = daemon.create_volume(volume("v1", "mock")).await.unwrap();
        let s1 = daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap();
        daemon.create_volume(volume("v2", "vfs")).await.unwrap();
        (v1, s1)
    };

    let daemon = harness.daemon();
    assert_eq!(daemon.inspect_volume("v1").await.unwrap().uuid, v1.uuid);
    let snapshot = daemon.inspect_snapshot("s1").await.unwrap();
    assert_eq!(snapshot.uuid, s1.uuid);
    assert_eq!(snapshot.volume_uuid, v1.uuid);
    assert_eq!(daemon.inspect_volume("v2").await.unwrap().driver, "vfs");

    let vfs_only = daemon
        .list_volumes(VolumeListQuery {
            driver: Some("vfs".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(vfs_only.len(), 1);
    daemon.verify_consistency().await.unwrap();

    let err = daemon.create_volume(volume("v1", "mock")).await.unwrap_err();
    assert!(matches!(err, DaemonError::Conflict(_)));
}

#[tokio::test]
async fn test_uuids_are_unique() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let mut seen = HashSet::new();
    for i in 0..5 {
        let v = daemon
            .create_volume(VolumeCreateRequest {
                driver_name: Some("mock".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(v.name.is_none());
        assert!(seen.insert(v.uuid.clone()));
        for _ in 0..i {
            let s = daemon.create_snapshot(snapshot(&v.uuid, None)).await.unwrap();
            assert!(seen.insert(s.uuid));
        }
    }
    assert_eq!(seen.len(), 15);
    daemon.verify_consistency().await.unwrap();
}

#[tokio::test]
async fn test_info_reports_drivers() {
    let harness = Harness::new();
    let daemon = harness.daemon();
    daemon.create_volume(volume("v1", "mock")).await.unwrap();

    let info = daemon.info().await.unwrap();
    assert_eq!(info.default_driver, "vfs");
    assert_eq!(info.volume_count, 1);
    assert_eq!(
        info.drivers.keys().cloned().collect::<Vec<_>>(),
        vec!["mock", "share", "vfs"]
    );
}

#[tokio::test]
async fn test_vfs_volumes_never_share_a_directory() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    let unnamed = daemon
        .create_volume(VolumeCreateRequest {
            uuid: Some("11111111-2222-4333-8444-555555555555".to_string()),
            driver_name: Some("vfs".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let path = Path::new(&unnamed.driver_info[keys::PATH]).to_path_buf();
    assert!(path.ends_with("volume-11111111"));
    std::fs::write(path.join("precious.txt"), b"keep").unwrap();

    // A named volume spelling out the generated directory name.
    let err = daemon.create_volume(volume("volume-11111111", "vfs")).await.unwrap_err();
    assert!(matches!(err, DaemonError::Driver { .. }), "{}", err);
    assert!(daemon.inspect_volume("volume-11111111").await.unwrap_err().is_not_found());

    // A second unnamed volume whose UUID shares the 8-character prefix.
    let err = daemon
        .create_volume(VolumeCreateRequest {
            uuid: Some("11111111-9999-4333-8444-555555555555".to_string()),
            driver_name: Some("vfs".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Driver { .. }), "{}", err);
    assert!(daemon
        .inspect_volume("11111111-9999-4333-8444-555555555555")
        .await
        .unwrap_err()
        .is_not_found());

    assert_eq!(std::fs::read(path.join("precious.txt")).unwrap(), b"keep");
    assert_eq!(daemon.list_volumes(VolumeListQuery::default()).await.unwrap().len(), 1);
    daemon.verify_consistency().await.unwrap();
}

#[tokio::test]
async fn test_uuid_shaped_names_are_rejected() {
    let harness = Harness::new();
    let daemon = harness.daemon();

    for name in [
        "0b7bb6e4-5b6c-4e1c-9a0b-1a5d2c7f8e90",
        "0b7bb6e45b6c4e1c9a0b1a5d2c7f8e90",
    ] {
        let err = daemon.create_volume(volume(name, "mock")).await.unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)), "{}", err);
    }
    assert_eq!(harness.mock.volume_count(), 0);

    daemon.create_volume(volume("v1", "mock")).await.unwrap();
    let err = daemon
        .create_snapshot(snapshot("v1", Some("0b7bb6e4-5b6c-4e1c-9a0b-1a5d2c7f8e90")))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Validation(_)), "{}", err);
    assert!(daemon.inspect_volume("v1").await.unwrap().snapshots.is_empty());
}

#[tokio::test]
async fn test_bare_snapshot_create_skips_driver_inspect() {
    let harness = Harness::new();
    let daemon = harness.daemon();
    daemon.create_volume(volume("v1", "mock")).await.unwrap();

    harness.mock.fail_on("get_snapshot_info");
    let s1 = daemon.create_snapshot(snapshot("v1", Some("s1"))).await.unwrap();
    assert_eq!(s1.name.as_deref(), Some("s1"));
    assert_eq!(s1.driver_info[keys::DRIVER], "mock");
    assert!(!s1.created_time.is_empty());

    // Verbose replies still report the driver's view.
    let err = daemon
        .create_snapshot(SnapshotCreateRequest {
            verbose: true,
            ..snapshot("v1", Some("s2"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Driver { .. }), "{}", err);

    harness.mock.clear_failures();
    let inspected = daemon.inspect_snapshot("s1").await.unwrap();
    assert_eq!(inspected.uuid, s1.uuid);
    daemon.verify_consistency().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_keep_indices_consistent() {
    let harness = Harness::new();
    let daemon = Arc::new(harness.daemon());
    let dest = harness.dest();

    let mut keepers = Vec::new();
    for i in 0..4 {
        let v = daemon.create_volume(volume(&format!("v{}", i), "mock")).await.unwrap();
        let name = format!("keep{}", i);
        let s = daemon.create_snapshot(snapshot(&v.uuid, Some(name.as_str()))).await.unwrap();
        keepers.push(s.uuid);
    }

    let mut churn = Vec::new();
    for i in 0..4 {
        let daemon = daemon.clone();
        churn.push(tokio::spawn(async move {
            let mut kept = Vec::new();
            for j in 0..5 {
                let name = format!("s{}-{}", i, j);
                let s = daemon
                    .create_snapshot(snapshot(&format!("v{}", i), Some(name.as_str())))
                    .await?;
                if j % 2 == 0 {
                    daemon.delete_snapshot(&s.uuid).await?;
                } else {
                    kept.push(s.uuid);
                }
                tokio::task::yield_now().await;
            }
            Ok::<_, DaemonError>(kept)
        }));
    }

    let mut backups = Vec::new();
    for keeper in keepers.clone() {
        let daemon = daemon.clone();
        let dest = dest.clone();
        backups.push(tokio::spawn(async move {
            for _ in 0..3 {
                daemon
                    .create_backup(BackupCreateRequest {
                        snapshot: keeper.clone(),
                        dest_url: dest.clone(),
                        verbose: false,
                    })
                    .await?;
                daemon.verify_consistency().await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, DaemonError>(())
        }));
    }

    let mut survivors = Vec::new();
    for task in churn {
        survivors.extend(task.await.unwrap().unwrap());
    }
    for task in backups {
        task.await.unwrap().unwrap();
    }

    daemon.verify_consistency().await.unwrap();

    let volumes = daemon.list_volumes(VolumeListQuery::default()).await.unwrap();
    let mut seen = HashSet::new();
    for volume in volumes.values() {
        assert!(seen.insert(volume.uuid.clone()));
        for snapshot in volume.snapshots.keys() {
            assert!(seen.insert(snapshot.clone()), "UUID {} shared", snapshot);
        }
    }
    // Four volumes, four keepers and two surviving snapshots per churn task.
    assert_eq!(seen.len(), 4 + 4 + 8);
    for uuid in keepers.iter().chain(survivors.iter()) {
        assert!(seen.contains(uuid));
        assert_eq!(daemon.inspect_snapshot(uuid).await.unwrap().uuid, *uuid);
    }

    let listed = daemon
        .list_backups(BackupListQuery {
            dest_url: dest,
            volume_name: None,
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), keepers.len());
}
