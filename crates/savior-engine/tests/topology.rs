//! Topology enumeration and lifecycle helpers against the in-memory platform.

use savior_common::{DiskFormat, DiskSpec, DiskStatus, SaviorError, SnapshotRequest};
use savior_engine::testing::MemoryPlatform;
use savior_engine::{PollConfig, Topology};
use std::sync::Arc;
use std::time::Duration;

fn topology(platform: &Arc<MemoryPlatform>) -> Topology<MemoryPlatform> {
    Topology::new(Arc::clone(platform), PollConfig::new(Duration::from_millis(1)))
}

#[tokio::test]
async fn test_snapshots_sorted_without_active() {
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 2 << 30);
    platform.add_disk(&vm.id, "root", 10 << 30);
    let first = platform.take_snapshot(&vm.id, "first");
    let second = platform.take_snapshot(&vm.id, "second");
    let topology = topology(&platform);

    let snapshots = topology.list_snapshots(&vm.id, true).await.unwrap();
    let ids: Vec<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, [first.id.as_str(), second.id.as_str()]);

    let with_active = topology.list_snapshots(&vm.id, false).await.unwrap();
    assert_eq!(with_active.len(), 3);
    assert!(with_active.last().unwrap().is_active());
}

#[tokio::test]
async fn test_find_vm_by_name() {
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 1 << 30);
    platform.add_vm("web-2", 1 << 30);
    let topology = topology(&platform);

    assert_eq!(topology.find_vm_by_name("web").await.unwrap(), vm);
    let err = topology.find_vm_by_name("db").await.unwrap_err();
    assert!(matches!(err, SaviorError::VmNotFound(name) if name == "db"));
}

#[tokio::test]
async fn test_duplicate_descriptions_resolve_to_first() {
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 1 << 30);
    let first = platform.take_snapshot(&vm.id, "nightly");
    platform.take_snapshot(&vm.id, "nightly");
    let topology = topology(&platform);

    let found = topology
        .find_snapshot_by_description(&vm.id, "nightly")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
    assert!(topology
        .find_snapshot_by_description(&vm.id, "weekly")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_remove_snapshot_by_description() {
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 1 << 30);
    platform.add_disk(&vm.id, "root", 10 << 30);
    let stale = platform.take_snapshot(&vm.id, "backup");
    let topology = topology(&platform);

    assert!(topology
        .remove_snapshot_by_description(&vm.id, "backup")
        .await
        .unwrap());
    assert!(!topology
        .remove_snapshot_by_description(&vm.id, "backup")
        .await
        .unwrap());
    assert_eq!(
        platform.calls(),
        vec![format!("remove_snapshot {}", stale.id)]
    );
}

#[tokio::test]
async fn test_remove_waits_on_removed_id_when_descriptions_repeat() {
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 1 << 30);
    platform.add_disk(&vm.id, "root", 10 << 30);
    let first = platform.take_snapshot(&vm.id, "nightly");
    let second = platform.take_snapshot(&vm.id, "nightly");
    let topology = Topology::new(
        Arc::clone(&platform),
        PollConfig::new(Duration::from_millis(1)).with_timeout(Duration::from_millis(300)),
    );

    assert!(topology
        .remove_snapshot_by_description(&vm.id, "nightly")
        .await
        .unwrap());

    assert_eq!(platform.calls(), vec![format!("remove_snapshot {}", first.id)]);
    let left = topology
        .find_snapshot_by_description(&vm.id, "nightly")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(left.id, second.id);
}

#[tokio::test]
async fn test_create_disk_waits_until_ok() {
    let platform = Arc::new(MemoryPlatform::new().with_settle_polls(2));
    let vm = platform.add_vm("web", 1 << 30);
    let topology = topology(&platform);

    let spec = DiskSpec {
        name: "root".to_string(),
        description: None,
        format: DiskFormat::Cow,
        sparse: true,
        provisioned_size: 10 << 30,
        initial_size: Some(1 << 30),
        storage_domain: "data".to_string(),
        bootable: false,
        interface: "virtio_scsi".to_string(),
    };
    let disk = topology.create_disk(&vm.id, &spec).await.unwrap();

    assert_eq!(disk.status(), DiskStatus::Ok);
    assert_eq!(disk.name(), "root");
}

#[tokio::test]
async fn test_create_snapshot_waits_until_ok() {
    let platform = Arc::new(MemoryPlatform::new().with_settle_polls(2));
    let vm = platform.add_vm("web", 1 << 30);
    platform.add_disk(&vm.id, "root", 10 << 30);
    let topology = topology(&platform);

    let request = SnapshotRequest {
        description: "backup".to_string(),
        persist_memory: false,
        attachments: Vec::new(),
    };
    let snapshot = topology.create_snapshot(&vm.id, &request).await.unwrap();

    assert!(!snapshot.is_active());
    assert_eq!(snapshot.description, "backup");
    assert!(topology.all_disks_ready(&vm.id, &snapshot.id).await.unwrap());
}

#[tokio::test]
async fn test_settings_capture_chains_in_date_order() {
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 4 << 30);
    let root = platform.add_disk(&vm.id, "root", 10 << 30);
    platform.take_snapshot(&vm.id, "s1");
    let data = platform.add_disk(&vm.id, "data", 20 << 30);
    platform.take_snapshot(&vm.id, "s2");
    let topology = topology(&platform);

    let settings = topology.settings(&vm).await.unwrap();

    assert_eq!(settings.name, "web");
    assert_eq!(settings.memory, 4 << 30);
    assert_eq!(settings.snapshot_sequence.len(), 2);
    assert_eq!(settings.snapshot_sequence[0].description, "s1");
    assert_eq!(settings.snapshot_sequence[1].image_ids.len(), 2);
    assert_eq!(settings.chains[root.id()].len(), 2);
    assert_eq!(settings.chains[data.id()].len(), 1);
    assert_eq!(settings.chains[root.id()][0], root.image_id());
    settings.validate().unwrap();
}
