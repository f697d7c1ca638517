//! Backup and restore jobs end to end against in-memory collaborators.

use mockito::Server;
use savior_common::SaviorError;
use savior_engine::testing::{MemoryImageTool, MemoryPlatform};
use savior_engine::SettingsStore;
use savior_lib::jobs::{backup, backup_temp, finalize_transfers, restore};
use savior_lib::{JobConfig, JobContext, JobError};
use std::path::Path;
use std::sync::Arc;

fn config(working: &Path, local: &Path) -> JobConfig {
    let raw = format!(
        r#"
connection:
  url: https://engine.test/ovirt-engine/api
  username: admin@internal
  password: secret
directories:
  working_directory: {}
  local_directory: {}
transfer:
  chunk_size: 16
poll:
  interval_secs: 1
  timeout_secs: 30
vm:
  name: web
snapshot:
  description: nightly
restoration:
  storage_domain: data
  cluster: Default
  new_vm_name: web-restored
"#,
        working.display(),
        local.display()
    );
    JobConfig::from_yaml_str(&raw).unwrap()
}

fn count(calls: &[String], prefix: &str) -> usize {
    calls.iter().filter(|call| call.starts_with(prefix)).count()
}

#[tokio::test]
async fn test_backup_then_restore() {
    let working = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let config = config(working.path(), local.path());
    let mut server = Server::new_async().await;

    // Backup from the source platform.
    let downloads = server
        .mock("GET", "/images/t")
        .with_status(200)
        .with_body(vec![9u8; 64])
        .expect(2)
        .create_async()
        .await;
    let source = Arc::new(
        MemoryPlatform::new().with_transfer_url(format!("{}/images/t", server.url())),
    );
    let vm = source.add_vm("web", 2 << 30);
    source.add_disk(&vm.id, "root", 10 << 30);
    source.take_snapshot(&vm.id, "s1");
    let stale = source.take_snapshot(&vm.id, "nightly");

    let ctx = JobContext::new(
        config.clone(),
        Arc::clone(&source),
        reqwest::Client::new(),
        Arc::new(MemoryImageTool::new()),
    );
    let report = backup(&ctx).await.unwrap();

    assert_eq!(report.vm.id, vm.id);
    assert_eq!(report.images, 2);
    assert_eq!(report.downloaded_bytes, 128);
    assert_eq!(report.settings_path, working.path().join("web").join("web.json"));
    let calls = source.calls();
    assert_eq!(calls[0], format!("remove_snapshot {}", stale.id));
    assert_eq!(calls[1], "create_snapshot nightly");
    assert_eq!(count(&calls, "open_transfer download"), 2);
    assert_eq!(count(&calls, "finalize_transfer"), 2);
    downloads.assert_async().await;

    // Restore onto a fresh target platform.
    let settings = SettingsStore::new(working.path().join("web"))
        .load("web")
        .await
        .unwrap();
    let descriptions: Vec<&str> = settings
        .snapshot_sequence
        .iter()
        .map(|record| record.description.as_str())
        .collect();
    assert_eq!(descriptions, ["s1", "nightly"]);

    let mut tool = MemoryImageTool::new();
    for chain in settings.chains.values() {
        let mut parent: Option<&str> = None;
        for image in chain {
            tool = tool.with_image(image, parent);
            parent = Some(image);
        }
    }
    let tool = Arc::new(tool);

    let uploads = server
        .mock("PUT", "/images/t")
        .with_status(200)
        .expect(4)
        .create_async()
        .await;
    let target = Arc::new(
        MemoryPlatform::new().with_transfer_url(format!("{}/images/t", server.url())),
    );
    let ctx = JobContext::new(
        config,
        Arc::clone(&target),
        reqwest::Client::new(),
        tool.clone(),
    );
    let report = restore(&ctx).await.unwrap();

    assert_eq!(report.committed_chains, 1);
    assert!(report.copied_bytes > 128);
    assert_eq!(report.restored.vm.name, "web-restored");
    assert_eq!(report.restored.snapshots.len(), 2);
    assert_eq!(report.restored.uploaded_bytes, 64);
    assert_eq!(report.restored.image_mapping.len(), 2);

    let leaf = settings.chains.values().next().unwrap().last().unwrap();
    assert!(tool.calls().contains(&format!("commit {leaf}")));
    assert!(local.path().join("web").join("web.json").exists());
    assert_eq!(count(&target.calls(), "create_disk root"), 1);
    uploads.assert_async().await;
}

#[tokio::test]
async fn test_restore_refuses_taken_name_before_copying() {
    let working = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let config = config(working.path(), local.path());

    let saved = MemoryPlatform::new();
    let vm = saved.add_vm("web", 1 << 30);
    let settings = savior_engine::SavedSettings::new(&vm);
    SettingsStore::new(working.path().join("web"))
        .save(&settings)
        .await
        .unwrap();

    let target = Arc::new(MemoryPlatform::new());
    target.add_vm("web-restored", 1 << 30);
    let ctx = JobContext::new(
        config,
        Arc::clone(&target),
        reqwest::Client::new(),
        Arc::new(MemoryImageTool::new()),
    );

    let err = restore(&ctx).await.unwrap_err();

    assert!(matches!(
        err,
        JobError::Engine(SaviorError::VmAlreadyExists(name)) if name == "web-restored"
    ));
    assert!(!local.path().join("web").exists());
    assert!(target.calls().is_empty());
}

#[tokio::test]
async fn test_backup_temp_only_replaces_snapshot() {
    let working = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let platform = Arc::new(MemoryPlatform::new());
    let vm = platform.add_vm("web", 2 << 30);
    platform.add_disk(&vm.id, "root", 10 << 30);
    let stale = platform.take_snapshot(&vm.id, "nightly");
    let ctx = JobContext::new(
        config(working.path(), local.path()),
        Arc::clone(&platform),
        reqwest::Client::new(),
        Arc::new(MemoryImageTool::new()),
    );

    let report = backup_temp(&ctx).await.unwrap();

    assert_eq!(report.vm.id, vm.id);
    assert_eq!(report.snapshot.description, "nightly");
    assert_ne!(report.snapshot.id, stale.id);
    let calls = platform.calls();
    assert_eq!(calls[0], format!("remove_snapshot {}", stale.id));
    assert_eq!(calls[1], "create_snapshot nightly");
    assert_eq!(count(&calls, "open_transfer"), 0);
    assert!(!working.path().join("web").exists());
}

#[tokio::test]
async fn test_backup_of_unknown_vm_fails() {
    let working = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let platform = Arc::new(MemoryPlatform::new());
    let ctx = JobContext::new(
        config(working.path(), local.path()),
        Arc::clone(&platform),
        reqwest::Client::new(),
        Arc::new(MemoryImageTool::new()),
    );

    let err = backup(&ctx).await.unwrap_err();

    assert!(matches!(err, JobError::Engine(SaviorError::VmNotFound(_))));
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn test_finalize_transfers_closes_open_handles() {
    let working = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let platform = Arc::new(MemoryPlatform::new());
    let target = savior_common::TransferTarget::Disk {
        disk_id: "disk-1".to_string(),
    };
    savior_common::Platform::open_transfer(
        platform.as_ref(),
        &target,
        savior_common::TransferDirection::Upload,
    )
    .await
    .unwrap();

    let ctx = JobContext::new(
        config(working.path(), local.path()),
        Arc::clone(&platform),
        reqwest::Client::new(),
        Arc::new(MemoryImageTool::new()),
    );

    assert_eq!(finalize_transfers(&ctx).await.unwrap(), 1);
    assert_eq!(finalize_transfers(&ctx).await.unwrap(), 0);
}
