//! The backup and restore jobs.

use crate::context::JobContext;
use crate::{JobError, JobMode};
use savior_common::{Platform, SaviorError, Snapshot, SnapshotRequest, TransferDirection, Vm};
use savior_engine::transfer::TransferProgress;
use savior_engine::{
    commit_chains, finalize_all_transfers, transfer_disk, RestoreConfig, RestoreEngine,
    RestoredVm, SettingsStore,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub vm: Vm,
    pub snapshot: Snapshot,
    pub settings_path: PathBuf,
    pub images: usize,
    pub downloaded_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub restored: RestoredVm,
    pub copied_bytes: u64,
    pub committed_chains: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotReport {
    pub vm: Vm,
    pub snapshot: Snapshot,
}

/// Replace the backup snapshot of the VM and stop there. Nothing is
/// downloaded and no settings are written.
#[instrument(skip(ctx), fields(job_id = %Uuid::new_v4(), vm = %ctx.config.vm.name))]
pub async fn backup_temp<P: Platform + ?Sized>(
    ctx: &JobContext<P>,
) -> Result<SnapshotReport, JobError> {
    ctx.config.validate(JobMode::BackupTemp)?;
    let (vm, snapshot) = take_backup_snapshot(ctx).await?;
    info!(snapshot_id = %snapshot.id, "Backup snapshot taken");
    Ok(SnapshotReport { vm, snapshot })
}

/// Snapshot the VM, then download every image of every snapshot and save
/// the settings next to them.
///
/// A snapshot left over from a previous run with the same description is
/// removed first.
#[instrument(skip(ctx), fields(job_id = %Uuid::new_v4(), vm = %ctx.config.vm.name))]
pub async fn backup<P: Platform + ?Sized>(ctx: &JobContext<P>) -> Result<BackupReport, JobError> {
    ctx.config.validate(JobMode::Backup)?;
    let (vm, snapshot) = take_backup_snapshot(ctx).await?;
    let topology = ctx.topology();

    let settings = topology.settings(&vm).await?;
    settings.validate()?;

    let working_dir = ctx.config.working_dir();
    if fs::try_exists(&working_dir).await? {
        warn!(
            dir = %working_dir.display(),
            "Working directory exists, contents may be overwritten"
        );
    } else {
        fs::create_dir_all(&working_dir).await?;
    }

    let transfer = ctx.config.transfer_config();
    let mut seen = BTreeSet::new();
    let mut downloaded_bytes = 0;
    for record in &settings.snapshot_sequence {
        for disk in topology.list_disks(&vm.id, &record.id).await? {
            if !seen.insert(disk.image_id().to_string()) {
                continue;
            }
            let path = working_dir.join(disk.image_id());
            downloaded_bytes += transfer_disk(
                Arc::clone(&ctx.platform),
                &ctx.http,
                &transfer,
                TransferDirection::Download,
                &disk,
                &path,
            )
            .await?;
        }
    }

    let settings_path = SettingsStore::new(&working_dir).save(&settings).await?;
    info!(
        images = seen.len(),
        downloaded_bytes,
        settings = %settings_path.display(),
        "Backup complete"
    );

    Ok(BackupReport {
        vm,
        snapshot,
        settings_path,
        images: seen.len(),
        downloaded_bytes,
    })
}

/// Look up the VM, drop a stale snapshot with the backup description and
/// take a fresh one, waiting until its disks are ready.
async fn take_backup_snapshot<P: Platform + ?Sized>(
    ctx: &JobContext<P>,
) -> Result<(Vm, Snapshot), JobError> {
    let description = match &ctx.config.snapshot {
        Some(section) => section.description.clone(),
        None => return Err(JobError::InvalidConfig("missing snapshot section".to_string())),
    };
    let topology = ctx.topology();

    let vm = topology.find_vm_by_name(&ctx.config.vm.name).await?;
    info!(vm_id = %vm.id, "Found VM");

    if topology
        .remove_snapshot_by_description(&vm.id, &description)
        .await?
    {
        info!(%description, "Removed stale backup snapshot");
    }

    let request = SnapshotRequest {
        description,
        persist_memory: false,
        attachments: Vec::new(),
    };
    let snapshot = topology.create_snapshot(&vm.id, &request).await?;
    topology.wait_for_all_disks_ready(&vm.id, &snapshot.id).await?;
    Ok((vm, snapshot))
}

/// Rebuild the saved VM from the working directory.
///
/// The downloaded images are copied to the local directory and flattened
/// there, so the working directory is left as the backup wrote it.
#[instrument(skip(ctx), fields(job_id = %Uuid::new_v4(), vm = %ctx.config.vm.name))]
pub async fn restore<P: Platform + ?Sized>(ctx: &JobContext<P>) -> Result<RestoreReport, JobError> {
    ctx.config.validate(JobMode::Restore)?;
    let (Some(restoration), Some(local_dir)) =
        (ctx.config.restoration.clone(), ctx.config.local_dir())
    else {
        return Err(JobError::InvalidConfig(
            "missing restoration section or local directory".to_string(),
        ));
    };

    let working_dir = ctx.config.working_dir();
    if !fs::try_exists(&working_dir).await? {
        return Err(JobError::InvalidConfig(format!(
            "VM directory {} not found",
            working_dir.display()
        )));
    }
    let settings = SettingsStore::new(&working_dir)
        .load(&ctx.config.vm.name)
        .await?;

    let new_name = restoration
        .new_vm_name
        .clone()
        .unwrap_or_else(|| settings.name.clone());
    info!(%new_name, "VM will be restored under this name");

    let topology = ctx.topology();
    if topology.lookup_vm(&new_name).await?.is_some() {
        return Err(SaviorError::VmAlreadyExists(new_name).into());
    }

    let transfer = ctx.config.transfer_config();
    let copied_bytes = copy_to_local(
        &working_dir,
        &local_dir,
        transfer.chunk_size,
        transfer.report_every,
    )
    .await?;

    let chains = commit_chains(ctx.images.as_ref(), &local_dir).await?;

    let engine = RestoreEngine::new(
        topology,
        ctx.http.clone(),
        RestoreConfig {
            vm_name: Some(new_name),
            cluster: restoration.cluster,
            template: restoration.template,
            image_dir: local_dir,
            transfer,
        },
    );
    let restored = engine
        .reconstruct(&settings, &restoration.storage_domain)
        .await?;

    for (old, new) in &restored.image_mapping {
        info!(old_image_id = %old, new_image_id = %new, "Image restored");
    }

    Ok(RestoreReport {
        restored,
        copied_bytes,
        committed_chains: chains.len(),
    })
}

/// Finalize transfers left open by an interrupted job, so the platform
/// releases the disks they lock.
#[instrument(skip(ctx))]
pub async fn finalize_transfers<P: Platform + ?Sized>(
    ctx: &JobContext<P>,
) -> Result<usize, JobError> {
    Ok(finalize_all_transfers(ctx.platform.as_ref()).await?)
}

/// Copy every regular file of `source` into `dest`, creating `dest` if
/// needed. Returns the number of bytes copied.
pub async fn copy_to_local(
    source: &Path,
    dest: &Path,
    chunk_size: usize,
    report_every: u64,
) -> Result<u64, JobError> {
    info!(from = %source.display(), to = %dest.display(), "Copying images to local directory");
    fs::create_dir_all(dest).await?;

    let mut files = Vec::new();
    let mut entries = fs::read_dir(source).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut copied = 0;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target = dest.join(name);
        copied += copy_file(&file, &target, &mut buffer, report_every).await?;
    }

    info!(bytes = copied, "Images copied to local directory");
    Ok(copied)
}

async fn copy_file(
    source: &Path,
    dest: &Path,
    buffer: &mut [u8],
    report_every: u64,
) -> Result<u64, JobError> {
    let total = fs::metadata(source).await?.len();
    let mut progress = TransferProgress::new(dest.display().to_string(), total, report_every);
    let mut reader = fs::File::open(source).await?;
    let mut writer = fs::File::create(dest).await?;

    loop {
        let read = reader.read(buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        progress.advance(read as u64);
    }
    writer.flush().await?;
    progress.finish();
    Ok(progress.moved())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_to_local_copies_files_only() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("image-1"), vec![1u8; 100]).unwrap();
        std::fs::write(source.path().join("web.json"), b"{}").unwrap();
        std::fs::create_dir(source.path().join("nested")).unwrap();

        let target = dest.path().join("web");
        let copied = copy_to_local(source.path(), &target, 7, u64::MAX)
            .await
            .unwrap();

        assert_eq!(copied, 102);
        assert_eq!(std::fs::read(target.join("image-1")).unwrap(), vec![1u8; 100]);
        assert_eq!(std::fs::read(target.join("web.json")).unwrap(), b"{}");
        assert!(!target.join("nested").exists());
    }
}
