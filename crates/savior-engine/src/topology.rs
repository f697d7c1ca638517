//! VM, snapshot and disk enumeration plus the blocking lifecycle helpers.

use crate::poll::PollConfig;
use crate::settings::SavedSettings;
use savior_common::{
    Disk, DiskSpec, DiskStatus, Platform, Result, SaviorError, Snapshot, SnapshotRequest,
    SnapshotStatus, Vm,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct Topology<P: Platform + ?Sized> {
    platform: Arc<P>,
    poll: PollConfig,
}

impl<P: Platform + ?Sized> Clone for Topology<P> {
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
            poll: self.poll,
        }
    }
}

impl<P: Platform + ?Sized> Topology<P> {
    pub fn new(platform: Arc<P>, poll: PollConfig) -> Self {
        Self { platform, poll }
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn poll(&self) -> &PollConfig {
        &self.poll
    }

    pub async fn lookup_vm(&self, name: &str) -> Result<Option<Vm>> {
        let vms = self
            .platform
            .list_vms(Some(&format!("name={name}")))
            .await?;
        Ok(vms.into_iter().find(|vm| vm.name == name))
    }

    pub async fn find_vm_by_name(&self, name: &str) -> Result<Vm> {
        self.lookup_vm(name)
            .await?
            .ok_or_else(|| SaviorError::VmNotFound(name.to_string()))
    }

    /// Snapshots of `vm_id`, ascending by date.
    pub async fn list_snapshots(&self, vm_id: &str, omit_active: bool) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.platform.list_snapshots(vm_id).await?;
        if omit_active {
            snapshots.retain(|snapshot| !snapshot.is_active());
        }
        snapshots.sort_by_key(|snapshot| snapshot.date);
        Ok(snapshots)
    }

    pub async fn list_disks(&self, vm_id: &str, snapshot_id: &str) -> Result<Vec<Disk>> {
        self.platform.list_snapshot_disks(vm_id, snapshot_id).await
    }

    /// First snapshot in platform order carrying `description`.
    pub async fn find_snapshot_by_description(
        &self,
        vm_id: &str,
        description: &str,
    ) -> Result<Option<Snapshot>> {
        let matches: Vec<Snapshot> = self
            .platform
            .list_snapshots(vm_id)
            .await?
            .into_iter()
            .filter(|snapshot| snapshot.description == description)
            .collect();

        if matches.len() > 1 {
            let ids: Vec<&str> = matches.iter().map(|s| s.id.as_str()).collect();
            warn!(description, ?ids, "Several snapshots share this description, using the first");
        }
        Ok(matches.into_iter().next())
    }

    pub async fn all_disks_ready(&self, vm_id: &str, snapshot_id: &str) -> Result<bool> {
        let disks = self.list_disks(vm_id, snapshot_id).await?;
        Ok(disks.iter().all(Disk::is_ok))
    }

    pub async fn wait_for_all_disks_ready(&self, vm_id: &str, snapshot_id: &str) -> Result<()> {
        let this = self;
        self.poll
            .until("snapshot disks to become ready", move || async move {
                Ok(this.all_disks_ready(vm_id, snapshot_id).await?.then_some(()))
            })
            .await
    }

    /// Submit a snapshot and block until it reports `ok`.
    #[instrument(skip(self, request), fields(description = %request.description))]
    pub async fn create_snapshot(
        &self,
        vm_id: &str,
        request: &SnapshotRequest,
    ) -> Result<Snapshot> {
        let created = self.platform.create_snapshot(vm_id, request).await?;
        let id = created.id.as_str();
        let platform = &self.platform;

        let snapshot = self
            .poll
            .until("snapshot to become ready", move || async move {
                let snapshot = platform
                    .list_snapshots(vm_id)
                    .await?
                    .into_iter()
                    .find(|snapshot| snapshot.id == id)
                    .ok_or_else(|| SaviorError::SnapshotNotFound(id.to_string()))?;
                Ok((snapshot.status == SnapshotStatus::Ok).then_some(snapshot))
            })
            .await?;

        info!(snapshot_id = %snapshot.id, "Snapshot created");
        Ok(snapshot)
    }

    /// Remove the snapshot carrying `description`, if there is one, and wait
    /// until it is gone. Returns whether anything was removed.
    #[instrument(skip(self))]
    pub async fn remove_snapshot_by_description(
        &self,
        vm_id: &str,
        description: &str,
    ) -> Result<bool> {
        let Some(snapshot) = self.find_snapshot_by_description(vm_id, description).await? else {
            debug!("No snapshot to remove");
            return Ok(false);
        };

        self.wait_for_all_disks_ready(vm_id, &snapshot.id).await?;
        self.platform.remove_snapshot(vm_id, &snapshot.id).await?;

        let id = snapshot.id.as_str();
        let platform = &self.platform;
        self.poll
            .until("snapshot removal", move || async move {
                let remaining = platform.list_snapshots(vm_id).await?;
                Ok((!remaining.iter().any(|s| s.id == id)).then_some(()))
            })
            .await?;

        info!(snapshot_id = %snapshot.id, "Snapshot removed");
        Ok(true)
    }

    /// Attach a new disk to `vm_id` and block until it reports `ok`.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create_disk(&self, vm_id: &str, spec: &DiskSpec) -> Result<Disk> {
        let mut disk = self.platform.create_disk(vm_id, spec).await?;
        let platform = &self.platform;
        let pending = &disk;

        self.poll
            .until("disk to become ready", move || async move {
                match platform.disk_status(pending).await? {
                    DiskStatus::Ok => Ok(Some(())),
                    DiskStatus::Locked => Ok(None),
                    status => Err(SaviorError::DiskNotReady {
                        disk_id: pending.id().to_string(),
                        status,
                    }),
                }
            })
            .await?;

        disk.info.status = DiskStatus::Ok;
        info!(disk_id = disk.id(), image_id = disk.image_id(), "Disk created");
        Ok(disk)
    }

    /// Saved settings for `vm`: every non-active snapshot in date order with
    /// its disks.
    #[instrument(skip(self, vm), fields(vm = %vm.name))]
    pub async fn settings(&self, vm: &Vm) -> Result<SavedSettings> {
        let mut settings = SavedSettings::new(vm);
        for snapshot in self.list_snapshots(&vm.id, true).await? {
            debug!(
                snapshot_id = %snapshot.id,
                description = %snapshot.description,
                "Discovered snapshot"
            );
            let disks = self.list_disks(&vm.id, &snapshot.id).await?;
            settings.record_snapshot(&snapshot, &disks);
        }
        info!(
            snapshots = settings.snapshot_sequence.len(),
            images = settings.disk_info.len(),
            "Read VM settings"
        );
        Ok(settings)
    }
}
