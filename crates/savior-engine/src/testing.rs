//! In-memory [`Platform`] and [`ImageTool`] for exercising the engine
//! without an oVirt engine or `qemu-img`.

use crate::image::{ImageInfo, ImageTool};
use async_trait::async_trait;
use savior_common::chrono::{Duration as ChronoDuration, Utc};
use savior_common::{
    Disk, DiskInfo, DiskSource, DiskSpec, DiskStatus, Platform, Result, SaviorError, Snapshot,
    SnapshotRequest, SnapshotStatus, SnapshotType, TransferDirection, TransferHandle,
    TransferPhase, TransferTarget, Vm, VmSpec,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredSnapshot {
    snapshot: Snapshot,
    /// Disk id -> image id captured by this snapshot.
    images: Vec<(String, String)>,
    pending_polls: usize,
}

#[derive(Debug, Clone)]
struct StoredDisk {
    info: DiskInfo,
    vm_id: String,
    pending_polls: usize,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    clock: i64,
    vms: Vec<Vm>,
    snapshots: BTreeMap<String, Vec<StoredSnapshot>>,
    disks: Vec<StoredDisk>,
    /// Image id -> attributes of that image, for every image ever created.
    images: BTreeMap<String, DiskInfo>,
    transfers: Vec<TransferHandle>,
    calls: Vec<String>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Platform double holding VMs, disks, snapshots and transfers in memory.
///
/// Snapshots capture the current image of each included disk and give that
/// disk a fresh active image, so replayed snapshot sequences produce real
/// chains. New disks and snapshots report `locked` for `settle_polls` status
/// queries before turning `ok`.
#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
    settle_polls: usize,
    transfer_url: Option<String>,
    transfer_outcome: Option<TransferPhase>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle_polls(mut self, polls: usize) -> Self {
        self.settle_polls = polls;
        self
    }

    /// URL handed out by every transfer handle.
    pub fn with_transfer_url(mut self, url: impl Into<String>) -> Self {
        self.transfer_url = Some(url.into());
        self
    }

    /// Phase transfers move to after `initializing`. Defaults to
    /// `transferring`.
    pub fn with_transfer_outcome(mut self, phase: TransferPhase) -> Self {
        self.transfer_outcome = Some(phase);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every mutating call, in order, as `"<operation> <subject>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn vms(&self) -> Vec<Vm> {
        self.lock().vms.clone()
    }

    pub fn transfers(&self) -> Vec<TransferHandle> {
        self.lock().transfers.clone()
    }

    pub fn add_vm(&self, name: &str, memory: u64) -> Vm {
        let mut state = self.lock();
        let vm = Vm {
            id: state.next_id("vm"),
            name: name.to_string(),
            cpu_architecture: Some("x86_64".to_string()),
            memory,
        };
        state.vms.push(vm.clone());
        vm
    }

    /// Attach a ready disk to `vm_id` without going through `create_disk`.
    pub fn add_disk(&self, vm_id: &str, name: &str, provisioned_size: u64) -> Disk {
        let mut state = self.lock();
        let info = DiskInfo {
            id: state.next_id("disk"),
            image_id: state.next_id("image"),
            name: name.to_string(),
            description: None,
            format: savior_common::DiskFormat::Cow,
            sparse: true,
            provisioned_size,
            actual_size: provisioned_size / 10,
            initial_size: None,
            interface: Some("virtio_scsi".to_string()),
            total_size: None,
            status: DiskStatus::Ok,
        };
        state.images.insert(info.image_id.clone(), info.clone());
        state.disks.push(StoredDisk {
            info: info.clone(),
            vm_id: vm_id.to_string(),
            pending_polls: 0,
        });
        Disk {
            info,
            source: DiskSource::Plain,
        }
    }

    /// Take a snapshot including every disk of `vm_id`, immediately ready.
    pub fn take_snapshot(&self, vm_id: &str, description: &str) -> Snapshot {
        let mut state = self.lock();
        let disk_ids: Vec<String> = state
            .disks
            .iter()
            .filter(|disk| disk.vm_id == vm_id)
            .map(|disk| disk.info.id.clone())
            .collect();
        snapshot_disks(&mut state, vm_id, description, &disk_ids, 0)
    }
}

fn snapshot_disks(
    state: &mut State,
    vm_id: &str,
    description: &str,
    disk_ids: &[String],
    pending_polls: usize,
) -> Snapshot {
    state.clock += 60;
    let snapshot = Snapshot {
        id: state.next_id("snap"),
        description: description.to_string(),
        date: Utc::now() + ChronoDuration::seconds(state.clock),
        snapshot_type: SnapshotType::Regular,
        status: if pending_polls > 0 {
            SnapshotStatus::Locked
        } else {
            SnapshotStatus::Ok
        },
    };

    let mut images = Vec::new();
    for disk_id in disk_ids {
        let fresh_image = state.next_id("image");
        let Some(disk) = state.disks.iter_mut().find(|disk| &disk.info.id == disk_id) else {
            continue;
        };
        let captured = disk.info.clone();
        disk.info.image_id = fresh_image;
        let fresh = disk.info.clone();
        images.push((captured.id.clone(), captured.image_id.clone()));
        state.images.insert(captured.image_id.clone(), captured);
        state.images.insert(fresh.image_id.clone(), fresh);
    }

    state
        .snapshots
        .entry(vm_id.to_string())
        .or_default()
        .push(StoredSnapshot {
            snapshot: snapshot.clone(),
            images,
            pending_polls,
        });
    snapshot
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn list_vms(&self, search: Option<&str>) -> Result<Vec<Vm>> {
        let name = search.and_then(|s| s.strip_prefix("name="));
        Ok(self
            .lock()
            .vms
            .iter()
            .filter(|vm| name.map_or(true, |name| vm.name == name))
            .cloned()
            .collect())
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<Vm> {
        let mut state = self.lock();
        state.calls.push(format!("create_vm {}", spec.name));
        let vm = Vm {
            id: state.next_id("vm"),
            name: spec.name.clone(),
            cpu_architecture: None,
            memory: spec.memory.unwrap_or_default(),
        };
        state.vms.push(vm.clone());
        Ok(vm)
    }

    async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let mut state = self.lock();
        if !state.vms.iter().any(|vm| vm.id == vm_id) {
            return Err(SaviorError::VmNotFound(vm_id.to_string()));
        }
        let mut listed: Vec<Snapshot> = Vec::new();
        for stored in state.snapshots.entry(vm_id.to_string()).or_default() {
            if stored.pending_polls > 0 {
                stored.pending_polls -= 1;
            } else {
                stored.snapshot.status = SnapshotStatus::Ok;
            }
            listed.push(stored.snapshot.clone());
        }
        // Platforms list the active snapshot first.
        listed.insert(
            0,
            Snapshot {
                id: format!("{vm_id}-active"),
                description: "Active VM".to_string(),
                date: Utc::now() + ChronoDuration::days(365),
                snapshot_type: SnapshotType::Active,
                status: SnapshotStatus::Ok,
            },
        );
        Ok(listed)
    }

    async fn create_snapshot(&self, vm_id: &str, request: &SnapshotRequest) -> Result<Snapshot> {
        let mut state = self.lock();
        state.calls.push(format!("create_snapshot {}", request.description));
        let disk_ids: Vec<String> = if request.attachments.is_empty() {
            state
                .disks
                .iter()
                .filter(|disk| disk.vm_id == vm_id)
                .map(|disk| disk.info.id.clone())
                .collect()
        } else {
            request
                .attachments
                .iter()
                .map(|attachment| attachment.disk_id().to_string())
                .collect()
        };
        for disk_id in &disk_ids {
            if !state.disks.iter().any(|disk| &disk.info.id == disk_id) {
                return Err(SaviorError::Platform(format!("unknown disk {disk_id}")));
            }
        }
        let pending = self.settle_polls;
        Ok(snapshot_disks(&mut state, vm_id, &request.description, &disk_ids, pending))
    }

    async fn remove_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("remove_snapshot {snapshot_id}"));
        let snapshots = state.snapshots.entry(vm_id.to_string()).or_default();
        let before = snapshots.len();
        snapshots.retain(|stored| stored.snapshot.id != snapshot_id);
        if snapshots.len() == before {
            return Err(SaviorError::SnapshotNotFound(snapshot_id.to_string()));
        }
        Ok(())
    }

    async fn list_snapshot_disks(&self, vm_id: &str, snapshot_id: &str) -> Result<Vec<Disk>> {
        let state = self.lock();
        let stored = state
            .snapshots
            .get(vm_id)
            .and_then(|snapshots| snapshots.iter().find(|s| s.snapshot.id == snapshot_id))
            .ok_or_else(|| SaviorError::SnapshotNotFound(snapshot_id.to_string()))?;

        stored
            .images
            .iter()
            .map(|(_, image_id)| {
                let info = state.images.get(image_id).cloned().ok_or_else(|| {
                    SaviorError::Platform(format!("unknown image {image_id}"))
                })?;
                Ok(Disk {
                    info,
                    source: DiskSource::Snapshot {
                        vm_id: vm_id.to_string(),
                        snapshot_id: snapshot_id.to_string(),
                    },
                })
            })
            .collect()
    }

    async fn create_disk(&self, vm_id: &str, spec: &DiskSpec) -> Result<Disk> {
        let mut state = self.lock();
        state.calls.push(format!("create_disk {}", spec.name));
        let status = if self.settle_polls > 0 {
            DiskStatus::Locked
        } else {
            DiskStatus::Ok
        };
        let info = DiskInfo {
            id: state.next_id("disk"),
            image_id: state.next_id("image"),
            name: spec.name.clone(),
            description: spec.description.clone(),
            format: spec.format,
            sparse: spec.sparse,
            provisioned_size: spec.provisioned_size,
            actual_size: spec.initial_size.unwrap_or_default(),
            initial_size: spec.initial_size,
            interface: Some(spec.interface.clone()),
            total_size: None,
            status,
        };
        state.images.insert(info.image_id.clone(), info.clone());
        state.disks.push(StoredDisk {
            info: info.clone(),
            vm_id: vm_id.to_string(),
            pending_polls: self.settle_polls,
        });
        Ok(Disk {
            info,
            source: DiskSource::Plain,
        })
    }

    async fn disk_status(&self, disk: &Disk) -> Result<DiskStatus> {
        let mut state = self.lock();
        let stored = state
            .disks
            .iter_mut()
            .find(|stored| stored.info.id == disk.id())
            .ok_or_else(|| SaviorError::Platform(format!("unknown disk {}", disk.id())))?;
        if stored.pending_polls > 0 {
            stored.pending_polls -= 1;
            return Ok(DiskStatus::Locked);
        }
        stored.info.status = DiskStatus::Ok;
        Ok(DiskStatus::Ok)
    }

    async fn open_transfer(
        &self,
        target: &TransferTarget,
        direction: TransferDirection,
    ) -> Result<TransferHandle> {
        let mut state = self.lock();
        let subject = match target {
            TransferTarget::Disk { disk_id } => disk_id,
            TransferTarget::SnapshotDisk { image_id } => image_id,
        };
        state.calls.push(format!("open_transfer {direction} {subject}"));
        let handle = TransferHandle {
            id: state.next_id("transfer"),
            url: self.transfer_url.clone(),
            phase: TransferPhase::Initializing,
        };
        state.transfers.push(handle.clone());
        Ok(handle)
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<TransferHandle> {
        let outcome = self.transfer_outcome.unwrap_or(TransferPhase::Transferring);
        let mut state = self.lock();
        let handle = state
            .transfers
            .iter_mut()
            .find(|handle| handle.id == transfer_id)
            .ok_or_else(|| SaviorError::Platform(format!("unknown transfer {transfer_id}")))?;
        if handle.phase == TransferPhase::Initializing {
            handle.phase = outcome;
        }
        Ok(handle.clone())
    }

    async fn finalize_transfer(&self, transfer_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("finalize_transfer {transfer_id}"));
        let handle = state
            .transfers
            .iter_mut()
            .find(|handle| handle.id == transfer_id)
            .ok_or_else(|| SaviorError::Platform(format!("unknown transfer {transfer_id}")))?;
        handle.phase = TransferPhase::Finalized;
        Ok(())
    }

    async fn list_transfers(&self) -> Result<Vec<TransferHandle>> {
        Ok(self.lock().transfers.clone())
    }
}

/// Image tool double backed by a name -> metadata table.
///
/// `inspect` looks files up by file name, so tests create empty files in a
/// scratch directory and describe them here.
#[derive(Debug, Default)]
pub struct MemoryImageTool {
    images: Mutex<BTreeMap<String, ImageInfo>>,
    calls: Mutex<Vec<String>>,
    fail_on: Option<(String, String)>,
}

impl MemoryImageTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe `name` as a qcow2 image backed by `backing`.
    pub fn with_image(mut self, name: &str, backing: Option<&str>) -> Self {
        if let Ok(images) = self.images.get_mut() {
            images.insert(
                name.to_string(),
                ImageInfo {
                    virtual_size: 1 << 30,
                    actual_size: 1 << 20,
                    format: "qcow2".to_string(),
                    backing_file: backing.map(str::to_string),
                },
            );
        }
        self
    }

    /// Make `operation` (`inspect`, `rebase` or `commit`) fail for `name`.
    pub fn failing_on(mut self, operation: &str, name: &str) -> Self {
        self.fail_on = Some((operation.to_string(), name.to_string()));
        self
    }

    /// Every operation, in order, as `"<operation> <file name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, operation: &str, file: &Path) -> Result<String> {
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{operation} {name}"));
        }
        if let Some((failing, target)) = &self.fail_on {
            if failing == operation && target == &name {
                return Err(SaviorError::ImageTool(format!("{operation} failed for {name}")));
            }
        }
        Ok(name)
    }
}

#[async_trait]
impl ImageTool for MemoryImageTool {
    async fn inspect(&self, file: &Path) -> Result<ImageInfo> {
        let name = self.record("inspect", file)?;
        let images = self
            .images
            .lock()
            .map_err(|_| SaviorError::ImageTool("image table poisoned".to_string()))?;
        let info = images.get(&name).cloned();
        info.ok_or_else(|| SaviorError::ImageTool(format!("no image {name}")))
    }

    async fn rebase(&self, file: &Path, backing: &str, _backing_format: &str) -> Result<()> {
        let name = self.record("rebase", file)?;
        if let Ok(mut images) = self.images.lock() {
            if let Some(info) = images.get_mut(&name) {
                info.backing_file = Some(backing.to_string());
            }
        }
        Ok(())
    }

    async fn commit(&self, file: &Path) -> Result<()> {
        self.record("commit", file)?;
        Ok(())
    }
}
