// Re-export dependencies used in public interfaces of common types

use async_trait::async_trait;
pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod model;

pub use model::{
    Disk, DiskAttachment, DiskFormat, DiskInfo, DiskSource, DiskSpec, DiskStatus, Snapshot,
    SnapshotRequest, SnapshotStatus, SnapshotType, TransferDirection, TransferHandle,
    TransferPhase, TransferTarget, Vm, VmSpec,
};

#[derive(Error, Debug)]
pub enum SaviorError {
    #[error("Backing file {backing} of {file} not found in image directory")]
    MissingBackingFile { file: String, backing: String },

    #[error("Chain rooted at {ancestor} has no image at depth {depth}")]
    ChainGap { ancestor: String, depth: usize },

    #[error("Images {first} and {second} both sit at depth {depth} under {ancestor}")]
    DuplicateDepth {
        ancestor: String,
        depth: usize,
        first: String,
        second: String,
    },

    #[error("Backing-file cycle detected starting at {0}")]
    BackingCycle(String),

    #[error("No new disk recorded for base disk {base_disk_id} (needed by image {image_id})")]
    MissingDiskMapping {
        base_disk_id: String,
        image_id: String,
    },

    #[error("Saved settings are inconsistent: {0}")]
    InconsistentSettings(String),

    #[error("VM {0} not found")]
    VmNotFound(String),

    #[error("A VM named {0} already exists")]
    VmAlreadyExists(String),

    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("Disk {disk_id} is not ready (status: {status:?})")]
    DiskNotReady { disk_id: String, status: DiskStatus },

    #[error("Transfer endpoint did not report a content length")]
    MissingContentLength,

    #[error("Transfer size mismatch: expected {expected} bytes, moved {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Transfer {id} ended in phase {phase:?} before data could move")]
    TransferAborted { id: String, phase: TransferPhase },

    #[error("HTTP Error: {0}")]
    Http(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Platform Error: {0}")]
    Platform(String),

    #[error("Image tool Error: {0}")]
    ImageTool(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl SaviorError {
    /// True for errors caused by inconsistent input data rather than by the
    /// environment. These are never worth retrying.
    pub fn is_input_inconsistency(&self) -> bool {
        matches!(
            self,
            SaviorError::MissingBackingFile { .. }
                | SaviorError::ChainGap { .. }
                | SaviorError::DuplicateDepth { .. }
                | SaviorError::BackingCycle(_)
                | SaviorError::MissingDiskMapping { .. }
                | SaviorError::InconsistentSettings(_)
        )
    }
}

// Define the primary Result type for savior operations
pub type Result<T> = std::result::Result<T, SaviorError>;

/// Narrow view of the virtualization management platform used by the engine.
///
/// Every call maps to one platform request. Waiting for objects to settle is
/// the caller's job (see the engine's poll helper).
#[async_trait]
pub trait Platform: Send + Sync {
    /// List VMs, optionally filtered by a platform search expression.
    async fn list_vms(&self, search: Option<&str>) -> Result<Vec<Vm>>;

    async fn create_vm(&self, spec: &VmSpec) -> Result<Vm>;

    /// Snapshots of a VM in the platform's own listing order.
    async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>>;

    async fn create_snapshot(&self, vm_id: &str, request: &SnapshotRequest) -> Result<Snapshot>;

    async fn remove_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()>;

    async fn list_snapshot_disks(&self, vm_id: &str, snapshot_id: &str) -> Result<Vec<Disk>>;

    /// Create a disk on a storage domain and attach it to the VM.
    async fn create_disk(&self, vm_id: &str, spec: &DiskSpec) -> Result<Disk>;

    /// Current status of a disk, queried through the endpoint matching its source.
    async fn disk_status(&self, disk: &Disk) -> Result<DiskStatus>;

    async fn open_transfer(
        &self,
        target: &TransferTarget,
        direction: TransferDirection,
    ) -> Result<TransferHandle>;

    async fn get_transfer(&self, transfer_id: &str) -> Result<TransferHandle>;

    async fn finalize_transfer(&self, transfer_id: &str) -> Result<()>;

    async fn list_transfers(&self) -> Result<Vec<TransferHandle>>;
}
