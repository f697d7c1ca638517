//! Entity model shared by the platform client, the engine and the jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub cpu_architecture: Option<String>,
    /// Memory in bytes.
    pub memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    Regular,
    /// The live, mutable state of the VM. Has no stable disk chain.
    Active,
    Preview,
    Stateless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Ok,
    Locked,
    InPreview,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub snapshot_type: SnapshotType,
    pub status: SnapshotStatus,
}

impl Snapshot {
    pub fn is_active(&self) -> bool {
        self.snapshot_type == SnapshotType::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    /// Copy-on-write (qcow2 on file storage).
    Cow,
}

impl DiskFormat {
    /// Format name as understood by qemu-img.
    pub fn qemu_name(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Cow => "qcow2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Locked,
    Ok,
    Illegal,
}

/// Where a disk was observed. Decides which id a transfer is opened against
/// and which endpoint answers status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiskSource {
    /// A disk attached to a VM.
    Plain,
    /// A disk as seen within one snapshot of a VM.
    Snapshot { vm_id: String, snapshot_id: String },
}

/// Full attribute set of one disk image, as stored in the saved settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub id: String,
    pub image_id: String,
    pub name: String,
    pub description: Option<String>,
    pub format: DiskFormat,
    pub sparse: bool,
    pub provisioned_size: u64,
    pub actual_size: u64,
    pub initial_size: Option<u64>,
    pub interface: Option<String>,
    pub total_size: Option<u64>,
    pub status: DiskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    #[serde(flatten)]
    pub info: DiskInfo,
    pub source: DiskSource,
}

impl Disk {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn image_id(&self) -> &str {
        &self.info.image_id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn status(&self) -> DiskStatus {
        self.info.status
    }

    pub fn is_ok(&self) -> bool {
        self.info.status == DiskStatus::Ok
    }

    /// Transfer target matching this disk's source.
    pub fn transfer_target(&self) -> TransferTarget {
        match &self.source {
            DiskSource::Plain => TransferTarget::Disk {
                disk_id: self.info.id.clone(),
            },
            DiskSource::Snapshot { .. } => TransferTarget::SnapshotDisk {
                image_id: self.info.image_id.clone(),
            },
        }
    }
}

impl std::fmt::Display for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source {
            DiskSource::Plain => write!(f, "Disk {} with id: {}", self.name(), self.image_id()),
            DiskSource::Snapshot { .. } => write!(
                f,
                "Snapshot disk {} with id: {}",
                self.name(),
                self.image_id()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cluster: String,
    pub template: String,
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    pub description: Option<String>,
    pub format: DiskFormat,
    pub sparse: bool,
    pub provisioned_size: u64,
    pub initial_size: Option<u64>,
    pub storage_domain: String,
    pub bootable: bool,
    pub interface: String,
}

impl DiskSpec {
    /// Spec for recreating a saved disk on `storage_domain`.
    pub fn from_saved(info: &DiskInfo, storage_domain: &str) -> Self {
        Self {
            name: info.name.clone(),
            description: info.description.clone(),
            format: info.format,
            sparse: info.sparse,
            provisioned_size: info.provisioned_size,
            initial_size: Some(info.actual_size),
            storage_domain: storage_domain.to_string(),
            bootable: false,
            interface: "virtio_scsi".to_string(),
        }
    }
}

/// One disk attachment of an "add snapshot" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiskAttachment {
    /// Reference an existing disk of the VM by id.
    Existing { disk_id: String },
    /// New delta layer on top of the disk `disk_id`.
    Delta {
        disk_id: String,
        name: String,
        provisioned_size: u64,
        actual_size: u64,
        format: DiskFormat,
        sparse: bool,
    },
}

impl DiskAttachment {
    pub fn disk_id(&self) -> &str {
        match self {
            DiskAttachment::Existing { disk_id } | DiskAttachment::Delta { disk_id, .. } => {
                disk_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub description: String,
    pub persist_memory: bool,
    pub attachments: Vec<DiskAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Upload => f.write_str("upload"),
            TransferDirection::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Initializing,
    Transferring,
    Finalized,
    Cancelled,
}

impl TransferPhase {
    /// Fold a platform phase name into one of the four lifecycle phases.
    pub fn from_platform(phase: &str) -> Self {
        match phase {
            "initializing" | "resuming" => TransferPhase::Initializing,
            "transferring" | "paused_system" | "paused_user" => TransferPhase::Transferring,
            "cancelled" | "cancelled_system" | "cancelled_user" | "finished_failure"
            | "finalizing_failure" | "unknown" => TransferPhase::Cancelled,
            _ => TransferPhase::Finalized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferTarget {
    Disk { disk_id: String },
    SnapshotDisk { image_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHandle {
    pub id: String,
    pub url: Option<String>,
    pub phase: TransferPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(source: DiskSource) -> Disk {
        Disk {
            info: DiskInfo {
                id: "d1".to_string(),
                image_id: "i1".to_string(),
                name: "root".to_string(),
                description: None,
                format: DiskFormat::Cow,
                sparse: true,
                provisioned_size: 1 << 30,
                actual_size: 1 << 20,
                initial_size: None,
                interface: None,
                total_size: None,
                status: DiskStatus::Ok,
            },
            source,
        }
    }

    #[test]
    fn test_transfer_target_follows_source() {
        assert_eq!(
            disk(DiskSource::Plain).transfer_target(),
            TransferTarget::Disk {
                disk_id: "d1".to_string()
            }
        );
        let snap = disk(DiskSource::Snapshot {
            vm_id: "vm".to_string(),
            snapshot_id: "s1".to_string(),
        });
        assert_eq!(
            snap.transfer_target(),
            TransferTarget::SnapshotDisk {
                image_id: "i1".to_string()
            }
        );
        assert_eq!(snap.to_string(), "Snapshot disk root with id: i1");
    }

    #[test]
    fn test_phase_folding() {
        assert_eq!(
            TransferPhase::from_platform("initializing"),
            TransferPhase::Initializing
        );
        assert_eq!(
            TransferPhase::from_platform("paused_user"),
            TransferPhase::Transferring
        );
        assert_eq!(
            TransferPhase::from_platform("finished_success"),
            TransferPhase::Finalized
        );
        assert_eq!(
            TransferPhase::from_platform("cancelled_system"),
            TransferPhase::Cancelled
        );
    }

    #[test]
    fn test_disk_serialization_flattens_info() {
        let json = serde_json::to_value(disk(DiskSource::Plain)).unwrap();
        assert_eq!(json["image_id"], "i1");
        assert_eq!(json["format"], "cow");
        assert_eq!(json["source"]["kind"], "plain");
    }
}
