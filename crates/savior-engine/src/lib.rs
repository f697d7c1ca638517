//! Disk, snapshot and transfer engine behind VM backup and restore.
//!
//! The engine knows how to enumerate a VM's snapshots and disks, move disk
//! images through platform transfer sessions, rebuild backing-file chains from
//! a directory of downloaded images, flatten those chains, and replay a saved
//! snapshot sequence onto a new VM.

pub mod chain;
pub mod commit;
pub mod image;
pub mod ovirt;
pub mod poll;
pub mod restore;
pub mod settings;
pub mod topology;
pub mod transfer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chain::{analyze_chains, build_chains, Chain};
pub use commit::commit_chains;
pub use image::{ImageInfo, ImageTool, QemuImg};
pub use ovirt::{build_http_client, OvirtClient, OvirtConfig};
pub use poll::PollConfig;
pub use restore::{DiskMapping, RestoreConfig, RestoreEngine, RestoredVm};
pub use settings::{SavedSettings, SettingsStore, SnapshotRecord};
pub use topology::Topology;
pub use transfer::{
    finalize_all_transfers, transfer, transfer_disk, TransferConfig, TransferSession,
};
