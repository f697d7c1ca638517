//! Rebuild of a saved VM on a target platform instance.
//!
//! Snapshots are replayed in saved order. Base images become fresh disks on
//! the target storage domain; every later image becomes a delta layer on the
//! new disk of its chain's base. Once the snapshot structure exists, the
//! flattened base images are uploaded into their new disks.

use crate::settings::SavedSettings;
use crate::topology::Topology;
use crate::transfer::{transfer_disk, TransferConfig};
use savior_common::{
    Disk, DiskAttachment, DiskSpec, Platform, Result, SaviorError, Snapshot, SnapshotRequest,
    TransferDirection, Vm, VmSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_TEMPLATE: &str = "Blank";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Name of the restored VM. Defaults to the saved name.
    pub vm_name: Option<String>,
    pub cluster: String,
    pub template: String,
    /// Directory holding the flattened base images, named by image id.
    pub image_dir: PathBuf,
    pub transfer: TransferConfig,
}

/// Old base disk id -> disk created for it during this restore.
pub type DiskMapping = BTreeMap<String, Disk>;

#[derive(Debug, Clone)]
pub struct RestoredVm {
    pub vm: Vm,
    pub disk_mapping: DiskMapping,
    /// Old image id -> new image id, by chain position.
    pub image_mapping: BTreeMap<String, String>,
    pub snapshots: Vec<Snapshot>,
    pub uploaded_bytes: u64,
}

pub struct RestoreEngine<P: Platform + ?Sized> {
    topology: Topology<P>,
    http: reqwest::Client,
    config: RestoreConfig,
}

impl<P: Platform + ?Sized> RestoreEngine<P> {
    pub fn new(topology: Topology<P>, http: reqwest::Client, config: RestoreConfig) -> Self {
        Self {
            topology,
            http,
            config,
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Recreate the VM described by `settings` with all of its snapshots and
    /// disks on `storage_domain`.
    ///
    /// Nothing is created until the settings and the image directory have
    /// been checked. Past that point any failure aborts and leaves the
    /// partially built VM in place.
    #[instrument(skip(self, settings), fields(vm = %settings.name))]
    pub async fn reconstruct(
        &self,
        settings: &SavedSettings,
        storage_domain: &str,
    ) -> Result<RestoredVm> {
        settings.validate()?;
        self.check_base_images(settings).await?;

        let name = self.config.vm_name.as_deref().unwrap_or(&settings.name);
        if self.topology.lookup_vm(name).await?.is_some() {
            return Err(SaviorError::VmAlreadyExists(name.to_string()));
        }

        let vm = self
            .topology
            .platform()
            .create_vm(&VmSpec {
                name: name.to_string(),
                cluster: self.config.cluster.clone(),
                template: self.config.template.clone(),
                memory: Some(settings.memory),
            })
            .await?;
        info!(vm_id = %vm.id, name = %vm.name, "Created target VM");

        let mut disk_mapping = DiskMapping::new();
        let mut snapshots = Vec::with_capacity(settings.snapshot_sequence.len());

        for record in &settings.snapshot_sequence {
            debug!(
                snapshot_id = %record.id,
                description = %record.description,
                "Replaying snapshot"
            );
            let mut bases = Vec::new();
            let mut deltas = Vec::new();

            for image_id in &record.image_ids {
                let (base_disk_id, position) =
                    settings.chain_position(image_id).ok_or_else(|| {
                        SaviorError::InconsistentSettings(format!(
                            "image {image_id} belongs to no chain"
                        ))
                    })?;
                let info = settings.disk_info.get(image_id).ok_or_else(|| {
                    SaviorError::InconsistentSettings(format!("no disk info for image {image_id}"))
                })?;

                if position == 0 {
                    if !disk_mapping.contains_key(base_disk_id) {
                        let spec = DiskSpec::from_saved(info, storage_domain);
                        let disk = self.topology.create_disk(&vm.id, &spec).await?;
                        info!(
                            old_disk_id = base_disk_id,
                            new_disk_id = disk.id(),
                            new_image_id = disk.image_id(),
                            "Created base disk"
                        );
                        disk_mapping.insert(base_disk_id.to_string(), disk);
                    }
                    if let Some(disk) = disk_mapping.get(base_disk_id) {
                        bases.push(DiskAttachment::Existing {
                            disk_id: disk.id().to_string(),
                        });
                    }
                } else {
                    let new_disk = disk_mapping.get(base_disk_id).ok_or_else(|| {
                        SaviorError::MissingDiskMapping {
                            base_disk_id: base_disk_id.to_string(),
                            image_id: image_id.clone(),
                        }
                    })?;
                    debug!(image_id = %image_id, new_disk_id = new_disk.id(), "Adding delta layer");
                    deltas.push(DiskAttachment::Delta {
                        disk_id: new_disk.id().to_string(),
                        name: info.name.clone(),
                        provisioned_size: info.provisioned_size,
                        actual_size: info.actual_size,
                        format: info.format,
                        sparse: info.sparse,
                    });
                }
            }

            bases.append(&mut deltas);
            let request = SnapshotRequest {
                description: record.description.clone(),
                persist_memory: false,
                attachments: bases,
            };
            snapshots.push(self.topology.create_snapshot(&vm.id, &request).await?);
        }

        let uploaded_bytes = self.upload_bases(settings, &disk_mapping).await?;
        let image_mapping = self.image_mapping(&vm, settings, &disk_mapping).await?;

        info!(
            vm_id = %vm.id,
            disks = disk_mapping.len(),
            snapshots = snapshots.len(),
            uploaded_bytes,
            "Restore complete"
        );
        Ok(RestoredVm {
            vm,
            disk_mapping,
            image_mapping,
            snapshots,
            uploaded_bytes,
        })
    }

    async fn check_base_images(&self, settings: &SavedSettings) -> Result<()> {
        for chain in settings.chains.values() {
            let Some(base_image) = chain.first() else {
                continue;
            };
            let path = self.config.image_dir.join(base_image);
            if !fs::try_exists(&path).await? {
                return Err(SaviorError::InconsistentSettings(format!(
                    "base image {} is missing from {}",
                    base_image,
                    self.config.image_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Upload each chain's base image into the disk created for it. Every
    /// chain must have a new disk before the first upload starts.
    async fn upload_bases(
        &self,
        settings: &SavedSettings,
        disk_mapping: &DiskMapping,
    ) -> Result<u64> {
        let mut pending = Vec::with_capacity(settings.chains.len());
        for (base_disk_id, chain) in &settings.chains {
            let Some(base_image) = chain.first() else {
                return Err(SaviorError::InconsistentSettings(format!(
                    "chain {base_disk_id} is empty"
                )));
            };
            let Some(disk) = disk_mapping.get(base_disk_id) else {
                return Err(SaviorError::InconsistentSettings(format!(
                    "chain {base_disk_id} is used by no snapshot, no disk was created for it"
                )));
            };
            pending.push((self.config.image_dir.join(base_image), disk));
        }

        let mut uploaded = 0;
        for (path, disk) in pending {
            uploaded += transfer_disk(
                self.topology.platform().clone(),
                &self.http,
                &self.config.transfer,
                TransferDirection::Upload,
                disk,
                &path,
            )
            .await?;
        }
        Ok(uploaded)
    }

    /// Pair old and new images by position along each chain. A chain whose
    /// new length differs is mapped as far as both reach.
    async fn image_mapping(
        &self,
        vm: &Vm,
        settings: &SavedSettings,
        disk_mapping: &DiskMapping,
    ) -> Result<BTreeMap<String, String>> {
        let mut new_chains: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for snapshot in self.topology.list_snapshots(&vm.id, true).await? {
            for disk in self.topology.list_disks(&vm.id, &snapshot.id).await? {
                let chain = new_chains.entry(disk.id().to_string()).or_default();
                if !chain.iter().any(|image| image == disk.image_id()) {
                    chain.push(disk.image_id().to_string());
                }
            }
        }

        let mut mapping = BTreeMap::new();
        for (old_disk_id, old_chain) in &settings.chains {
            let Some(new_chain) = disk_mapping
                .get(old_disk_id)
                .and_then(|disk| new_chains.get(disk.id()))
            else {
                warn!(%old_disk_id, "No restored chain found for disk");
                continue;
            };
            if new_chain.len() != old_chain.len() {
                warn!(
                    %old_disk_id,
                    old_len = old_chain.len(),
                    new_len = new_chain.len(),
                    "Restored chain length differs, image mapping is partial"
                );
            }
            for (old_image, new_image) in old_chain.iter().zip(new_chain) {
                mapping.insert(old_image.clone(), new_image.clone());
            }
        }
        Ok(mapping)
    }
}
