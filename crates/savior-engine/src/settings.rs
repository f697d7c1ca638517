//! Durable record of a backed-up VM and its on-disk store.

use savior_common::{Disk, DiskInfo, Result, SaviorError, Snapshot, Vm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub description: String,
    /// Images present in this snapshot, in platform order.
    pub image_ids: Vec<String>,
}

/// Everything needed to rebuild a VM from its downloaded images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSettings {
    pub name: String,
    pub id: String,
    pub cpu_architecture: Option<String>,
    pub memory: u64,
    /// Ascending by snapshot date, active snapshot excluded.
    pub snapshot_sequence: Vec<SnapshotRecord>,
    /// Image id -> attributes of the disk that image belongs to.
    pub disk_info: BTreeMap<String, DiskInfo>,
    /// Base disk id -> image ids of that disk, oldest first.
    pub chains: BTreeMap<String, Vec<String>>,
}

impl SavedSettings {
    pub fn new(vm: &Vm) -> Self {
        Self {
            name: vm.name.clone(),
            id: vm.id.clone(),
            cpu_architecture: vm.cpu_architecture.clone(),
            memory: vm.memory,
            snapshot_sequence: Vec::new(),
            disk_info: BTreeMap::new(),
            chains: BTreeMap::new(),
        }
    }

    /// Append a snapshot and its disks. Snapshots must be recorded in
    /// ascending date order for the chains to come out oldest first.
    pub fn record_snapshot(&mut self, snapshot: &Snapshot, disks: &[Disk]) {
        let mut image_ids = Vec::with_capacity(disks.len());
        for disk in disks {
            debug!(
                image_id = disk.image_id(),
                disk_id = disk.id(),
                actual_size = disk.info.actual_size,
                provisioned_size = disk.info.provisioned_size,
                "Discovered disk"
            );
            let image_id = disk.image_id().to_string();
            let chain = self.chains.entry(disk.id().to_string()).or_default();
            if !chain.contains(&image_id) {
                chain.push(image_id.clone());
            }
            self.disk_info.insert(image_id.clone(), disk.info.clone());
            image_ids.push(image_id);
        }

        self.snapshot_sequence.push(SnapshotRecord {
            id: snapshot.id.clone(),
            description: snapshot.description.clone(),
            image_ids,
        });
    }

    /// Base disk id of the chain holding `image_id`, and the image's position
    /// in it.
    pub fn chain_position(&self, image_id: &str) -> Option<(&str, usize)> {
        self.chains.iter().find_map(|(base_disk_id, chain)| {
            chain
                .iter()
                .position(|id| id == image_id)
                .map(|position| (base_disk_id.as_str(), position))
        })
    }

    /// Check the cross references between snapshots, disk info and chains.
    pub fn validate(&self) -> Result<()> {
        let mut owner: BTreeMap<&str, &str> = BTreeMap::new();

        for (base_disk_id, chain) in &self.chains {
            let Some(base_image) = chain.first() else {
                return Err(inconsistent(format!("chain {base_disk_id} is empty")));
            };
            let base_info = self.disk_info.get(base_image).ok_or_else(|| {
                inconsistent(format!("no disk info for base image {base_image}"))
            })?;
            if &base_info.id != base_disk_id {
                return Err(inconsistent(format!(
                    "chain {base_disk_id} starts with image {base_image} of disk {}",
                    base_info.id
                )));
            }
            for image_id in chain {
                if !self.disk_info.contains_key(image_id) {
                    return Err(inconsistent(format!("no disk info for image {image_id}")));
                }
                if let Some(other) = owner.insert(image_id.as_str(), base_disk_id.as_str()) {
                    return Err(inconsistent(format!(
                        "image {image_id} belongs to chains {other} and {base_disk_id}"
                    )));
                }
            }
        }

        for snapshot in &self.snapshot_sequence {
            for image_id in &snapshot.image_ids {
                if !self.disk_info.contains_key(image_id) {
                    return Err(inconsistent(format!(
                        "snapshot {} references undescribed image {image_id}",
                        snapshot.id
                    )));
                }
                if !owner.contains_key(image_id.as_str()) {
                    return Err(inconsistent(format!(
                        "image {image_id} of snapshot {} belongs to no chain",
                        snapshot.id
                    )));
                }
            }
        }
        debug!(images = owner.len(), chains = self.chains.len(), "Settings are consistent");
        Ok(())
    }
}

fn inconsistent(msg: String) -> SaviorError {
    SaviorError::InconsistentSettings(msg)
}

/// Settings files under one directory, named `<vm name>.json`.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{vm_name}.json"))
    }

    /// Write through a temp file and rename so a crash never leaves a
    /// truncated record behind.
    pub async fn save(&self, settings: &SavedSettings) -> Result<PathBuf> {
        let path = self.path_for(&settings.name);
        let tmp = self.dir.join(format!("{}.json.tmp", settings.name));
        let body = serde_json::to_vec_pretty(settings)
            .map_err(|e| SaviorError::Serialization(e.to_string()))?;

        fs::create_dir_all(&self.dir).await?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;

        info!(path = %path.display(), "Saved VM settings");
        Ok(path)
    }

    pub async fn load(&self, vm_name: &str) -> Result<SavedSettings> {
        let path = self.path_for(vm_name);
        let body = fs::read(&path).await?;
        let settings = serde_json::from_slice(&body).map_err(|e| {
            SaviorError::Serialization(format!("{}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Loaded VM settings");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use savior_common::chrono::{TimeZone, Utc};
    use savior_common::{DiskFormat, DiskSource, DiskStatus, SnapshotStatus, SnapshotType};

    fn disk(disk_id: &str, image_id: &str) -> Disk {
        Disk {
            info: DiskInfo {
                id: disk_id.to_string(),
                image_id: image_id.to_string(),
                name: format!("{disk_id}-disk"),
                description: None,
                format: DiskFormat::Cow,
                sparse: true,
                provisioned_size: 10 << 30,
                actual_size: 1 << 20,
                initial_size: None,
                interface: Some("virtio_scsi".to_string()),
                total_size: None,
                status: DiskStatus::Ok,
            },
            source: DiskSource::Snapshot {
                vm_id: "vm".to_string(),
                snapshot_id: "s".to_string(),
            },
        }
    }

    fn snapshot(id: &str, secs: i64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            description: format!("desc-{id}"),
            date: Utc.timestamp_opt(secs, 0).unwrap(),
            snapshot_type: SnapshotType::Regular,
            status: SnapshotStatus::Ok,
        }
    }

    fn two_snapshot_settings() -> SavedSettings {
        let vm = Vm {
            id: "vm".to_string(),
            name: "web".to_string(),
            cpu_architecture: Some("x86_64".to_string()),
            memory: 4 << 30,
        };
        let mut settings = SavedSettings::new(&vm);
        settings.record_snapshot(&snapshot("s1", 100), &[disk("d1", "i1")]);
        settings.record_snapshot(&snapshot("s2", 200), &[disk("d1", "i2"), disk("d2", "i3")]);
        settings
    }

    #[test]
    fn test_record_builds_chains_oldest_first() {
        let settings = two_snapshot_settings();
        assert_eq!(settings.chains["d1"], ["i1", "i2"]);
        assert_eq!(settings.chains["d2"], ["i3"]);
        assert_eq!(settings.snapshot_sequence[1].image_ids, ["i2", "i3"]);
        assert_eq!(settings.chain_position("i2"), Some(("d1", 1)));
        assert_eq!(settings.chain_position("missing"), None);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_chain_without_its_base() {
        let mut settings = two_snapshot_settings();
        settings.chains.get_mut("d1").unwrap().remove(0);
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, SaviorError::InconsistentSettings(_)));
    }

    #[test]
    fn test_validate_rejects_undescribed_image() {
        let mut settings = two_snapshot_settings();
        settings.disk_info.remove("i3");
        assert!(settings.validate().unwrap_err().is_input_inconsistency());
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        let settings = two_snapshot_settings();

        let path = store.save(&settings).await.unwrap();
        assert_eq!(path, dir.path().join("web.json"));
        assert!(!dir.path().join("web.json.tmp").exists());

        let loaded = store.load("web").await.unwrap();
        assert_eq!(loaded, settings);
    }
}
