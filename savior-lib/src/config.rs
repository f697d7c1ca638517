//! YAML setup file for one backup or restore job.
//!
//! ```yaml
//! connection:
//!   url: https://engine.example.com/ovirt-engine/api
//!   username: admin@internal
//!   ca_file: /etc/pki/ovirt-engine/ca.pem
//! directories:
//!   working_directory: /mnt/backups
//!   local_directory: /var/tmp/restore
//! vm:
//!   name: web
//! snapshot:
//!   description: nightly-backup
//! restoration:
//!   storage_domain: data
//!   cluster: Default
//!   new_vm_name: web-restored
//! ```

use crate::{JobError, JobMode};
use savior_engine::restore::DEFAULT_TEMPLATE;
use savior_engine::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_REPORT_EVERY};
use savior_engine::{OvirtConfig, PollConfig, TransferConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable that replaces `connection.password`.
pub const PASSWORD_ENV: &str = "SAVIOR_PASSWORD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub connection: ConnectionSection,
    pub directories: DirectorySection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub poll: PollSection,
    pub vm: VmSection,
    #[serde(default)]
    pub snapshot: Option<SnapshotSection>,
    #[serde(default)]
    pub restoration: Option<RestorationSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSection {
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySection {
    pub working_directory: PathBuf,
    #[serde(default)]
    pub local_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_report_every")]
    pub report_every: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            report_every: DEFAULT_REPORT_EVERY,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_report_every() -> u64 {
    DEFAULT_REPORT_EVERY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: None,
        }
    }
}

fn default_interval_secs() -> u64 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSection {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSection {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorationSection {
    pub storage_domain: String,
    pub cluster: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub new_vm_name: Option<String>,
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

impl JobConfig {
    /// Read a setup file, applying `SAVIOR_PASSWORD` when it is set.
    pub fn from_file(path: &Path) -> Result<Self, JobError> {
        info!(path = %path.display(), "Reading setup file");
        let raw = std::fs::read_to_string(path).map_err(|source| JobError::SetupFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&raw)?;
        Ok(config.with_password_override(std::env::var(PASSWORD_ENV).ok()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, JobError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn with_password_override(mut self, password: Option<String>) -> Self {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.connection.password = Some(password);
        }
        self
    }

    /// Check that everything `mode` needs is present.
    pub fn validate(&self, mode: JobMode) -> Result<(), JobError> {
        let invalid = |msg: &str| Err(JobError::InvalidConfig(msg.to_string()));

        if self.connection.url.trim().is_empty() {
            return invalid("connection.url is empty");
        }
        if self.connection.password.as_deref().map_or(true, str::is_empty) {
            return invalid("no password in connection.password or SAVIOR_PASSWORD");
        }
        if self.vm.name.trim().is_empty() {
            return invalid("vm.name is empty");
        }
        if self.transfer.chunk_size == 0 {
            return invalid("transfer.chunk_size must be positive");
        }
        if self.poll.interval_secs == 0 {
            return invalid("poll.interval_secs must be positive");
        }

        match mode {
            JobMode::Backup | JobMode::BackupTemp => {
                if self.snapshot.is_none() {
                    return invalid("backup needs a snapshot section");
                }
            }
            JobMode::Restore => {
                if self.restoration.is_none() {
                    return invalid("restore needs a restoration section");
                }
                if self.directories.local_directory.is_none() {
                    return invalid("restore needs directories.local_directory");
                }
            }
        }
        Ok(())
    }

    /// `<working_directory>/<vm name>`
    pub fn working_dir(&self) -> PathBuf {
        self.directories.working_directory.join(&self.vm.name)
    }

    /// `<working_directory>/<vm name>.log`, rewritten by every job on the VM.
    pub fn vm_log_path(&self) -> PathBuf {
        self.directories
            .working_directory
            .join(format!("{}.log", self.vm.name))
    }

    /// `<local_directory>/<vm name>`, for restores.
    pub fn local_dir(&self) -> Option<PathBuf> {
        self.directories
            .local_directory
            .as_ref()
            .map(|dir| dir.join(&self.vm.name))
    }

    pub fn poll_config(&self) -> PollConfig {
        let poll = PollConfig::new(Duration::from_secs(self.poll.interval_secs));
        match self.poll.timeout_secs {
            Some(secs) => poll.with_timeout(Duration::from_secs(secs)),
            None => poll,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            report_every: self.transfer.report_every,
            poll: self.poll_config(),
        }
    }

    pub fn ovirt_config(&self) -> OvirtConfig {
        OvirtConfig {
            url: self.connection.url.clone(),
            username: self.connection.username.clone(),
            password: self.connection.password.clone().unwrap_or_default(),
            ca_file: self.connection.ca_file.clone(),
        }
    }
}
