use savior_common::SaviorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod context;
pub mod jobs;

pub use config::JobConfig;
pub use context::JobContext;

/// The jobs a setup file can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    Backup,
    /// Take the backup snapshot only, without downloading anything.
    BackupTemp,
    Restore,
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobMode::Backup => f.write_str("backup"),
            JobMode::BackupTemp => f.write_str("backup-temp"),
            JobMode::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to read setup file {path}: {source}")]
    SetupFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse setup file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Engine(#[from] SaviorError),
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Engine(SaviorError::Io(err))
    }
}
