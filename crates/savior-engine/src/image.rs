//! Single-file disk image utility: inspect, rebase and commit.

use async_trait::async_trait;
use savior_common::{Result, SaviorError};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use tracing::debug;

/// Metadata of one image file as reported by `qemu-img info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    pub format: String,
    #[serde(rename = "backing-filename", default)]
    pub backing_file: Option<String>,
}

impl ImageInfo {
    /// Final path component of the backing reference, if any.
    pub fn backing_name(&self) -> Option<&str> {
        self.backing_file
            .as_deref()
            .and_then(|backing| Path::new(backing).file_name())
            .and_then(OsStr::to_str)
    }
}

#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn inspect(&self, file: &Path) -> Result<ImageInfo>;

    /// Point `file` at `backing` without touching any data (unsafe rebase).
    async fn rebase(&self, file: &Path, backing: &str, backing_format: &str) -> Result<()>;

    /// Fold `file` into its backing file.
    async fn commit(&self, file: &Path) -> Result<()>;
}

/// `qemu-img` driven through child processes.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: String,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self {
            binary: "qemu-img".to_string(),
        }
    }
}

impl QemuImg {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args);
        debug!(command = ?cmd, "Running image tool");

        let output = cmd.output().await.map_err(|e| {
            SaviorError::ImageTool(format!("failed to spawn {}: {e}", self.binary))
        })?;

        if !output.status.success() {
            return Err(SaviorError::ImageTool(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    async fn inspect(&self, file: &Path) -> Result<ImageInfo> {
        let stdout = self
            .run([OsStr::new("info"), file.as_os_str(), OsStr::new("--output=json")])
            .await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            SaviorError::ImageTool(format!("unreadable info for {}: {e}", file.display()))
        })
    }

    async fn rebase(&self, file: &Path, backing: &str, backing_format: &str) -> Result<()> {
        self.run([
            OsStr::new("rebase"),
            OsStr::new("-u"),
            file.as_os_str(),
            OsStr::new("-b"),
            OsStr::new(backing),
            OsStr::new("-F"),
            OsStr::new(backing_format),
        ])
        .await?;
        Ok(())
    }

    async fn commit(&self, file: &Path) -> Result<()> {
        self.run([OsStr::new("commit"), file.as_os_str()]).await?;
        Ok(())
    }
}
