//! Chunked image transfers through platform-brokered transfer sessions.
//!
//! A session is opened against a disk or snapshot disk, waits for the
//! platform to leave `initializing`, moves bytes over HTTP, and is always
//! finalized, also when the byte movement failed. Downloads land in
//! `<target>.tmp` first and only replace the target once complete.

mod progress;
mod range;

pub use progress::{format_rate, format_size, ProgressReport, TransferProgress};
pub use range::{byte_ranges, ByteRange};

use crate::poll::PollConfig;
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use savior_common::{
    Disk, DiskStatus, Platform, Result, SaviorError, TransferDirection, TransferHandle,
    TransferPhase, TransferTarget,
};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_REPORT_EVERY: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Bytes between periodic progress reports. A final report is always made.
    pub report_every: u64,
    pub poll: PollConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            report_every: DEFAULT_REPORT_EVERY,
            poll: PollConfig::default(),
        }
    }
}

pub(crate) fn http_error(err: impl Display) -> SaviorError {
    SaviorError::Http(err.to_string())
}

/// Path of the temporary file a download is written to.
pub fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// One platform transfer handle and the bytes moved through it.
pub struct TransferSession<P: Platform + ?Sized> {
    platform: Arc<P>,
    http: reqwest::Client,
    config: TransferConfig,
    handle: TransferHandle,
    direction: TransferDirection,
    finalized: bool,
}

impl<P: Platform + ?Sized> TransferSession<P> {
    /// Request a transfer handle and wait until it is ready to move data.
    ///
    /// If the handle never becomes ready it is finalized before the error is
    /// returned, so the platform releases its storage locks.
    #[instrument(skip(platform, http, config), fields(direction = %direction))]
    pub async fn open(
        platform: Arc<P>,
        http: reqwest::Client,
        config: TransferConfig,
        target: &TransferTarget,
        direction: TransferDirection,
    ) -> Result<Self> {
        let handle = platform.open_transfer(target, direction).await?;
        info!(transfer_id = %handle.id, "Opened image transfer");

        let mut session = Self {
            platform,
            http,
            config,
            handle,
            direction,
            finalized: false,
        };

        if let Err(err) = session.wait_until_ready().await {
            session.finalize_best_effort().await;
            return Err(err);
        }
        Ok(session)
    }

    pub fn handle(&self) -> &TransferHandle {
        &self.handle
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        if self.handle.phase == TransferPhase::Initializing {
            let platform = &self.platform;
            let id = self.handle.id.as_str();
            let handle = self
                .config
                .poll
                .until("image transfer to leave initializing", move || async move {
                    let handle = platform.get_transfer(id).await?;
                    Ok((handle.phase != TransferPhase::Initializing).then_some(handle))
                })
                .await?;
            self.handle = handle;
        }

        match self.handle.phase {
            TransferPhase::Transferring => Ok(()),
            phase => Err(SaviorError::TransferAborted {
                id: self.handle.id.clone(),
                phase,
            }),
        }
    }

    fn url(&self) -> Result<&str> {
        self.handle.url.as_deref().ok_or_else(|| {
            SaviorError::Platform(format!("transfer {} has no transfer URL", self.handle.id))
        })
    }

    /// Stream the remote image into `destination`.
    ///
    /// The data goes to `<destination>.tmp`, which is renamed over
    /// `destination` only after every advertised byte has arrived. On any
    /// failure the temp file is removed and `destination` is left untouched.
    #[instrument(skip(self), fields(transfer_id = %self.handle.id))]
    pub async fn download(&mut self, destination: &Path) -> Result<u64> {
        let response = self
            .http
            .get(self.url()?)
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?;

        let expected = match response.content_length() {
            Some(length) if length > 0 => length,
            _ => return Err(SaviorError::MissingContentLength),
        };

        let tmp = temp_path(destination);
        let mut progress = TransferProgress::new(
            destination.display().to_string(),
            expected,
            self.config.report_every,
        );
        let written = write_stream(
            response.bytes_stream(),
            &tmp,
            expected,
            self.config.chunk_size,
            &mut progress,
        )
        .await;

        match written {
            Ok(moved) => {
                fs::rename(&tmp, destination).await?;
                info!(path = %destination.display(), bytes = moved, "Download complete");
                Ok(moved)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&tmp).await {
                    debug!(path = %tmp.display(), error = %cleanup, "No temp file to clean up");
                }
                Err(err)
            }
        }
    }

    /// Send `source` in `chunk_size` pieces, each tagged with its byte range.
    #[instrument(skip(self), fields(transfer_id = %self.handle.id))]
    pub async fn upload(&mut self, source: &Path) -> Result<u64> {
        let url = self.url()?.to_string();
        let total = fs::metadata(source).await?.len();
        let mut file = fs::File::open(source).await?;
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        let mut progress = TransferProgress::new(
            source.display().to_string(),
            total,
            self.config.report_every,
        );

        for range in byte_ranges(total, buffer.len() as u64) {
            let chunk = &mut buffer[..range.len() as usize];
            file.read_exact(chunk).await?;

            self.http
                .put(&url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_RANGE, range.content_range())
                .body(chunk.to_vec())
                .send()
                .await
                .map_err(http_error)?
                .error_for_status()
                .map_err(http_error)?;

            progress.advance(range.len());
        }

        progress.finish();
        info!(path = %source.display(), bytes = total, "Upload complete");
        Ok(total)
    }

    /// Finalize the transfer on the platform. Calling it again is a no-op.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            debug!(transfer_id = %self.handle.id, "Transfer already finalized");
            return Ok(());
        }
        self.platform.finalize_transfer(&self.handle.id).await?;
        self.finalized = true;
        self.handle.phase = TransferPhase::Finalized;
        info!(transfer_id = %self.handle.id, "Finalized image transfer");
        Ok(())
    }

    /// Finalize on a failure path. A finalize error is logged, not returned,
    /// so the original failure is what reaches the caller.
    pub async fn finalize_best_effort(&mut self) {
        if let Err(err) = self.finalize().await {
            warn!(
                transfer_id = %self.handle.id,
                error = %err,
                "Failed to finalize transfer after error"
            );
        }
    }
}

impl<P: Platform + ?Sized> Drop for TransferSession<P> {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                transfer_id = %self.handle.id,
                "Transfer session dropped without finalize, storage may stay locked"
            );
        }
    }
}

/// Write a byte stream to `path` in `chunk_size` writes, checking that exactly
/// `expected` bytes arrive.
pub async fn write_stream<S, B, E>(
    mut stream: S,
    path: &Path,
    expected: u64,
    chunk_size: usize,
    progress: &mut TransferProgress,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let chunk_size = chunk_size.max(1);
    let mut file = fs::File::create(path).await?;
    let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut moved: u64 = 0;

    while let Some(piece) = stream.next().await {
        let piece = piece.map_err(http_error)?;
        let bytes = piece.as_ref();
        if bytes.is_empty() {
            continue;
        }
        moved += bytes.len() as u64;
        if moved > expected {
            return Err(SaviorError::SizeMismatch {
                expected,
                actual: moved,
            });
        }

        buffer.extend_from_slice(bytes);
        while buffer.len() >= chunk_size {
            file.write_all(&buffer[..chunk_size]).await?;
            buffer.drain(..chunk_size);
        }
        progress.advance(bytes.len() as u64);
    }

    if !buffer.is_empty() {
        file.write_all(&buffer).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    progress.finish();

    if moved != expected {
        return Err(SaviorError::SizeMismatch {
            expected,
            actual: moved,
        });
    }
    Ok(moved)
}

/// Move one file through a fresh transfer session and finalize it.
///
/// Finalize runs on both paths. On success a finalize error is returned; on
/// failure it is only logged and the transfer error is returned.
#[instrument(skip(platform, http, config), fields(direction = %direction, path = %path.display()))]
pub async fn transfer<P: Platform + ?Sized>(
    platform: Arc<P>,
    http: &reqwest::Client,
    config: &TransferConfig,
    direction: TransferDirection,
    target: &TransferTarget,
    path: &Path,
    size_hint: Option<u64>,
) -> Result<u64> {
    let mut session =
        TransferSession::open(platform, http.clone(), config.clone(), target, direction).await?;

    let outcome = match direction {
        TransferDirection::Download => session.download(path).await,
        TransferDirection::Upload => session.upload(path).await,
    };

    match outcome {
        Ok(moved) => {
            session.finalize().await?;
            if let Some(hint) = size_hint {
                if hint != moved {
                    debug!(hint, moved, "Transferred size differs from size hint");
                }
            }
            Ok(moved)
        }
        Err(err) => {
            session.finalize_best_effort().await;
            Err(err)
        }
    }
}

/// Transfer `path` to or from `disk`, refusing to start unless the platform
/// reports the disk as `ok`.
pub async fn transfer_disk<P: Platform + ?Sized>(
    platform: Arc<P>,
    http: &reqwest::Client,
    config: &TransferConfig,
    direction: TransferDirection,
    disk: &Disk,
    path: &Path,
) -> Result<u64> {
    let status = platform.disk_status(disk).await?;
    if status != DiskStatus::Ok {
        return Err(SaviorError::DiskNotReady {
            disk_id: disk.id().to_string(),
            status,
        });
    }
    info!(%disk, %direction, path = %path.display(), "Transferring disk");
    let size_hint = match direction {
        TransferDirection::Download => Some(disk.info.actual_size),
        TransferDirection::Upload => None,
    };
    transfer(
        platform,
        http,
        config,
        direction,
        &disk.transfer_target(),
        path,
        size_hint,
    )
    .await
}

/// Finalize every transfer the platform still lists as open.
pub async fn finalize_all_transfers<P: Platform + ?Sized>(platform: &P) -> Result<usize> {
    let mut finalized = 0;
    for handle in platform.list_transfers().await? {
        if matches!(
            handle.phase,
            TransferPhase::Initializing | TransferPhase::Transferring
        ) {
            platform.finalize_transfer(&handle.id).await?;
            finalized += 1;
        }
    }
    info!(finalized, "Finalized open transfers");
    Ok(finalized)
}
