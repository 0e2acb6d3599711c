//! Backup restore: ranged part downloads with bounded concurrency.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::storage::copy::{idle_timeout_copy, ProgressUpdater, IDLE_TIMEOUT};

/// Part size for ranged restores.
pub const RESTORE_PART_SIZE: u64 = 8 << 20;

/// Source of bytes-from-backup. The backup URL and credentials are opaque
/// to the sync core; this seam is where a real backup store client plugs in.
#[async_trait]
pub trait RestoreBackend: Send + Sync {
    async fn restore(
        &self,
        backup_url: &str,
        file_path: &Path,
        credential: &HashMap<String, String>,
        concurrent_limit: usize,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64>;
}

/// Restore backend for HTTP-reachable backup objects. Sizes the object with
/// HEAD, then pulls fixed-size parts with Range requests under a semaphore
/// bounding parallelism at the caller's concurrent limit. Servers without
/// range support fall back to a single stream.
pub struct HttpRestoreBackend {
    client: reqwest::Client,
    part_size: u64,
}

impl HttpRestoreBackend {
    pub fn new() -> Self {
        Self::with_part_size(RESTORE_PART_SIZE)
    }

    pub fn with_part_size(part_size: u64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        Self { client, part_size }
    }

    async fn restore_stream(
        &self,
        backup_url: &str,
        file_path: &Path,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let resp = self.client.get(backup_url).send().await.map_err(|e| {
            AppError::SourceError(format!("failed to reach backup store at {backup_url}: {e}"))
        })?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(AppError::SourceError(format!(
                "expected status 200 from backup store {backup_url}, got {}",
                resp.status()
            )));
        }

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut dst = fs::File::create(file_path).await?;

        let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);
        let written = idle_timeout_copy(&mut reader, &mut dst, &*updater, false, &cancel).await?;

        dst.set_len(written).await?;
        dst.sync_all().await?;
        Ok(written)
    }

    async fn restore_parts(
        &self,
        backup_url: &str,
        file_path: &Path,
        size: u64,
        concurrent_limit: usize,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        crate::storage::allocate_sparse(file_path, size).await?;

        let semaphore = Arc::new(Semaphore::new(concurrent_limit.max(1)));
        let mut parts = JoinSet::new();

        let mut offset = 0u64;
        while offset < size {
            let len = self.part_size.min(size - offset);
            let client = self.client.clone();
            let url = backup_url.to_string();
            let path = file_path.to_path_buf();
            let semaphore = semaphore.clone();
            let updater = updater.clone();
            let cancel = cancel.clone();

            parts.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    AppError::Cancelled("restore worker pool closed".to_string())
                })?;
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled("restore interrupted".to_string()));
                }
                download_part(&client, &url, &path, offset, len).await?;
                updater.update_progress(len);
                Ok::<(), AppError>(())
            });

            offset += len;
        }

        while let Some(joined) = parts.join_next().await {
            joined
                .map_err(|e| AppError::SourceError(format!("restore worker panicked: {e}")))??;
        }

        let file = fs::OpenOptions::new().write(true).open(file_path).await?;
        file.sync_all().await?;
        Ok(size)
    }
}

impl Default for HttpRestoreBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn download_part(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    offset: u64,
    len: u64,
) -> Result<()> {
    let range = format!("bytes={}-{}", offset, offset + len - 1);
    let resp = client
        .get(url)
        .header(RANGE, range)
        .timeout(IDLE_TIMEOUT)
        .send()
        .await
        .map_err(|e| AppError::SourceError(format!("part at offset {offset} failed: {e}")))?;

    if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(AppError::SourceError(format!(
            "backup store ignored range request at offset {offset}, got {}",
            resp.status()
        )));
    }

    let data = resp
        .bytes()
        .await
        .map_err(|e| AppError::SourceError(format!("part at offset {offset} failed: {e}")))?;
    if data.len() as u64 != len {
        return Err(AppError::SourceError(format!(
            "short part at offset {offset}: got {} bytes, wanted {len}",
            data.len()
        )));
    }

    // All-zero parts stay holes in the preallocated file.
    if data.iter().any(|&b| b != 0) {
        let mut file = fs::OpenOptions::new().write(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
    }
    Ok(())
}

#[async_trait]
impl RestoreBackend for HttpRestoreBackend {
    async fn restore(
        &self,
        backup_url: &str,
        file_path: &Path,
        credential: &HashMap<String, String>,
        concurrent_limit: usize,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        // Credentials are opaque here; a real backup store client consumes
        // them. The plain-HTTP backend has no use for them.
        let _ = credential;

        let head = self
            .client
            .head(backup_url)
            .timeout(IDLE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                AppError::SourceError(format!(
                    "failed to reach backup store at {backup_url}: {e}"
                ))
            })?;
        if head.status() != reqwest::StatusCode::OK {
            return Err(AppError::SourceError(format!(
                "expected status 200 from backup store {backup_url}, got {}",
                head.status()
            )));
        }

        let size = head
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let ranges_supported = head
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "bytes")
            .unwrap_or(false);

        match size {
            Some(size) if ranges_supported && size > self.part_size => {
                self.restore_parts(
                    backup_url,
                    file_path,
                    size,
                    concurrent_limit,
                    updater,
                    cancel,
                )
                .await
            }
            _ => {
                self.restore_stream(backup_url, file_path, updater, cancel)
                    .await
            }
        }
    }
}
