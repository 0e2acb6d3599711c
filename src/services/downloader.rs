//! Bytes-from-URL source with progress callbacks and idle-timeout streaming.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use tokio::fs;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::storage::copy::{idle_timeout_copy, ProgressUpdater, IDLE_TIMEOUT};

/// Source of bytes-from-URL. Injected into the sync service so tests can
/// swap the network out.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Probe the size of the object behind `url` with a HEAD request.
    /// `None` means the server did not declare a Content-Length.
    async fn size_from_url(&self, url: &str) -> Result<Option<u64>>;

    /// Stream `url` into `file_path`, reporting progress per write. The
    /// destination ends up truncated to exactly the returned byte count.
    async fn download_to_file(
        &self,
        url: &str,
        file_path: &Path,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64>;
}

/// Production downloader backed by reqwest.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        // Redirects carry no Referer header; CDN-fronted origins reject
        // requests that look like hotlinks.
        let client = reqwest::Client::builder()
            .referer(false)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        Self { client }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn size_from_url(&self, url: &str) -> Result<Option<u64>> {
        let resp = self
            .client
            .head(url)
            .timeout(IDLE_TIMEOUT)
            .send()
            .await?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(AppError::SourceError(format!(
                "expected status 200 from {url}, got {}",
                resp.status()
            )));
        }

        match resp.headers().get(CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => {
                let size = value
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| {
                        AppError::SourceError(format!("invalid Content-Length from {url}"))
                    })?;
                Ok(Some(size))
            }
        }
    }

    async fn download_to_file(
        &self,
        url: &str,
        file_path: &Path,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let resp = self.client.get(url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(AppError::SourceError(format!(
                "expected status 200 from {url}, got {}",
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

        // Zero blocks were skipped with seeks; pin the logical length down.
        dst.set_len(written).await?;
        dst.sync_all().await?;

        Ok(written)
    }
}

/// Size of the file the mock downloader produces.
pub const MOCK_FILE_SIZE: u64 = 4096;

/// Deterministic downloader for tests: a fixed-size file with synthetic
/// progress ticks 50 ms apart.
pub struct MockDownloader;

#[async_trait]
impl Downloader for MockDownloader {
    async fn size_from_url(&self, _url: &str) -> Result<Option<u64>> {
        Ok(Some(MOCK_FILE_SIZE))
    }

    async fn download_to_file(
        &self,
        _url: &str,
        file_path: &Path,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(file_path).await?;
        file.set_len(MOCK_FILE_SIZE).await?;
        drop(file);

        const TICK: u64 = 16;
        for _ in 0..MOCK_FILE_SIZE / TICK {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("mock download interrupted".to_string()));
            }
            updater.update_progress(TICK);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(MOCK_FILE_SIZE)
    }
}
