//! Per-file sync state machine.
//!
//! A `SyncingFile` is registered in `pending`, runs a reuse check against
//! whatever is already on disk, then waits for exactly one transfer
//! operation to drive it through `starting` → `in-progress` → `ready`.
//! Failures are terminal and leave the file on disk for inspection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{EncryptionMode, FileInfo, FileState, FileType};
use crate::services::clone::CloneBackend;
use crate::services::downloader::Downloader;
use crate::services::peer::{self, PeerSender};
use crate::services::restore::RestoreBackend;
use crate::services::PREPARE_TIMEOUT;
use crate::storage::checksum;
use crate::storage::copy::{idle_timeout_copy, ProgressUpdater};

/// Identity and expectations for a file registration.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub file_path: PathBuf,
    pub uuid: String,
    pub disk_uuid: String,
    /// Hex SHA-512; empty means compute and accept whatever.
    pub expected_checksum: String,
    /// Expected size in bytes; 0 until the source declares it.
    pub size: u64,
    pub file_type: FileType,
}

struct Inner {
    size: u64,
    file_type: FileType,
    state: FileState,
    progress: u32,
    processed_size: u64,
    current_checksum: String,
    message: String,
    modification_time: DateTime<Utc>,
}

pub struct SyncingFile {
    file_path: PathBuf,
    uuid: String,
    disk_uuid: String,
    expected_checksum: String,
    downloader: Arc<dyn Downloader>,
    cancel: CancellationToken,
    state_tx: watch::Sender<FileState>,
    /// Set once a transfer operation claims the file; the preparation
    /// watchdog fails entities nobody claims in time.
    processing_started: AtomicBool,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for SyncingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncingFile")
            .field("file_path", &self.file_path)
            .field("uuid", &self.uuid)
            .field("disk_uuid", &self.disk_uuid)
            .finish()
    }
}

impl SyncingFile {
    pub fn new(
        parent_cancel: &CancellationToken,
        req: RegisterRequest,
        downloader: Arc<dyn Downloader>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(FileState::Pending);
        let sf = Arc::new(Self {
            file_path: req.file_path,
            uuid: req.uuid,
            disk_uuid: req.disk_uuid,
            expected_checksum: req.expected_checksum,
            downloader,
            cancel: parent_cancel.child_token(),
            state_tx,
            processing_started: AtomicBool::new(false),
            inner: RwLock::new(Inner {
                size: req.size,
                file_type: req.file_type,
                state: FileState::Pending,
                progress: 0,
                processed_size: 0,
                current_checksum: String::new(),
                message: String::new(),
                modification_time: Utc::now(),
            }),
        });
        tokio::spawn(sf.clone().init());
        sf
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> FileState {
        self.inner.read().unwrap().state
    }

    /// Snapshot for the control plane.
    pub fn get(&self) -> FileInfo {
        let inner = self.inner.read().unwrap();
        FileInfo {
            file_path: self.file_path.display().to_string(),
            uuid: self.uuid.clone(),
            disk_uuid: self.disk_uuid.clone(),
            size: inner.size,
            state: inner.state,
            progress: inner.progress,
            processed_size: inner.processed_size,
            current_checksum: inner.current_checksum.clone(),
            expected_checksum: self.expected_checksum.clone(),
            message: inner.message.clone(),
            modification_time: inner.modification_time,
            file_type: inner.file_type,
        }
    }

    async fn init(self: Arc<Self>) {
        match self.check_and_reuse_file().await {
            Ok(true) => {
                tracing::info!(
                    file = %self.file_path.display(),
                    "Reusing existing file, skipping transfer"
                );
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    file = %self.file_path.display(),
                    error = %e,
                    "Reuse check failed, falling back to a fresh transfer"
                );
            }
        }
        self.set_state(FileState::Starting);

        let sf = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sf.cancel.cancelled() => {}
                _ = tokio::time::sleep(PREPARE_TIMEOUT) => {
                    if !sf.processing_started.load(Ordering::SeqCst) {
                        sf.fail(format!(
                            "no transfer began within {}s of registration",
                            PREPARE_TIMEOUT.as_secs()
                        ));
                    }
                }
            }
        });
    }

    /// A file already at the target path with the right length and checksum
    /// is adopted as-is. Node restarts must not re-download gigabyte images.
    async fn check_and_reuse_file(&self) -> Result<bool> {
        let meta = match fs::metadata(&self.file_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(false);
        }

        let declared = self.inner.read().unwrap().size;
        if declared > 0 && meta.len() != declared {
            return Ok(false);
        }
        if declared == 0 && self.expected_checksum.is_empty() {
            // Nothing to validate the existing bytes against.
            return Ok(false);
        }

        let current = checksum::sha512_file(&self.file_path).await?;
        if !self.expected_checksum.is_empty() && current != self.expected_checksum {
            return Ok(false);
        }

        {
            let mut inner = self.inner.write().unwrap();
            inner.size = meta.len();
            inner.processed_size = meta.len();
            inner.progress = 100;
            inner.current_checksum = current;
        }
        self.set_state(FileState::Ready);
        Ok(true)
    }

    /// Block until the reuse check has resolved the state, bounded by the
    /// preparation budget.
    pub async fn wait_for_state_non_pending(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() != FileState::Pending {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(PREPARE_TIMEOUT, wait).await.map_err(|_| {
            AppError::PreparationTimeout(format!(
                "file {} is still pending after {}s",
                self.file_path.display(),
                PREPARE_TIMEOUT.as_secs()
            ))
        })
    }

    /// Claim the file for a transfer operation. `Ok(false)` means the reuse
    /// check already produced a ready file and there is nothing to transfer.
    fn begin_processing(&self) -> Result<bool> {
        let already = self.processing_started.swap(true, Ordering::SeqCst);
        let state = self.state();
        match state {
            FileState::Ready => Ok(false),
            FileState::Starting if already => Err(AppError::Conflict(format!(
                "another transfer already claimed file {}",
                self.file_path.display()
            ))),
            FileState::Starting => Ok(true),
            FileState::InProgress => Err(AppError::Conflict(format!(
                "file {} is already being transferred",
                self.file_path.display()
            ))),
            _ => Err(AppError::InvalidArgument(format!(
                "cannot start a transfer for file {} in state {state}",
                self.file_path.display()
            ))),
        }
    }

    /// Verify and publish a finished transfer: truncate to the bytes moved,
    /// enforce declared size, hash, enforce expected checksum.
    async fn finish_processing(&self, written: u64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.file_path)
            .await?;
        file.set_len(written).await?;
        file.sync_all().await?;
        drop(file);

        let declared = self.inner.read().unwrap().size;
        if declared > 0 && written != declared {
            return Err(AppError::SizeMismatch(format!(
                "transferred {written} bytes for file {} but expected {declared}",
                self.file_path.display()
            )));
        }

        let current = checksum::sha512_file(&self.file_path).await?;
        if !self.expected_checksum.is_empty() && current != self.expected_checksum {
            // The file stays on disk so an operator can inspect it.
            return Err(AppError::ChecksumMismatch(format!(
                "file {} has checksum {current}, expected {}",
                self.file_path.display(),
                self.expected_checksum
            )));
        }

        {
            let mut inner = self.inner.write().unwrap();
            inner.size = written;
            inner.processed_size = written;
            inner.progress = 100;
            inner.current_checksum = current;
        }
        self.set_state(FileState::Ready);
        Ok(())
    }

    fn record_outcome(&self, res: Result<u64>) -> Result<u64> {
        if let Err(e) = &res {
            self.fail(e.to_string());
        }
        res
    }

    pub async fn download_from_url(self: Arc<Self>, url: &str, data_engine: &str) -> Result<u64> {
        if !self.begin_processing()? {
            return Ok(self.get().size);
        }
        tracing::info!(
            file = %self.file_path.display(),
            url,
            data_engine,
            "Starting download"
        );
        let res = async {
            if let Some(remote) = self.downloader.size_from_url(url).await? {
                let mut inner = self.inner.write().unwrap();
                if inner.size > 0 && inner.size != remote {
                    return Err(AppError::SizeMismatch(format!(
                        "source reports {remote} bytes for file {}, expected {}",
                        self.file_path.display(),
                        inner.size
                    )));
                }
                inner.size = remote;
            }

            let updater: Arc<dyn ProgressUpdater> = self.clone();
            let written = self
                .downloader
                .download_to_file(url, &self.file_path, updater, self.cancel.clone())
                .await?;
            self.finish_processing(written).await?;
            Ok(written)
        }
        .await;
        self.record_outcome(res)
    }

    /// Adopt a file already present on this disk by renaming it into place.
    pub async fn fetch(self: Arc<Self>, src_path: &Path) -> Result<u64> {
        if !self.begin_processing()? {
            return Ok(self.get().size);
        }
        tracing::info!(
            file = %self.file_path.display(),
            src = %src_path.display(),
            "Fetching existing file"
        );
        self.set_state(FileState::InProgress);
        let res = async {
            if src_path != self.file_path {
                if let Some(parent) = self.file_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(src_path, &self.file_path).await?;
            }
            let written = fs::metadata(&self.file_path).await?.len();
            self.finish_processing(written).await?;
            Ok(written)
        }
        .await;
        self.record_outcome(res)
    }

    /// Listen on `port` for a single inbound peer stream.
    pub async fn receive(
        self: Arc<Self>,
        port: u16,
        file_type: FileType,
        data_engine: &str,
    ) -> Result<u64> {
        if !self.begin_processing()? {
            return Ok(self.get().size);
        }
        tracing::info!(
            file = %self.file_path.display(),
            port,
            %file_type,
            data_engine,
            "Waiting for peer transfer"
        );
        {
            self.inner.write().unwrap().file_type = file_type;
        }
        let res = async {
            let size = self.inner.read().unwrap().size;
            crate::storage::allocate_sparse(&self.file_path, size).await?;

            let updater: Arc<dyn ProgressUpdater> = self.clone();
            let written = peer::receive_once(
                port,
                self.file_path.clone(),
                updater,
                self.cancel.clone(),
            )
            .await?;
            self.finish_processing(written).await?;
            Ok(written)
        }
        .await;
        self.record_outcome(res)
    }

    /// Push a ready file to a peer's receiver endpoint. Does not mutate this
    /// entity's state.
    pub async fn send(&self, to_address: &str, sender: &dyn PeerSender) -> Result<()> {
        let state = self.state();
        if state != FileState::Ready {
            return Err(AppError::InvalidArgument(format!(
                "cannot send file {} in state {state}",
                self.file_path.display()
            )));
        }
        tracing::info!(
            file = %self.file_path.display(),
            to_address,
            "Sending file to peer"
        );
        sender.send(&self.file_path, to_address).await
    }

    /// Materialize this file from another local backing image.
    pub async fn clone_from_backing_image(
        self: Arc<Self>,
        backend: Arc<dyn CloneBackend>,
        src_image: &str,
        src_uuid: &str,
        encryption: EncryptionMode,
        credential: &HashMap<String, String>,
        data_engine: &str,
    ) -> Result<u64> {
        if !self.begin_processing()? {
            return Ok(self.get().size);
        }
        tracing::info!(
            file = %self.file_path.display(),
            src_image,
            src_uuid,
            %encryption,
            data_engine,
            "Cloning from backing image"
        );
        let res = async {
            let updater: Arc<dyn ProgressUpdater> = self.clone();
            let written = backend
                .clone_to(
                    src_image,
                    src_uuid,
                    &self.file_path,
                    encryption,
                    credential,
                    updater,
                    self.cancel.clone(),
                )
                .await?;
            self.finish_processing(written).await?;
            Ok(written)
        }
        .await;
        self.record_outcome(res)
    }

    /// Materialize this file from an object-store backup.
    pub async fn restore_from_backup_url(
        self: Arc<Self>,
        backend: Arc<dyn RestoreBackend>,
        backup_url: &str,
        credential: &HashMap<String, String>,
        concurrent_limit: usize,
        data_engine: &str,
    ) -> Result<u64> {
        if !self.begin_processing()? {
            return Ok(self.get().size);
        }
        tracing::info!(
            file = %self.file_path.display(),
            backup_url,
            concurrent_limit,
            data_engine,
            "Restoring from backup"
        );
        let res = async {
            let updater: Arc<dyn ProgressUpdater> = self.clone();
            let written = backend
                .restore(
                    backup_url,
                    &self.file_path,
                    credential,
                    concurrent_limit,
                    updater,
                    self.cancel.clone(),
                )
                .await?;
            self.finish_processing(written).await?;
            Ok(written)
        }
        .await;
        self.record_outcome(res)
    }

    /// Pump an upload body into the file. The caller drives the reader, so
    /// a stalled destination blocks the client end to end.
    pub async fn idle_timeout_copy_to_file<R>(
        self: Arc<Self>,
        reader: &mut R,
        data_engine: &str,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if !self.begin_processing()? {
            return Ok(self.get().size);
        }
        tracing::info!(
            file = %self.file_path.display(),
            data_engine,
            "Receiving upload"
        );
        let res = async {
            let size = self.inner.read().unwrap().size;
            let mut dst = crate::storage::allocate_sparse(&self.file_path, size).await?;
            let written =
                idle_timeout_copy(reader, &mut dst, &*self, false, &self.cancel).await?;
            dst.sync_all().await?;
            drop(dst);
            self.finish_processing(written).await?;
            Ok(written)
        }
        .await;
        self.record_outcome(res)
    }

    /// Cancel any in-flight transfer and unlink the file.
    pub async fn delete(&self) {
        self.cancel.cancel();
        if let Err(e) = fs::remove_file(&self.file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    file = %self.file_path.display(),
                    error = %e,
                    "Failed to remove file on delete"
                );
            }
        }
    }

    fn set_state(&self, state: FileState) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.state = state;
            inner.modification_time = Utc::now();
        }
        tracing::debug!(file = %self.file_path.display(), %state, "State transition");
        self.state_tx.send_replace(state);
    }

    fn fail(&self, message: String) {
        {
            let mut inner = self.inner.write().unwrap();
            if matches!(inner.state, FileState::Ready | FileState::Failed) {
                return;
            }
            inner.state = FileState::Failed;
            inner.message = message.clone();
            inner.modification_time = Utc::now();
        }
        tracing::warn!(file = %self.file_path.display(), message, "Sync file failed");
        self.state_tx.send_replace(FileState::Failed);
    }
}

impl ProgressUpdater for SyncingFile {
    fn update_progress(&self, moved: u64) {
        let promoted = {
            let mut inner = self.inner.write().unwrap();
            inner.processed_size += moved;
            if inner.size > 0 {
                inner.progress =
                    (inner.processed_size.saturating_mul(100) / inner.size).min(100) as u32;
            }
            if inner.state == FileState::Starting {
                inner.state = FileState::InProgress;
                inner.modification_time = Utc::now();
                true
            } else {
                false
            }
        };
        if promoted {
            self.state_tx.send_replace(FileState::InProgress);
        }
    }
}
