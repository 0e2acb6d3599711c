//! Registry of active syncing files and the drivers that run their
//! transfers.
//!
//! The registry is a pair of maps (path → file, uuid → file) behind one
//! lock. The lock is never held across I/O: readers snapshot and release,
//! writers mutate and release.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{EncryptionMode, FileInfo, FileState, FileType};
use crate::services::clone::CloneBackend;
use crate::services::downloader::Downloader;
use crate::services::peer::PeerSender;
use crate::services::restore::RestoreBackend;
use crate::services::syncing_file::{RegisterRequest, SyncingFile};
use crate::services::{
    AUTO_FORGET_CHECK_INTERVAL, AUTO_FORGET_WAIT_INTERVAL, DEFAULT_SECTOR_SIZE,
};

#[derive(Default)]
struct Registry {
    by_path: HashMap<String, Arc<SyncingFile>>,
    by_uuid: HashMap<String, Arc<SyncingFile>>,
}

pub struct SyncService {
    cancel: CancellationToken,
    downloader: Arc<dyn Downloader>,
    sender: Arc<dyn PeerSender>,
    cloner: Arc<dyn CloneBackend>,
    restorer: Arc<dyn RestoreBackend>,
    registry: RwLock<Registry>,
}

impl SyncService {
    pub fn new(
        cancel: CancellationToken,
        downloader: Arc<dyn Downloader>,
        sender: Arc<dyn PeerSender>,
        cloner: Arc<dyn CloneBackend>,
        restorer: Arc<dyn RestoreBackend>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            cancel,
            downloader,
            sender,
            cloner,
            restorer,
            registry: RwLock::new(Registry::default()),
        });

        // tokio::spawn(service.clone().auto_forget());

        tracing::debug!("Sync service initialized");
        service
    }

    /// The only code path that creates entities: conflict-check both keys,
    /// insert both entries, start the reuse check.
    fn register(&self, req: RegisterRequest) -> Result<Arc<SyncingFile>> {
        if req.size % DEFAULT_SECTOR_SIZE != 0 {
            return Err(AppError::InvalidArgument(format!(
                "file size {} must be a multiple of {DEFAULT_SECTOR_SIZE} bytes for direct IO",
                req.size
            )));
        }

        let path_key = req.file_path.display().to_string();
        let mut registry = self.registry.write().unwrap();

        if registry.by_path.contains_key(&path_key) {
            return Err(AppError::Conflict(format!(
                "file {path_key} is already registered"
            )));
        }
        if registry.by_uuid.contains_key(&req.uuid) {
            return Err(AppError::Conflict(format!(
                "a file with uuid {} is already registered",
                req.uuid
            )));
        }

        let uuid = req.uuid.clone();
        let sf = SyncingFile::new(&self.cancel, req, self.downloader.clone());
        registry.by_path.insert(path_key.clone(), sf.clone());
        registry.by_uuid.insert(uuid, sf.clone());
        tracing::debug!(file = %path_key, "Registered sync file");
        Ok(sf)
    }

    /// Run one transfer operation once the reuse check has resolved. The
    /// entity records its own failure; the driver only logs it.
    fn spawn_driver<Fut>(
        sf: Arc<SyncingFile>,
        op: impl FnOnce(Arc<SyncingFile>) -> Fut + Send + 'static,
    ) where
        Fut: Future<Output = Result<u64>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = sf.wait_for_state_non_pending().await {
                tracing::error!(
                    file = %sf.file_path().display(),
                    error = %e,
                    "Sync file never left the pending state"
                );
                return;
            }
            if let Err(e) = op(sf.clone()).await {
                tracing::error!(
                    file = %sf.file_path().display(),
                    error = %e,
                    "Transfer failed"
                );
            }
        });
    }

    pub fn download_from_url(
        &self,
        req: RegisterRequest,
        url: String,
        data_engine: String,
    ) -> Result<()> {
        let sf = self.register(req)?;
        Self::spawn_driver(sf, move |sf| async move {
            sf.download_from_url(&url, &data_engine).await
        });
        Ok(())
    }

    pub fn fetch(&self, req: RegisterRequest, src_path: PathBuf) -> Result<()> {
        let sf = self.register(req)?;
        Self::spawn_driver(sf, move |sf| async move { sf.fetch(&src_path).await });
        Ok(())
    }

    pub fn receive_from_peer(
        &self,
        req: RegisterRequest,
        port: u16,
        file_type: FileType,
        data_engine: String,
    ) -> Result<()> {
        let sf = self.register(req)?;
        Self::spawn_driver(sf, move |sf| async move {
            sf.receive(port, file_type, &data_engine).await
        });
        Ok(())
    }

    pub fn clone_from_backing_image(
        &self,
        req: RegisterRequest,
        src_image: String,
        src_uuid: String,
        encryption: EncryptionMode,
        credential: HashMap<String, String>,
        data_engine: String,
    ) -> Result<()> {
        let sf = self.register(req)?;
        let backend = self.cloner.clone();
        Self::spawn_driver(sf, move |sf| async move {
            sf.clone_from_backing_image(
                backend,
                &src_image,
                &src_uuid,
                encryption,
                &credential,
                &data_engine,
            )
            .await
        });
        Ok(())
    }

    pub fn restore_from_backup_url(
        &self,
        req: RegisterRequest,
        backup_url: String,
        credential: HashMap<String, String>,
        concurrent_limit: usize,
        data_engine: String,
    ) -> Result<()> {
        let sf = self.register(req)?;
        let backend = self.restorer.clone();
        Self::spawn_driver(sf, move |sf| async move {
            sf.restore_from_backup_url(
                backend,
                &backup_url,
                &credential,
                concurrent_limit,
                &data_engine,
            )
            .await
        });
        Ok(())
    }

    /// Register for an upload. The HTTP handler drives the body pump itself
    /// so backpressure reaches the client.
    pub fn register_for_upload(&self, req: RegisterRequest) -> Result<Arc<SyncingFile>> {
        self.register(req)
    }

    pub async fn send_to_peer(&self, file_path: &str, to_address: &str) -> Result<()> {
        let sf = self.get_file(file_path)?;
        sf.send(to_address, &*self.sender).await
    }

    pub fn get_file(&self, file_path: &str) -> Result<Arc<SyncingFile>> {
        self.registry
            .read()
            .unwrap()
            .by_path
            .get(file_path)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no sync file registered at {file_path}")))
    }

    pub fn get_file_info(&self, file_path: &str) -> Result<FileInfo> {
        Ok(self.get_file(file_path)?.get())
    }

    pub fn list(&self) -> HashMap<String, FileInfo> {
        let snapshot: Vec<Arc<SyncingFile>> = {
            let registry = self.registry.read().unwrap();
            registry.by_path.values().cloned().collect()
        };
        snapshot
            .into_iter()
            .map(|sf| (sf.file_path().display().to_string(), sf.get()))
            .collect()
    }

    /// Drop the entity from both indices; with `delete_file`, cancel its
    /// transfer and unlink the file on disk too.
    pub async fn cleanup(&self, file_path: &str, delete_file: bool) -> Result<()> {
        let sf = {
            let mut registry = self.registry.write().unwrap();
            let sf = registry.by_path.remove(file_path).ok_or_else(|| {
                AppError::NotFound(format!("no sync file registered at {file_path}"))
            })?;
            registry.by_uuid.remove(sf.uuid());
            sf
        };

        tracing::info!(file = file_path, delete_file, "Cleaning up sync file");
        if delete_file {
            sf.delete().await;
        }
        Ok(())
    }

    /// Forget entries that have sat in a terminal state for a day. Not
    /// scheduled yet; enable by uncommenting the spawn in `new`.
    #[allow(dead_code)]
    async fn auto_forget(self: Arc<Self>) {
        let mut wait_list: HashMap<String, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(AUTO_FORGET_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let mut registry = self.registry.write().unwrap();
            let mut forget = Vec::new();
            for (path, sf) in registry.by_path.iter() {
                let state = sf.state();
                if state != FileState::Ready && state != FileState::Failed {
                    wait_list.remove(path);
                    continue;
                }
                let since = *wait_list.entry(path.clone()).or_insert(now);
                if now.duration_since(since) >= AUTO_FORGET_WAIT_INTERVAL {
                    forget.push(path.clone());
                }
            }
            for path in forget {
                if let Some(sf) = registry.by_path.remove(&path) {
                    registry.by_uuid.remove(sf.uuid());
                    wait_list.remove(&path);
                    tracing::debug!(file = %path, "Automatically forgot terminal sync file");
                }
            }
            wait_list.retain(|path, _| registry.by_path.contains_key(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::downloader::{MockDownloader, MOCK_FILE_SIZE};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoopSender;

    #[async_trait::async_trait]
    impl PeerSender for NoopSender {
        async fn send(&self, _file_path: &Path, _to_address: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_service(data_dir: &Path) -> Arc<SyncService> {
        SyncService::new(
            CancellationToken::new(),
            Arc::new(MockDownloader),
            Arc::new(NoopSender),
            Arc::new(crate::services::clone::LocalCloneBackend::new(data_dir)),
            Arc::new(crate::services::restore::HttpRestoreBackend::new()),
        )
    }

    fn request(path: &Path, uuid: &str, size: u64) -> RegisterRequest {
        RegisterRequest {
            file_path: path.to_path_buf(),
            uuid: uuid.to_string(),
            disk_uuid: "disk-1".to_string(),
            expected_checksum: String::new(),
            size,
            file_type: FileType::Raw,
        }
    }

    async fn wait_for_state(
        service: &SyncService,
        path: &str,
        state: FileState,
    ) -> FileInfo {
        for _ in 0..3000 {
            let info = service.get_file_info(path).unwrap();
            if info.state == state {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "file {path} never reached {state}, currently {}",
            service.get_file_info(path).unwrap().state
        );
    }

    #[tokio::test]
    async fn test_duplicate_path_and_uuid_conflict() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());
        let path = temp.path().join("a-uuid1").join("backing");

        service.register(request(&path, "uuid1", 4096)).unwrap();

        let err = service.register(request(&path, "uuid1", 4096)).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_path_only_overlap_conflicts() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());
        let path = temp.path().join("a-uuid1").join("backing");

        service.register(request(&path, "uuid1", 4096)).unwrap();
        let err = service.register(request(&path, "uuid2", 4096)).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_uuid_only_overlap_conflicts() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());

        service
            .register(request(&temp.path().join("a/backing"), "uuid1", 4096))
            .unwrap();
        let err = service
            .register(request(&temp.path().join("b/backing"), "uuid1", 4096))
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unaligned_size_is_rejected() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());

        let err = service
            .register(request(&temp.path().join("backing"), "uuid1", 4097))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert!(service.get_file_info(&temp.path().join("backing").display().to_string()).is_err());
    }

    #[tokio::test]
    async fn test_indices_stay_consistent_through_register_and_cleanup() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());

        let paths: Vec<String> = (0..4)
            .map(|i| {
                temp.path()
                    .join(format!("img{i}-uuid{i}"))
                    .join("backing")
                    .display()
                    .to_string()
            })
            .collect();
        for (i, path) in paths.iter().enumerate() {
            service
                .register(request(Path::new(path), &format!("uuid{i}"), 4096))
                .unwrap();
        }
        assert_eq!(service.list().len(), 4);

        service.cleanup(&paths[1], false).await.unwrap();
        service.cleanup(&paths[2], true).await.unwrap();

        let listed = service.list();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains_key(&paths[0]));
        assert!(listed.contains_key(&paths[3]));

        // Freed keys can be registered again.
        service
            .register(request(Path::new(&paths[1]), "uuid1", 4096))
            .unwrap();
        service
            .register(request(Path::new(&paths[2]), "uuid2", 4096))
            .unwrap();
        assert_eq!(service.list().len(), 4);
    }

    #[tokio::test]
    async fn test_cleanup_unknown_path_is_not_found() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());

        let err = service.cleanup("/nope/backing", true).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_driver_runs_to_ready() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());
        let path = temp.path().join("img-uuid1").join("backing");
        let path_key = path.display().to_string();

        service
            .download_from_url(
                request(&path, "uuid1", 0),
                "http://mock/img".to_string(),
                String::new(),
            )
            .unwrap();

        let info = wait_for_state(&service, &path_key, FileState::Ready).await;
        assert_eq!(info.size, MOCK_FILE_SIZE);
        assert_eq!(info.progress, 100);
        assert!(!info.current_checksum.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_driver_adopts_file_and_delete_removes_it() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());
        let src = temp.path().join("staged");
        let dst = temp.path().join("img-uuid2").join("backing");
        let dst_key = dst.display().to_string();
        tokio::fs::write(&src, vec![0x66u8; 4096]).await.unwrap();

        service
            .fetch(request(&dst, "uuid2", 4096), src.clone())
            .unwrap();
        wait_for_state(&service, &dst_key, FileState::Ready).await;
        assert!(tokio::fs::metadata(&dst).await.is_ok());

        service.cleanup(&dst_key, true).await.unwrap();
        assert!(tokio::fs::metadata(&dst).await.is_err());
        assert!(service.get_file_info(&dst_key).is_err());
    }

    #[tokio::test]
    async fn test_forget_keeps_file_on_disk() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());
        let src = temp.path().join("staged");
        let dst = temp.path().join("img-uuid3").join("backing");
        let dst_key = dst.display().to_string();
        tokio::fs::write(&src, vec![0x66u8; 4096]).await.unwrap();

        service.fetch(request(&dst, "uuid3", 4096), src).unwrap();
        wait_for_state(&service, &dst_key, FileState::Ready).await;

        service.cleanup(&dst_key, false).await.unwrap();
        assert!(service.get_file_info(&dst_key).is_err());
        assert!(tokio::fs::metadata(&dst).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_to_peer_unknown_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let service = test_service(temp.path());

        let err = service
            .send_to_peer("/nope/backing", "127.0.0.1:9000")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
