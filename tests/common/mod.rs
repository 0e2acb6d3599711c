//! Common test utilities for sync server integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use backing_image_sync::api::{routes, AppState};
use backing_image_sync::config::Config;
use backing_image_sync::models::{FileInfo, FileState};
use backing_image_sync::services::clone::LocalCloneBackend;
use backing_image_sync::services::downloader::HttpDownloader;
use backing_image_sync::services::peer::HttpPeerSender;
use backing_image_sync::services::restore::HttpRestoreBackend;
use backing_image_sync::services::sync_service::SyncService;

/// A sync server bound to an ephemeral port with its own data directory.
pub struct TestServer {
    pub base_url: String,
    pub data_dir: TempDir,
    pub cancel: CancellationToken,
}

pub async fn spawn_sync_server() -> TestServer {
    let data_dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let sync = SyncService::new(
        cancel.clone(),
        Arc::new(HttpDownloader::new()),
        Arc::new(HttpPeerSender::new()),
        Arc::new(LocalCloneBackend::new(data_dir.path())),
        Arc::new(HttpRestoreBackend::with_part_size(1024)),
    );

    let config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        data_dir: data_dir.path().display().to_string(),
        log_level: "info".to_string(),
    };
    let state = Arc::new(AppState::new(config, sync));
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        data_dir,
        cancel,
    }
}

/// Serve `content` at `/image` over GET/HEAD on an ephemeral port.
pub async fn spawn_origin(content: Vec<u8>) -> String {
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;

    async fn image(State(content): State<Arc<Vec<u8>>>) -> Vec<u8> {
        content.as_ref().clone()
    }

    let app = Router::new()
        .route("/image", get(image))
        .with_state(Arc::new(content));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/image")
}

/// Percent-encode a file path for use as the `{id}` path segment.
pub fn encode_path(path: &str) -> String {
    path.replace('/', "%2F")
}

/// Poll `/files/{id}` until the file reaches `state`.
pub async fn wait_for_file_state(
    client: &reqwest::Client,
    base_url: &str,
    file_path: &str,
    state: FileState,
) -> FileInfo {
    let url = format!("{base_url}/files/{}", encode_path(file_path));
    for _ in 0..600 {
        let resp = client.get(&url).send().await.unwrap();
        if resp.status().is_success() {
            let info: FileInfo = resp.json().await.unwrap();
            if info.state == state {
                return info;
            }
            assert!(
                info.state != FileState::Failed || state == FileState::Failed,
                "file {file_path} failed unexpectedly: {}",
                info.message
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("file {file_path} never reached state {state}");
}
