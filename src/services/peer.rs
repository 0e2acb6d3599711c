//! Peer-to-peer file push: a one-shot receiver endpoint and the sender that
//! streams a completed file into it.
//!
//! The receiver accepts a single `POST /` on the negotiated port and pumps
//! the body through the idle-timeout copy, so zero blocks arrive as holes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use futures::TryStreamExt;
use tokio::fs;
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::storage::copy::{idle_timeout_copy, ProgressUpdater};

/// Pushes a completed file to a peer's receiver endpoint. Injected into the
/// sync service so tests can fake the network.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send(&self, file_path: &Path, to_address: &str) -> Result<()>;
}

/// Production sender: streams the file as a single POST body.
pub struct HttpPeerSender {
    client: reqwest::Client,
}

impl HttpPeerSender {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        Self { client }
    }
}

impl Default for HttpPeerSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerSender for HttpPeerSender {
    async fn send(&self, file_path: &Path, to_address: &str) -> Result<()> {
        let file = fs::File::open(file_path).await?;
        let len = file.metadata().await?.len();

        let resp = self
            .client
            .post(format!("http://{to_address}/"))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| {
                AppError::SourceError(format!("failed to push file to peer {to_address}: {e}"))
            })?;

        if !resp.status().is_success() {
            return Err(AppError::SourceError(format!(
                "peer {to_address} rejected the transfer: {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

struct ReceiveState {
    file_path: PathBuf,
    updater: Arc<dyn ProgressUpdater>,
    cancel: CancellationToken,
    outcome: Mutex<Option<Result<u64>>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

/// Serve one inbound transfer on `port` and return the number of bytes
/// moved into `file_path`. The destination must already exist (preallocated
/// by the caller); cancellation tears the listener down.
pub(crate) async fn receive_once(
    port: u16,
    file_path: PathBuf,
    updater: Arc<dyn ProgressUpdater>,
    cancel: CancellationToken,
) -> Result<u64> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let state = Arc::new(ReceiveState {
        file_path,
        updater,
        cancel: cancel.clone(),
        outcome: Mutex::new(None),
        done: Mutex::new(Some(done_tx)),
    });

    let app = Router::new()
        .route("/", post(receive_file))
        .with_state(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = done_rx => {}
                _ = cancel.cancelled() => {}
            }
        })
        .await?;

    let outcome = state.outcome.lock().unwrap().take();
    match outcome {
        Some(result) => result,
        None => Err(AppError::Cancelled(
            "receive aborted before any peer connected".to_string(),
        )),
    }
}

async fn receive_file(State(state): State<Arc<ReceiveState>>, body: Body) -> StatusCode {
    let result = write_body(&state, body).await;
    let status = if result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    *state.outcome.lock().unwrap() = Some(result);
    if let Some(done) = state.done.lock().unwrap().take() {
        let _ = done.send(());
    }
    status
}

async fn write_body(state: &ReceiveState, body: Body) -> Result<u64> {
    let mut dst = fs::OpenOptions::new()
        .write(true)
        .open(&state.file_path)
        .await?;
    let stream = Box::pin(body.into_data_stream().map_err(std::io::Error::other));
    let mut reader = StreamReader::new(stream);
    idle_timeout_copy(&mut reader, &mut dst, &*state.updater, false, &state.cancel).await
}
