//! Read, cleanup, and direct-download endpoints.

use std::collections::HashMap;
use std::path::Path as FilePath;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Method, Response, StatusCode};
use axum::Json;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::fs;
use tokio_util::io::{ReaderStream, SyncIoBridge};

use crate::api::dto::DownloadToDstQuery;
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{FileInfo, FileState};

/// GET /files
pub async fn list(State(state): State<SharedState>) -> Result<Json<HashMap<String, FileInfo>>> {
    Ok(Json(state.sync.list()))
}

/// GET /files/:id
pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<FileInfo>> {
    Ok(Json(state.sync.get_file_info(&id)?))
}

/// DELETE /files/:id — cleanup including the file on disk.
pub async fn delete(State(state): State<SharedState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.sync.cleanup(&id, true).await?;
    Ok(StatusCode::OK)
}

/// DELETE /files/:id/forget — cleanup leaving the file on disk.
pub async fn forget(State(state): State<SharedState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.sync.cleanup(&id, false).await?;
    Ok(StatusCode::OK)
}

/// GET/HEAD /files/:id/download — stream a ready file to the caller.
///
/// Default mode gzips the stream; `forV2Creation=true` sends raw bytes with
/// an exact Content-Length so the caller can preallocate.
pub async fn download_to_dst(
    method: Method,
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadToDstQuery>,
) -> Result<Response<Body>> {
    let sf = state.sync.get_file(&id)?;
    let file_state = sf.state();
    if file_state != FileState::Ready {
        return Err(AppError::InvalidArgument(format!(
            "cannot stream file {id} in state {file_state}"
        )));
    }
    let path = sf.file_path().to_path_buf();

    if query.for_v2_creation {
        let meta = fs::metadata(&path).await?;
        let builder = Response::builder()
            .header(CONTENT_LENGTH, meta.len())
            .header(CONTENT_TYPE, "application/octet-stream");

        if method == Method::HEAD {
            return Ok(builder.body(Body::empty())?);
        }
        let file = fs::File::open(&path).await?;
        return Ok(builder.body(Body::from_stream(ReaderStream::new(file)))?);
    }

    let builder = Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename={}.gz", download_file_name(&path)),
        );

    if method == Method::HEAD {
        return Ok(builder.body(Body::empty())?);
    }

    // flate2 writes synchronously; bridge it to the response body through a
    // duplex pipe fed from a blocking task.
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    tokio::task::spawn_blocking(move || {
        let result = (|| -> std::io::Result<()> {
            let mut src = std::fs::File::open(&path)?;
            let mut gz = GzEncoder::new(SyncIoBridge::new(writer), Compression::default());
            std::io::copy(&mut src, &mut gz)?;
            gz.finish()?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(error = %e, "Gzip download stream aborted");
        }
    });

    Ok(builder.body(Body::from_stream(ReaderStream::new(reader)))?)
}

/// Derive the attachment name prefix from the parent directory:
/// `/data/parrot-6846a0b2/backing` → `parrot`.
fn download_file_name(path: &FilePath) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(|n| n.split('-').next().unwrap_or(n))
        .unwrap_or("backing")
        .to_string()
}
