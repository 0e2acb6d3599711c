//! Registration endpoints: every way a file can be materialized.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

use crate::api::dto::{
    CloneQuery, DownloadQuery, FetchQuery, ReceiveQuery, RestoreQuery, SendQuery, UploadQuery,
};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{EncryptionMode, FileType};
use crate::services::syncing_file::RegisterRequest;

fn require(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::InvalidArgument(format!("{name} is required")));
    }
    Ok(())
}

/// POST /files/fetch — adopt a file already on this disk.
pub async fn fetch(
    State(state): State<SharedState>,
    Query(query): Query<FetchQuery>,
) -> Result<StatusCode> {
    require(&query.src_file_path, "src-file-path")?;
    require(&query.dst_file_path, "dst-file-path")?;
    require(&query.uuid, "uuid")?;
    require(&query.disk_uuid, "disk-uuid")?;

    state.sync.fetch(
        RegisterRequest {
            file_path: PathBuf::from(&query.dst_file_path),
            uuid: query.uuid,
            disk_uuid: query.disk_uuid,
            expected_checksum: query.expected_checksum,
            size: query.size,
            file_type: FileType::Raw,
        },
        PathBuf::from(query.src_file_path),
    )?;
    Ok(StatusCode::OK)
}

/// POST /files/download-from-url
pub async fn download_from_url(
    State(state): State<SharedState>,
    Query(query): Query<DownloadQuery>,
) -> Result<StatusCode> {
    require(&query.file_path, "file-path")?;
    require(&query.uuid, "uuid")?;
    require(&query.url, "url")?;

    state.sync.download_from_url(
        RegisterRequest {
            file_path: PathBuf::from(&query.file_path),
            uuid: query.uuid,
            disk_uuid: query.disk_uuid,
            expected_checksum: query.expected_checksum,
            size: 0,
            file_type: FileType::Raw,
        },
        query.url,
        query.data_engine,
    )?;
    Ok(StatusCode::OK)
}

/// POST /files/upload — multipart body, field name `chunk`.
///
/// The pump runs on this request task, so a stalled disk blocks the reader
/// and TCP backpressure reaches the uploading client.
pub async fn upload(
    State(state): State<SharedState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<StatusCode> {
    require(&query.file_path, "file-path")?;
    require(&query.uuid, "uuid")?;

    let sf = state.sync.register_for_upload(RegisterRequest {
        file_path: PathBuf::from(&query.file_path),
        uuid: query.uuid,
        disk_uuid: query.disk_uuid,
        expected_checksum: query.expected_checksum,
        size: query.size,
        file_type: FileType::Raw,
    })?;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| AppError::InvalidArgument(format!("invalid multipart upload: {e}")))?;
        let Some(field) = field else {
            return Err(AppError::InvalidArgument(
                "upload request carries no 'chunk' form field".to_string(),
            ));
        };
        if field.name() != Some("chunk") {
            tracing::warn!(
                field = field.name().unwrap_or(""),
                "Ignoring unexpected form field in upload request"
            );
            continue;
        }

        sf.wait_for_state_non_pending().await?;

        let stream = Box::pin(field.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);
        sf.clone()
            .idle_timeout_copy_to_file(&mut reader, &query.data_engine)
            .await?;
        return Ok(StatusCode::OK);
    }
}

/// POST /files/receive-from-peer
pub async fn receive_from_peer(
    State(state): State<SharedState>,
    Query(query): Query<ReceiveQuery>,
) -> Result<StatusCode> {
    require(&query.file_path, "file-path")?;
    require(&query.uuid, "uuid")?;

    let file_type: FileType = query.file_type.parse()?;

    state.sync.receive_from_peer(
        RegisterRequest {
            file_path: PathBuf::from(&query.file_path),
            uuid: query.uuid,
            disk_uuid: query.disk_uuid,
            expected_checksum: query.expected_checksum,
            size: query.size,
            file_type,
        },
        query.port,
        file_type,
        query.data_engine,
    )?;
    Ok(StatusCode::OK)
}

/// POST /files/:id/send-to-peer
pub async fn send_to_peer(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<SendQuery>,
) -> Result<StatusCode> {
    require(&query.to_address, "to-address")?;

    state.sync.send_to_peer(&id, &query.to_address).await?;
    Ok(StatusCode::OK)
}

/// POST /files/clone — body is opaque credential JSON.
pub async fn clone_from_backing_image(
    State(state): State<SharedState>,
    Query(query): Query<CloneQuery>,
    credential: Option<Json<HashMap<String, String>>>,
) -> Result<StatusCode> {
    require(&query.file_path, "file-path")?;
    require(&query.uuid, "uuid")?;
    require(&query.backing_image, "backing-image")?;
    require(&query.backing_image_uuid, "backing-image-uuid")?;

    let encryption: EncryptionMode = query.encryption.parse()?;

    state.sync.clone_from_backing_image(
        RegisterRequest {
            file_path: PathBuf::from(&query.file_path),
            uuid: query.uuid,
            disk_uuid: query.disk_uuid,
            expected_checksum: query.expected_checksum,
            size: 0,
            file_type: FileType::Raw,
        },
        query.backing_image,
        query.backing_image_uuid,
        encryption,
        credential.map(|Json(c)| c).unwrap_or_default(),
        query.data_engine,
    )?;
    Ok(StatusCode::OK)
}

/// POST /files/restore-from-backup-url — body is opaque credential JSON.
pub async fn restore_from_backup_url(
    State(state): State<SharedState>,
    Query(query): Query<RestoreQuery>,
    credential: Option<Json<HashMap<String, String>>>,
) -> Result<StatusCode> {
    require(&query.file_path, "file-path")?;
    require(&query.uuid, "uuid")?;
    require(&query.backup_url, "backup-url")?;
    if query.concurrent_limit == 0 {
        return Err(AppError::InvalidArgument(
            "concurrent-limit must be a positive integer".to_string(),
        ));
    }

    state.sync.restore_from_backup_url(
        RegisterRequest {
            file_path: PathBuf::from(&query.file_path),
            uuid: query.uuid,
            disk_uuid: query.disk_uuid,
            expected_checksum: query.expected_checksum,
            size: 0,
            file_type: FileType::Raw,
        },
        query.backup_url,
        credential.map(|Json(c)| c).unwrap_or_default(),
        query.concurrent_limit,
        query.data_engine,
    )?;
    Ok(StatusCode::OK)
}
