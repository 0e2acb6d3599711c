//! Route definitions for the sync control surface.

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};

use super::handlers::{files, sync_ops};
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    let router = Router::new()
        .route("/files", get(files::list))
        .route("/files/fetch", post(sync_ops::fetch))
        .route("/files/download-from-url", post(sync_ops::download_from_url))
        .route("/files/upload", post(sync_ops::upload))
        .route("/files/receive-from-peer", post(sync_ops::receive_from_peer))
        .route("/files/clone", post(sync_ops::clone_from_backing_image))
        .route(
            "/files/restore-from-backup-url",
            post(sync_ops::restore_from_backup_url),
        )
        .route("/files/:id", get(files::get).delete(files::delete))
        .route("/files/:id/forget", delete(files::forget))
        .route("/files/:id/send-to-peer", post(sync_ops::send_to_peer))
        .route("/files/:id/download", get(files::download_to_dst));

    // Uploaded images can be multiple GB; axum's default body limit would
    // silently truncate them.
    router
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}
