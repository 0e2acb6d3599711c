//! Backing Image Sync - Server Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backing_image_sync::api::{routes, AppState};
use backing_image_sync::config::Config;
use backing_image_sync::error::Result;
use backing_image_sync::services::clone::LocalCloneBackend;
use backing_image_sync::services::downloader::HttpDownloader;
use backing_image_sync::services::peer::HttpPeerSender;
use backing_image_sync::services::restore::HttpRestoreBackend;
use backing_image_sync::services::sync_service::SyncService;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backing_image_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting backing image sync server");

    // Root cancellation token: shutdown fans out to every in-flight transfer
    let cancel = CancellationToken::new();

    let sync = SyncService::new(
        cancel.clone(),
        Arc::new(HttpDownloader::new()),
        Arc::new(HttpPeerSender::new()),
        Arc::new(LocalCloneBackend::new(&config.data_dir)),
        Arc::new(HttpRestoreBackend::new()),
    );

    // Create application state and router
    let state = Arc::new(AppState::new(config.clone(), sync));
    let app = routes::create_router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down, cancelling in-flight transfers");
            shutdown_cancel.cancel();
        })
        .await?;

    Ok(())
}
