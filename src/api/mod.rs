//! API module - HTTP handlers and shared state.

pub mod dto;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::services::sync_service::SyncService;

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(config: Config, sync: Arc<SyncService>) -> Self {
        Self { config, sync }
    }
}

pub type SharedState = Arc<AppState>;
