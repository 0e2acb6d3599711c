//! Application configuration loaded from environment variables.

use crate::error::Result;
use std::env;

/// Read an environment variable and parse it, falling back to a default on missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (host:port)
    pub bind_address: String,

    /// Root directory holding backing image files
    /// (each image lives at `<data_dir>/<name>-<uuid>/backing`)
    pub data_dir: String,

    /// Log level
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env_parse("SYNC_BIND_ADDRESS", "0.0.0.0:8000".to_string()),
            data_dir: env_parse(
                "BACKING_IMAGE_DATA_DIR",
                "/var/lib/backing-images".to_string(),
            ),
            log_level: env_parse("LOG_LEVEL", "info".to_string()),
        })
    }
}
