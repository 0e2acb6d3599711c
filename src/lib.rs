//! Backing Image Sync - node-local sync server library.
//!
//! Materializes named, checksum-verified image files on local disk from
//! HTTP downloads, peer transfers, uploads, backup restores, or clones of
//! existing images, and serves them onward to peer nodes.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;

pub use config::Config;
pub use error::{AppError, Result};
