//! Sync file lifecycle states and the control-plane view of a file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Lifecycle state of a syncing file.
///
/// States advance only forward: `pending` → `starting` → `in-progress` →
/// `ready` | `failed`. A reuse hit jumps from `pending` straight to `ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileState {
    Pending,
    Starting,
    InProgress,
    Ready,
    Failed,
    Unknown,
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::InProgress => "in-progress",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// On-disk format of a backing image file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Raw,
    Qcow2,
}

impl std::str::FromStr for FileType {
    type Err = AppError;

    /// Parse a `file-type` query value. The empty string selects the default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "raw" => Ok(Self::Raw),
            "qcow2" => Ok(Self::Qcow2),
            other => Err(AppError::InvalidArgument(format!(
                "unknown file type {other}"
            ))),
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Qcow2 => f.write_str("qcow2"),
        }
    }
}

/// Encryption operation applied while cloning from another backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
    Ignore,
}

impl std::str::FromStr for EncryptionMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encrypt" => Ok(Self::Encrypt),
            "decrypt" => Ok(Self::Decrypt),
            "ignore" => Ok(Self::Ignore),
            other => Err(AppError::InvalidArgument(format!(
                "unknown encryption operation {other}"
            ))),
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encrypt => f.write_str("encrypt"),
            Self::Decrypt => f.write_str("decrypt"),
            Self::Ignore => f.write_str("ignore"),
        }
    }
}

/// Snapshot of a syncing file as reported over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_path: String,
    pub uuid: String,
    #[serde(rename = "diskUUID")]
    pub disk_uuid: String,
    pub size: u64,
    pub state: FileState,
    pub progress: u32,
    pub processed_size: u64,
    pub current_checksum: String,
    pub expected_checksum: String,
    pub message: String,
    pub modification_time: DateTime<Utc>,
    pub file_type: FileType,
}
