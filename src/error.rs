//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A file with the same path or uuid is already registered
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The sync file never left the pending state within the preparation budget
    #[error("Preparation timeout: {0}")]
    PreparationTimeout(String),

    /// No bytes moved within the idle window
    #[error("Idle timeout: {0}")]
    IdleTimeout(String),

    /// Upstream HTTP failure, refused peer connection, or backup store error
    #[error("Source error: {0}")]
    SourceError(String),

    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] axum::http::Error),
}

impl AppError {
    /// Map error variant to HTTP status code and machine-readable error code.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            Self::PreparationTimeout(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PREPARATION_TIMEOUT")
            }
            Self::IdleTimeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IDLE_TIMEOUT"),
            Self::SourceError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SOURCE_ERROR"),
            Self::SizeMismatch(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SIZE_MISMATCH"),
            Self::ChecksumMismatch(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CHECKSUM_MISMATCH"),
            Self::Cancelled(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CANCELLED"),
            Self::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::Request(_) => (StatusCode::INTERNAL_SERVER_ERROR, "REQUEST_ERROR"),
            Self::AddrParse(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ADDR_PARSE_ERROR"),
            Self::Http(_) => (StatusCode::INTERNAL_SERVER_ERROR, "HTTP_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        tracing::error!(error = %self, code = code, "Request error");

        let body = Json(json!({
            "code": code,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
