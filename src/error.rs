//! Error types for the ingestion pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any side effect
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid job descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse '{filename}': {message}")]
    Parse { filename: String, message: String },

    #[error("Table write failed: {0}")]
    Table(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn parse(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            filename: filename.into(),
            message: message.into(),
        }
    }

    pub fn blob(message: impl Into<String>) -> Self {
        Self::Blob(message.into())
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    pub fn table(message: impl Into<String>) -> Self {
        Self::Table(message.into())
    }

    /// Retrying cannot change the outcome of a permanent error.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::NotFound(_)
                | Error::BlobNotFound(_)
                | Error::InvalidDescriptor(_)
                | Error::UnsupportedFormat(_)
                | Error::Parse { .. }
                | Error::Json(_)
                | Error::Config(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::UnsupportedFormat(_) => (StatusCode::BAD_REQUEST, "unsupported_type"),
            Error::Json(_) => (StatusCode::BAD_REQUEST, "json_error"),
            Error::Blob(_) | Error::BlobNotFound(_) => (StatusCode::BAD_GATEWAY, "blob_store_error"),
            Error::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
