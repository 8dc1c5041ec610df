use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::services::{catalog::CatalogError, raster::RasterError};

/// Failures of the upload, publish and record workflow.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("{0}")]
    Validation(String),
    #[error("unsupported file type `{0}` (expected geotiff or shapefile)")]
    UnsupportedType(String),
    #[error("upload `{upload_id}` is missing chunks {missing:?}")]
    MissingChunks { upload_id: String, missing: Vec<u32> },
    #[error("upload exceeds the size limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },
    #[error("upload `{0}` is already being assembled")]
    AssemblyInProgress(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type MapResult<T> = Result<T, MapError>;

impl MapError {
    /// Stable error kind reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::MissingChunks { .. } => "missing_chunks",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::AssemblyInProgress(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Raster(err) => err.kind(),
            Self::Catalog(_) => "publish_error",
            Self::Sqlx(_) | Self::Io(_) | Self::Zip(_) | Self::Join(_) => "storage_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::UnsupportedType(_)
            | Self::MissingChunks { .. }
            | Self::Raster(_) => StatusCode::BAD_REQUEST,
            Self::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::AssemblyInProgress(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Catalog(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Catalog(_) => StatusCode::BAD_GATEWAY,
            Self::Sqlx(_) | Self::Io(_) | Self::Zip(_) | Self::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Catalog(err) if err.is_retryable())
            || matches!(self, Self::AssemblyInProgress(_))
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
            retryable: false,
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind,
            "message": self.message,
            "status": self.status.as_u16(),
            "retryable": self.retryable,
        }));

        (self.status, body).into_response()
    }
}

impl From<MapError> for AppError {
    fn from(err: MapError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::error!(kind = err.kind(), "request failed: {}", err);
        } else {
            tracing::debug!(kind = err.kind(), "request rejected: {}", err);
        }
        Self {
            status,
            kind: err.kind(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}
