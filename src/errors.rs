use crate::services::{
    blob_client::BlobError, ingest_service::IngestError, proxy_service::ProxyError,
    tree_service::TreeError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by every handler, rendered as a JSON body.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// Stable machine-readable kind, e.g. `not_found`.
    pub reason: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, reason and message.
    pub fn new(status: StatusCode, reason: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", msg)
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
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, reason = self.reason, "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "reason": self.reason,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<TreeError> for AppError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound(_) => AppError::not_found(err.to_string()),
            TreeError::InvalidParent(_) => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_parent", err.to_string())
            }
            TreeError::InvalidMove { .. } => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_move", err.to_string())
            }
            TreeError::InvalidName => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_name", err.to_string())
            }
            TreeError::Sqlx(e) => AppError::internal(format!("database error: {e}")),
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        AppError::upstream_unavailable(err.to_string())
    }
}

impl From<ProxyError> for AppError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Tree(e) => e.into(),
            ProxyError::NoContent(_) => AppError::not_found(err.to_string()),
            ProxyError::Upstream(e) => e.into(),
            ProxyError::RangeNotSatisfiable { .. } => AppError::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "range_not_satisfiable",
                err.to_string(),
            ),
            ProxyError::PlaylistTooLarge { .. } => AppError::new(
                StatusCode::BAD_GATEWAY,
                "playlist_too_large",
                err.to_string(),
            ),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::PayloadTooLarge { .. } => AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                err.to_string(),
            ),
            IngestError::Tree(e) => e.into(),
            IngestError::Upstream(e) => e.into(),
            IngestError::IngestFailed { .. } => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ingest_failed",
                err.to_string(),
            ),
        }
    }
}
