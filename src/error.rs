//! Canonical error taxonomy for the live-session core and HTTP surface.
//!
//! Adapters and stores return `anyhow::Result`; at the point where an error
//! crosses into the live-session core or the HTTP layer it is classified
//! into one of these kinds. The HTTP layer maps each kind to a status code.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ArchonError {
    /// Malformed input, unknown approval decision, missing required field,
    /// unsupported payload type.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Session/approval/workspace absent.
    #[error("not_found: {0}")]
    NotFound(String),

    /// Required dependency unavailable at call time, or a transient
    /// provider-unreachable condition.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The at-most-one-turn rule was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ArchonError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// `true` for kinds that must never be retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::NotFound(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ArchonError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(err = %self, "internal error");
        }
        let body = Json(json!({
            "error": self.tag(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ArchonError>;
