//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hubbub_core::AdmissionError;
use hubbub_protocol::MessageId;
use thiserror::Error;

use crate::auth::AuthError;
use crate::metrics;
use crate::storage::StoreError;

/// Errors returned by the HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or empty submission.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or invalid admin credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// Nickname rejected by policy.
    #[error("Prohibited nickname")]
    ProhibitedNickname,

    /// No such message.
    #[error("Message {0} not found")]
    NotFound(MessageId),

    /// Per-address connection ceiling reached.
    #[error(transparent)]
    TooManyConnections(#[from] AdmissionError),

    /// Anything else.
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ProhibitedNickname => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TooManyConnections(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        Self::Unauthorized
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(error = %detail, "Request failed");
            metrics::record_error("internal");
        }

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}
