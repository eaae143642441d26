//! Error taxonomy for the chat core.
//!
//! The session registry and message pipeline return these; the per-connection
//! actor is the only place that turns them into `error` events (and decides
//! whether to close the socket). The REST layer maps them to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad or forbidden input (username, message shape).
    #[error("{0}")]
    Validation(String),

    /// Rejected by runtime policy: rate limit, disabled feature, full room.
    #[error("{0}")]
    Policy(String),

    #[error("{0}")]
    NotFound(String),

    /// Blocked address or active ban. Always followed by a forced close.
    #[error("{0}")]
    Authorization(String),

    /// An external collaborator (text generation) failed or timed out.
    #[error("Dependency failed: {0}")]
    Dependency(String),

    #[error("Database error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        ChatError::Policy(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ChatError::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ChatError::Authorization(msg.into())
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn forces_disconnect(&self) -> bool {
        matches!(self, ChatError::Authorization(_))
    }

    /// Text safe to show to the client. Store internals are never leaked.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Store(_) => "Internal server error".to_string(),
            ChatError::Dependency(_) => "Service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Policy(msg) if msg.starts_with("Rate limit") => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Policy(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::Dependency(_) => StatusCode::BAD_GATEWAY,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let ChatError::Store(ref e) = self {
            tracing::error!(error = %e, "Store error while serving request");
        }
        let body = serde_json::json!({ "error": self.client_message() });
        (self.status(), axum::Json(body)).into_response()
    }
}
