//! Error taxonomy for audio delivery.
//!
//! Only the coarse `DeliveryError` kinds ever reach a client. Upstream and
//! I/O causes are logged where they happen and then folded into one of them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Client-facing failure of an audio request.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0}")]
    Validation(String),

    #[error("caller is not internal")]
    Unauthorized,

    #[error("path for '{0}' escapes its tier root")]
    Forbidden(String),

    #[error("artifact '{0}' unobtainable after regeneration")]
    NotFound(String),

    #[error("reading artifact failed: {0}")]
    Internal(#[source] std::io::Error),

    #[error("synthesis for '{0}' failed")]
    Unavailable(String),
}

impl DeliveryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message sent to the client. Never includes paths or upstream causes.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Unauthorized => "Unauthorized".into(),
            Self::Forbidden(_) => "Access forbidden".into(),
            Self::NotFound(_) => "File not found after all regeneration attempts".into(),
            Self::Internal(_) => "Error reading file".into(),
            Self::Unavailable(_) => "Speech synthesis unavailable".into(),
        }
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.public_message() }));
        (self.status(), body).into_response()
    }
}

/// Failure talking to the completion or synthesis service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{service} credential is not configured")]
    MissingCredential { service: &'static str },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned an unusable response: {reason}")]
    InvalidResponse {
        service: &'static str,
        reason: String,
    },

    #[error("writing synthesized audio failed: {0}")]
    Storage(#[from] std::io::Error),
}

impl UpstreamError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MissingCredential { .. } => false,
            Self::Transport { .. } | Self::InvalidResponse { .. } | Self::Storage(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}
