use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gemini_proxy_shared::ErrorBody;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or empty client payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backend could not be reached at all.
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String, timed_out: bool },

    /// The backend answered with an application-level error.
    #[error("{message}")]
    BackendRejected { status: u16, message: String },

    /// The backend stream ended abnormally after it had started.
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BackendUnavailable { timed_out: true, .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::BackendRejected { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                500..=599 => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            ProxyError::StreamInterrupted(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::BackendUnavailable {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!(status = %status, "{}", self);
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
