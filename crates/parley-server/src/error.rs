//! Request-level errors and their client-facing form.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_resilience::{ErrorKind, ErrorResponse, RateLimitExceeded};
use parley_voice::{EngineError, VoiceError};
use std::time::Duration;
use thiserror::Error;

/// Anything a handler or session can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be parsed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The request parsed but its content is unusable.
    #[error("{0}")]
    UserInput(String),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UserInput(_) => ErrorKind::UserInput,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Engine(e) => e.kind(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(e) => Some(e.retry_after),
            Self::Engine(e) => e.retry_after(),
            _ => self.kind().retry_after(),
        }
    }

    /// Builds the payload sent to clients: the kind's fallback text, plus the
    /// raw error text only when `expose_details` is set.
    pub fn to_response(&self, expose_details: bool) -> ErrorResponse {
        let response = self
            .kind()
            .info()
            .to_response(expose_details.then(|| self.to_string()));
        match self.retry_after() {
            Some(delay) => response.with_retry_after(delay),
            None => response,
        }
    }
}

/// An [`ErrorResponse`] on its way out of an HTTP handler.
#[derive(Debug)]
pub struct ApiFailure(pub ErrorResponse);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after_secs = self.0.retry_after_ms.map(|ms| ms.div_ceil(1000));

        let mut response = (status, Json(serde_json::json!({ "error": self.0 }))).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Fatal start-up failures.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build voice pipeline: {0}")]
    Voice(#[from] VoiceError),

    #[error("failed to set up metrics: {0}")]
    Metrics(#[from] parley_observe::ObserveError),
}
