use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use relay_core::errors::GatewayError;
use relay_engine::EngineError;

const MASKED_MESSAGE: &str = "Internal server error";

/// Errors surfaced to HTTP clients as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("{}", .0.detail())]
    Upstream(#[from] GatewayError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Hide internal details when running in production.
    pub fn masked(self, production: bool) -> Self {
        match self {
            Self::Internal(_) if production => Self::Internal(MASKED_MESSAGE.to_string()),
            other => other,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::MissingSessionId | EngineError::EmptyBatch => Self::BadRequest(err.to_string()),
            EngineError::QueueAlreadyRunning | EngineError::QueueDrained | EngineError::Internal(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Failures while bringing the server up.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("failed to build provider: {0}")]
    Provider(#[from] GatewayError),
}
