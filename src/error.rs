use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;
use thiserror::Error;

/// Convenience type alias for Results with SpiralError
pub type Result<T> = std::result::Result<T, SpiralError>;

/// Error taxonomy for the task lifecycle engine.
///
/// `CompletionRejected` and orchestrator timeouts are not represented here —
/// they are ordinary decisions (`CompletionDecision`, `OrchestratorAction::Fallback`),
/// never propagated as errors.
#[derive(Error, Debug)]
pub enum SpiralError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gateway error: {0}")]
    GatewayError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("gateway transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("security error: {0}")]
    Security(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for SpiralError {
    fn into_response(self) -> Response {
        let status = match &self {
            SpiralError::NotFound(_) => StatusCode::NOT_FOUND,
            SpiralError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SpiralError::Conflict(_) => StatusCode::CONFLICT,
            SpiralError::GatewayError(_) | SpiralError::Http(_) => StatusCode::BAD_GATEWAY,
            SpiralError::Unauthorized => StatusCode::UNAUTHORIZED,
            SpiralError::Security(_) => StatusCode::FORBIDDEN,
            SpiralError::ConfigurationError(_)
            | SpiralError::Config(_)
            | SpiralError::Serialization(_)
            | SpiralError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
