//! Error types for the gateway layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quadlink_realtime::RealtimeError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<RealtimeError> for GatewayError {
    fn from(error: RealtimeError) -> Self {
        match error {
            RealtimeError::Unauthorized { .. } => {
                GatewayError::AuthenticationFailed(error.to_string())
            }
            RealtimeError::Unavailable { .. } => {
                GatewayError::ServiceUnavailable(error.to_string())
            }
            RealtimeError::InvalidArgument { .. } => {
                GatewayError::InvalidRequest(error.to_string())
            }
            other => GatewayError::InternalError(other.to_string()),
        }
    }
}
