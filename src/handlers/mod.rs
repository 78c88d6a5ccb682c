pub mod instances;
pub mod intents;
pub mod sessions;
pub mod versions;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::CoreError;

/// Error response body: {"error": "message"}
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// API error type
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            CoreError::DuplicateInstance(_) | CoreError::Busy(_) => StatusCode::CONFLICT,
            CoreError::UnsupportedFeatureArea(_)
            | CoreError::UnsupportedVersion { .. }
            | CoreError::InvalidIntent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::ConnectionError { .. } => StatusCode::BAD_GATEWAY,
            CoreError::TransportTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::CommandRejected { .. } | CoreError::SessionClosed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

/// Response helper: return 201 Created with JSON body
pub fn created<T: Serialize>(item: T) -> (StatusCode, Json<T>) {
    (StatusCode::CREATED, Json(item))
}

/// Healthcheck endpoint: returns 200 OK with status
pub async fn healthcheck() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "vyos-forge",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
