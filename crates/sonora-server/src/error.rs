//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Error returned to clients as `{"detail": message}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, msg)
    }

    pub fn unsupported_media_type(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "{}", self.message);
        }
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

impl From<sonora_core::Error> for ApiError {
    fn from(err: sonora_core::Error) -> Self {
        match &err {
            sonora_core::Error::InvalidInput(_) | sonora_core::Error::AudioDecode(_) => {
                ApiError::bad_request(err.to_string())
            }
            sonora_core::Error::ModelNotFound(_) => ApiError::not_found(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

/// Storage failures are never the client's fault.
pub fn map_store_error(err: anyhow::Error) -> ApiError {
    ApiError::internal(format!("Task storage error: {err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_client_statuses() {
        let cases = [
            (sonora_core::Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (sonora_core::Error::AudioDecode("x".into()), StatusCode::BAD_REQUEST),
            (sonora_core::Error::ModelNotFound("x".into()), StatusCode::NOT_FOUND),
            (sonora_core::Error::Inference("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
