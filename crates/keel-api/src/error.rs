//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<keel_core::Error> for ApiError {
    fn from(err: keel_core::Error) -> Self {
        use keel_core::Error;
        let message = err.to_string();
        match err {
            Error::Unauthorized(_) => ApiError::Unauthorized(message),
            Error::MalformedPayload(_) => ApiError::BadRequest(message),
            Error::UnknownProject(_) => ApiError::NotFound(message),
            Error::QueueFull { .. } | Error::ShuttingDown => ApiError::Unavailable(message),
            Error::DuplicateInFlight { .. } => ApiError::Conflict(message),
            _ => ApiError::Internal(message),
        }
    }
}
