//! API error handling.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use isoforge_scheduler::{AdmissionError, DeliveryError};
use serde_json::json;
use tracing::error;

/// API error type.
///
/// Every response body is `{"error": <message>, "reason": <code>}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
    /// A domain rejection carrying its own status and reason code.
    Rejected {
        status: StatusCode,
        reason: &'static str,
        message: String,
    },
}

impl ApiError {
    fn rejected(status: StatusCode, reason: &'static str, message: impl ToString) -> Self {
        ApiError::Rejected {
            status,
            reason,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
            ApiError::Rejected {
                status,
                reason,
                message,
            } => (status, reason, message),
        };

        let body = Json(json!({
            "error": message,
            "reason": reason,
        }));

        (status, body).into_response()
    }
}

impl From<isoforge_core::Error> for ApiError {
    fn from(err: isoforge_core::Error) -> Self {
        match err {
            isoforge_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            isoforge_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            isoforge_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            isoforge_core::Error::Conflict(msg) => {
                ApiError::rejected(StatusCode::CONFLICT, "conflict", msg)
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        let status = match err {
            AdmissionError::Invalid(_) => StatusCode::BAD_REQUEST,
            AdmissionError::CeilingReached { .. } | AdmissionError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AdmissionError::Storage(_) => return ApiError::Internal(err.to_string()),
        };
        ApiError::rejected(status, err.reason(), &err)
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        let status = match err {
            DeliveryError::NotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::NotCompleted(_) => StatusCode::CONFLICT,
            DeliveryError::ArtifactGone(_) => StatusCode::GONE,
            DeliveryError::Expired | DeliveryError::InvalidSignature => StatusCode::FORBIDDEN,
            DeliveryError::Storage(_) => return ApiError::Internal(err.to_string()),
        };
        ApiError::rejected(status, err.reason(), &err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
