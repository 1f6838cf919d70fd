//! API error responses

use alerting::AlertError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors returned by handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Alert(#[from] AlertError),

    /// Request body could not be parsed
    #[error(transparent)]
    InvalidBody(#[from] JsonRejection),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Alert(AlertError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Alert(AlertError::InvalidMeasurement(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Alert(AlertError::InvariantViolation(_) | AlertError::Storage(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::InvalidBody(rejection) => rejection.status(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
