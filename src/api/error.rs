use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::QueueError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::InvalidInput(msg) | QueueError::InvalidStatus(msg) => {
                ApiError::BadRequest(msg)
            }
            QueueError::NotFound(_) => ApiError::NotFound(e.to_string()),
            QueueError::Unavailable(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Renders `{error, status}` with the reason phrase of the HTTP status.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let ApiError::Internal(msg) = &self {
            tracing::error!(error = %msg, "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.canonical_reason().unwrap_or("Unknown"),
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
