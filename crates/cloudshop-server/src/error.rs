//! Maps library errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use cloudshop_core::Error;

/// Handler error: the underlying [`Error`] plus the status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: Error,
}

impl ApiError {
    /// Graph problems in a stored order are unprocessable rather than bad requests.
    pub fn graph(error: Error) -> Self {
        let status = match &error {
            Error::Validation(_) | Error::DependencyCycle(_) => StatusCode::UNPROCESSABLE_ENTITY,
            other => status_for(other),
        };
        Self { status, error }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::from(Error::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            status: status_for(&error),
            error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            error!("Request failed: {}", self.error);
        }
        let body = json!({
            "success": false,
            "error": self.error.to_string(),
            "kind": self.error.kind(),
        });
        (self.status, Json(body)).into_response()
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::DependencyCycle(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::AlreadyRunning(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
