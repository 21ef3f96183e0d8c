//! HTTP error response handling for the delivery server
//!
//! Converts domain errors to HTTP responses with appropriate status codes
//! and JSON error bodies.

use crate::error::{ApiError, Error, ToHttpStatus};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Convert domain errors to HTTP responses automatically
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let api_error: ApiError = self.into();

        (status_code, Json(api_error)).into_response()
    }
}

/// Explicit error responses built directly from an [`ApiError`]
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Errors normally go through Error::into_response, which knows the
        // status; a bare ApiError defaults to 500.
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}
