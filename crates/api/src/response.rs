//! Uniform JSON envelope shared by every endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use depwatch_kubehub::QueryError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Failure path of a handler: `error` is the short summary, `message` the cause.
#[derive(Debug, Error)]
#[error("{error}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn internal(error: impl Into<String>, cause: &dyn std::fmt::Display) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, error: error.into(), message: cause.to_string() }
    }

    pub fn bad_request(error: impl Into<String>, cause: &dyn std::fmt::Display) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: error.into(), message: cause.to_string() }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "Endpoint not found".into(),
            message: "The requested endpoint does not exist".into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        let summary = match &e {
            QueryError::List { resource, .. } => format!("Failed to get {resource}"),
            QueryError::Backend(_) => "Cluster query failed".to_string(),
        };
        Self::internal(summary, &e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> { success: false, data: None, error: Some(self.error), message: Some(self.message) };
        (self.status, Json(body)).into_response()
    }
}
