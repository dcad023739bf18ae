//! HTTP API handlers.
//!
//! - `/api/fields` field catalog
//! - `/api/labels` active labels
//! - `/api/rules` rule definitions and execution

pub mod fields;
pub mod labels;
pub mod rules;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, response::Response};
use mailsift_core::rules::{RuleError, ValidationError};
use mailsift_core::EngineError;
use serde::Serialize;

use crate::AppState;

/// Create the main API router with all endpoints mounted.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/fields", fields::router())
        .nest("/labels", labels::router())
        .nest("/rules", rules::router())
}

/// Error response for API errors.
#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Maps an engine failure to a status code and JSON error body. Store failures
/// are logged with `context` and reported without detail.
pub(crate) fn engine_error_response(context: &str, err: EngineError) -> Response {
    match err {
        EngineError::Rule(RuleError::NotFound(what)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("Rule not found: {what}"))),
        )
            .into_response(),
        EngineError::Rule(RuleError::DuplicateName(name))
        | EngineError::Validation(ValidationError::DuplicateRuleName(name)) => (
            StatusCode::CONFLICT,
            Json(ApiError::conflict(format!("A rule named {name:?} already exists"))),
        )
            .into_response(),
        EngineError::Validation(
            err @ (ValidationError::Label(_) | ValidationError::Rule(_)),
        ) => internal(context, &err),
        EngineError::Validation(err) => (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(err.to_string())),
        )
            .into_response(),
        EngineError::Compile(err) => (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(err.to_string())),
        )
            .into_response(),
        other => internal(context, &other),
    }
}

fn internal(context: &str, err: &dyn std::error::Error) -> Response {
    tracing::error!(error = %err, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::internal(context.to_string())),
    )
        .into_response()
}
