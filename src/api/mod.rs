//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use self::state::AppState;
use crate::scheduler::{QueueError, ScheduleError};
use crate::storage::StorageError;
use crate::supervisor::SupervisorError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => {
                error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        let body = json!({
            "error": { "message": message },
            "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
        });
        (status, Json(body)).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Conflict(_) | SupervisorError::NotRunning(_) => {
                ApiError::Conflict(e.to_string())
            }
            SupervisorError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            SupervisorError::Spawn { .. } | SupervisorError::Storage(_) => {
                ApiError::Internal(error_chain(&e))
            }
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::InvalidInterval => ApiError::BadRequest(e.to_string()),
            ScheduleError::UnknownJob(_) | ScheduleError::NotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            ScheduleError::Storage(e) => e.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::UnknownJob(_) | QueueError::NotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            QueueError::AlreadyRunning => ApiError::Conflict(e.to_string()),
            QueueError::Empty => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            StorageError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(error_chain(&other)),
        }
    }
}

/// `outer: inner: root` rendering of an error and its sources.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
