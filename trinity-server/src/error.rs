//! HTTP error mapping
//!
//! The single place that turns core error variants into status codes.
//! Internal errors never leak detail: the response carries an opaque
//! `ERR-` reference, the full error goes to the log under that
//! reference.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use trinity_core::Error;

/// Wrapper giving core errors an HTTP shape
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<trinity_store::StoreError> for ApiError {
    fn from(err: trinity_store::StoreError) -> Self {
        Self(err.into())
    }
}

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

fn error_reference() -> String {
    format!("ERR-{}", &uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            Error::Validation(message) => respond(StatusCode::BAD_REQUEST, &message, None),
            Error::Auth(message) => respond(StatusCode::UNAUTHORIZED, &message, None),
            Error::Permission(message) => respond(StatusCode::FORBIDDEN, &message, None),
            Error::NotFound(message) => respond(StatusCode::NOT_FOUND, &message, None),
            Error::Conflict(message) => respond(StatusCode::CONFLICT, &message, None),

            Error::QueueFull {
                agent_name,
                queue_length,
                retry_after_secs,
            } => {
                let body = serde_json::json!({
                    "error": format!("agent '{agent_name}' queue is full"),
                    "queue_length": queue_length,
                });
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                if let Some(secs) = retry_after_secs {
                    if let Ok(value) = secs.to_string().parse() {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                response
            }

            Error::AgentBusy {
                agent_name,
                current_execution,
            } => {
                let body = serde_json::json!({
                    "error": format!("agent '{agent_name}' is currently executing"),
                    "current_execution": current_execution,
                });
                (StatusCode::CONFLICT, Json(body)).into_response()
            }

            Error::QueueTimeout { agent_name } => respond(
                StatusCode::TOO_MANY_REQUESTS,
                &format!("timed out waiting in queue for agent '{agent_name}'"),
                None,
            ),

            Error::QueueUnavailable(message) => {
                let reference = error_reference();
                tracing::error!(reference = %reference, error = %message, "queue backend unavailable");
                respond(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue backend unavailable",
                    Some(reference),
                )
            }

            Error::AgentNotReachable(message) => {
                respond(StatusCode::SERVICE_UNAVAILABLE, &message, None)
            }

            Error::Internal(message) => {
                let reference = error_reference();
                tracing::error!(reference = %reference, error = %message, "internal error");
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal error occurred",
                    Some(reference),
                )
            }
        }
    }
}

fn respond(status: StatusCode, message: &str, reference: Option<String>) -> Response {
    let body = match reference {
        Some(reference) => serde_json::json!({"error": message, "reference": reference}),
        None => serde_json::json!({"error": message}),
    };
    (status, Json(body)).into_response()
}
