//! Mapping of hub errors onto HTTP responses

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use hub_router::HubError;

/// Standard API error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Handler error: wraps [`HubError`] and renders it with the matching status
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Status code and short error code for a hub error
pub fn classify(e: &HubError) -> (StatusCode, &'static str) {
    match e {
        HubError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        HubError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        HubError::QueueFull { .. } => (StatusCode::TOO_MANY_REQUESTS, "QUEUE_FULL"),
        HubError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"),
        HubError::UnavailableDestination { .. } => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE_DESTINATION"),
        HubError::TransactionState { .. } => (StatusCode::CONFLICT, "TRANSACTION_STATE"),
        HubError::TransactionTimeout { .. } => (StatusCode::CONFLICT, "TRANSACTION_TIMEOUT"),
        HubError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR"),
        HubError::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.0);
        if status.is_server_error() && !matches!(self.0, HubError::CircuitOpen { .. }) {
            error!(error = %self.0, "Request failed");
        }

        let retry_after = match &self.0 {
            HubError::CircuitOpen { retry_after, .. } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
