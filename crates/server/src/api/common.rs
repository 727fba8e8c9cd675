// Common DTOs and error mapping for the HTTP API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use vigil_core::{LifecycleError, OccurrenceStatus, StoreError};

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Legal targets from the current status, for transition errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<OccurrenceStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            allowed: None,
            hint: None,
        }
    }

    pub fn with_allowed(mut self, allowed: Vec<OccurrenceStatus>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

/// Handler error carrying its HTTP status
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, body: ErrorResponse) -> Self {
        Self { status, body }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorResponse::new(message))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorResponse::new(message))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.body.into_response(self.status).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OccurrenceNotFound(id) => Self::not_found(format!("occurrence not found: {id}")),
            other => {
                tracing::error!(error = %other, "Store error");
                let status = if other.is_transient() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                Self::new(status, ErrorResponse::new("Internal storage error"))
            }
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        let message = e.to_string();
        match e {
            LifecycleError::NotFound(_) => Self::not_found(message),
            LifecycleError::InvalidTransition { from, allowed, .. } => {
                let status = if from.is_terminal() {
                    StatusCode::CONFLICT
                } else {
                    StatusCode::BAD_REQUEST
                };
                Self::new(status, ErrorResponse::new(message).with_allowed(allowed))
            }
            LifecycleError::OutcomeRequired(_) => Self::new(
                StatusCode::CONFLICT,
                ErrorResponse::new(message).with_hint("Register an outcome before concluding"),
            ),
            LifecycleError::OutcomeAlreadyRegistered(_) => {
                Self::new(StatusCode::CONFLICT, ErrorResponse::new(message))
            }
            LifecycleError::OutcomeNotAllowed { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(message)
                    .with_hint("Outcomes can only be registered while ACCEPTED or REFUSED"),
            ),
            LifecycleError::Conflict(_) => Self::new(
                StatusCode::CONFLICT,
                ErrorResponse::new(message).with_hint("Reload the occurrence and retry"),
            ),
            LifecycleError::Store(e) => e.into(),
        }
    }
}
