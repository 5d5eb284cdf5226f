//! Mapping pipeline failures onto HTTP responses.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mentorlink_core::Error;
use mentorlink_pipeline::{OrchestrationError, Stage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Non-standard "client closed request" status.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub cause: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    stage: Option<Stage>,
    cause: String,
}

impl ApiError {
    pub fn bad_request(cause: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            stage: Some(Stage::Validation),
            cause: cause.into(),
        }
    }

    pub fn not_found(cause: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            stage: None,
            cause: cause.into(),
        }
    }

    /// Attribute an error raised outside the orchestrator to a stage.
    pub fn from_error(stage: Stage, error: Error) -> Self {
        OrchestrationError::new(stage, error).into()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::BudgetExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::RetrievalUnavailable(_) | Error::ModelTransport { .. } | Error::StreamInterrupted { .. } => {
            StatusCode::BAD_GATEWAY
        }
        Error::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Cancelled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::REQUEST_TIMEOUT),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(e: OrchestrationError) -> Self {
        let status = status_for(&e.source);
        if e.is_cancelled() {
            debug!(stage = %e.stage, "Request cancelled");
        } else if status.is_server_error() {
            warn!(stage = %e.stage, status = status.as_u16(), error = %e.source, "Request failed");
        }
        Self {
            status,
            stage: Some(e.stage),
            cause: e.source.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let mut error = Self::bad_request(rejection.body_text());
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            error.status = StatusCode::PAYLOAD_TOO_LARGE;
        }
        error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self
            .status
            .canonical_reason()
            .unwrap_or("Client Closed Request")
            .to_string();
        let body = ErrorResponse {
            error,
            stage: self.stage,
            cause: self.cause,
        };
        (self.status, Json(body)).into_response()
    }
}
