//! Uniform JSON error response for the control-plane API, matching
//! control-plane's own `AuthError`/`ErrorResponse` shape: a `{ error }` body
//! with the status code carried out-of-band.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use conduit_engine::{EngineError, StoreError};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(_) | StoreError::JobNotFound(_) | StoreError::WorkerNotFound(_) => {
                Self::not_found(err.to_string())
            }
            StoreError::WorkflowAlreadyExists(_) => Self::bad_request(err.to_string()),
            StoreError::Persistence(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkflowNotFound(_) => Self::not_found(err.to_string()),
            EngineError::NotPending(_) | EngineError::NotCancellable(_) | EngineError::Definition(_) => {
                Self::bad_request(err.to_string())
            }
            EngineError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_404() {
        let err: ApiError = StoreError::WorkflowNotFound("wf-1".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn engine_not_pending_maps_to_400() {
        let err: ApiError = EngineError::NotPending("wf-1".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
