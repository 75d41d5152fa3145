use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::models::job::ErrorKind;
use crate::services::job_store::JobStoreError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;
use crate::services::submitter::SubmitError;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    message: String,
}

/// Error returned by every JSON handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("Job store unavailable: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("Queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Object storage unavailable: {0}")]
    Storage(#[from] StorageError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<ErrorKind>) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", Some(ErrorKind::InvalidInput)),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            Self::Submit(e) => {
                let status = match e {
                    SubmitError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    SubmitError::StorageUnavailable(_) | SubmitError::JobStoreUnavailable(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    SubmitError::EnqueueFailed { .. } => StatusCode::BAD_GATEWAY,
                };
                (status, "submission_failed", Some(e.kind()))
            }
            Self::JobStore(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                Some(ErrorKind::JobStoreUnavailable),
            ),
            Self::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None),
            Self::Storage(e) if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found", None),
            Self::Storage(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                Some(ErrorKind::StorageUnavailable),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, kind) = self.parts();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = ErrorBody {
            error,
            kind,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
