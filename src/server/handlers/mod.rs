// src/server/handlers/mod.rs
//! HTTP request handlers for the deltaship server

pub mod files;
pub mod jobs;
pub mod packages;
pub mod storage;
pub mod uploads;
pub mod versions;

use crate::error::{Error, ErrorClass};
use crate::server::jobs::{JobId, JobKind, JobStatus};
use crate::server::SharedState;
use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Header carrying the staged size of a resumable upload
pub const UPLOAD_OFFSET_HEADER: &str = "X-Upload-Offset";
/// Header carrying the SHA-256 of the served or staged content
pub const CONTENT_HASH_HEADER: &str = "X-Content-Hash";

/// Library error rendered as `{ "error": class, "message": text }`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self(Error::from(e))
    }
}

pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Authorization => StatusCode::UNAUTHORIZED,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Capacity => StatusCode::INSUFFICIENT_STORAGE,
        ErrorClass::TransientIo | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.0.class();
        let status = status_for(class);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        }

        let mut response = (
            status,
            Json(ErrorBody {
                error: class.as_str(),
                message: self.0.to_string(),
            }),
        )
            .into_response();

        // Let resumable uploaders resynchronise
        if let Error::OffsetMismatch { staged, .. } = &self.0
            && let Ok(value) = HeaderValue::from_str(&staged.to_string())
        {
            response.headers_mut().insert(UPLOAD_OFFSET_HEADER, value);
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run blocking registry/filesystem work off the async executor
pub async fn blocking<T, F>(f: F) -> crate::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> crate::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("Worker task failed: {e}")))?
}

/// Body of a 202 Accepted response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub status: &'static str,
    pub job_id: String,
    pub poll_url: String,
}

impl JobAccepted {
    pub fn new(id: JobId) -> Self {
        Self {
            status: "accepted",
            job_id: id.to_string(),
            poll_url: format!("/jobs/{}", id),
        }
    }
}

/// Queue blocking work as a background job and answer 202 Accepted
///
/// Requests with the same key share one unfinished job.
pub async fn spawn_job<T, F>(state: &SharedState, key: String, kind: JobKind, work: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> crate::Result<T> + Send + 'static,
{
    let (job_id, created, semaphore) = {
        let mut guard = state.write().await;
        match guard.job_manager.create_job(key.clone(), kind) {
            Ok((id, created)) => (id, created, guard.job_manager.semaphore()),
            Err(msg) => {
                return (StatusCode::SERVICE_UNAVAILABLE, msg).into_response();
            }
        }
    };

    if created {
        let state = state.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    let mut guard = state.write().await;
                    guard
                        .job_manager
                        .update_status(&job_id, JobStatus::Failed(e.to_string()));
                    return;
                }
            };
            state
                .write()
                .await
                .job_manager
                .update_status(&job_id, JobStatus::Running);
            tracing::info!("Job {} ({}) started", job_id, key);

            let outcome = blocking(work).await.and_then(|value| {
                serde_json::to_value(value)
                    .map_err(|e| Error::Internal(format!("Failed to encode job result: {e}")))
            });

            let mut guard = state.write().await;
            match outcome {
                Ok(value) => {
                    tracing::info!("Job {} ({}) completed", job_id, key);
                    guard.job_manager.complete_with_result(&job_id, value);
                }
                Err(e) => {
                    tracing::warn!("Job {} ({}) failed: {}", job_id, key, e);
                    guard
                        .job_manager
                        .update_status(&job_id, JobStatus::Failed(e.to_string()));
                }
            }
        });
    }

    (StatusCode::ACCEPTED, Json(JobAccepted::new(job_id))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_render_as_server_errors() {
        let err: ApiError = std::io::Error::other("disk gone").into();
        assert!(matches!(err.0, Error::Io(_)));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_offset_mismatch_carries_staged_size() {
        let response = ApiError(Error::OffsetMismatch {
            staged: 42,
            requested: 10,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[UPLOAD_OFFSET_HEADER], "42");
    }
}
