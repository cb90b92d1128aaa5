// src/server/handlers/jobs.rs
//! Job status polling

use super::ApiResult;
use crate::error::Error;
use crate::server::SharedState;
use crate::server::jobs::{JobId, JobKind, JobStats};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub kind: JobKind,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub age_secs: u64,
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job_id: JobId = id
        .parse()
        .map_err(|_| Error::InvalidInput(format!("Invalid job id: {}", id)))?;

    let guard = state.read().await;
    let job = guard
        .job_manager
        .get_job(&job_id)
        .ok_or_else(|| Error::NotFoundError(format!("job {}", id)))?;

    let error = match &job.status {
        crate::server::jobs::JobStatus::Failed(msg) => Some(msg.clone()),
        _ => None,
    };
    Ok(Json(JobView {
        id: job.id.to_string(),
        kind: job.kind,
        status: job.status.as_str(),
        error,
        result: job.result.clone(),
        age_secs: job.created_at.elapsed().as_secs(),
    }))
}

/// GET /jobs
pub async fn job_stats(State(state): State<SharedState>) -> Json<JobStats> {
    Json(state.read().await.job_manager.stats())
}
