// src/server/handlers/storage.rs
//! Storage lifecycle handlers: health, cleanup, retention

use super::{ApiResult, blocking, spawn_job};
use crate::db::models::{CleanupRecord, PackageKind, StorageSnapshot};
use crate::lifecycle::{HealthReport, RetentionPolicy};
use crate::server::SharedState;
use crate::server::auth::authorize;
use crate::server::jobs::JobKind;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;

/// GET /storage/health
pub async fn storage_health(State(state): State<SharedState>) -> ApiResult<Json<HealthReport>> {
    let lifecycle = state.read().await.lifecycle.clone();
    Ok(Json(blocking(move || lifecycle.check_health()).await?))
}

/// POST /storage/cleanup
///
/// Runs asynchronously; concurrent requests share one job.
pub async fn start_cleanup(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let lifecycle = {
        let guard = state.read().await;
        authorize(&headers, guard.config.api_key.as_deref())?;
        guard.lifecycle.clone()
    };
    Ok(spawn_job(&state, "cleanup".to_string(), JobKind::Cleanup, move || {
        lifecycle.run_cleanup("manual")
    })
    .await)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /storage/cleanup
pub async fn cleanup_history(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<CleanupRecord>>> {
    let lifecycle = state.read().await.lifecycle.clone();
    let limit = query.limit.unwrap_or(20);
    Ok(Json(blocking(move || lifecycle.cleanup_history(limit)).await?))
}

/// GET /storage/cleanup/:id
pub async fn get_cleanup(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<CleanupRecord>> {
    let lifecycle = state.read().await.lifecycle.clone();
    Ok(Json(blocking(move || lifecycle.get_cleanup(id)).await?))
}

/// GET /storage/snapshots
pub async fn list_snapshots(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<StorageSnapshot>>> {
    let lifecycle = state.read().await.lifecycle.clone();
    let limit = query.limit.unwrap_or(50);
    Ok(Json(blocking(move || lifecycle.snapshots(limit)).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRequest {
    pub kind: String,
    pub max_versions: u32,
}

/// GET /storage/retention
pub async fn get_retention(State(state): State<SharedState>) -> ApiResult<Json<RetentionPolicy>> {
    let lifecycle = state.read().await.lifecycle.clone();
    Ok(Json(blocking(move || lifecycle.retention_policy()).await?))
}

/// POST /storage/retention
pub async fn configure_retention(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<RetentionRequest>,
) -> ApiResult<Json<RetentionPolicy>> {
    let lifecycle = {
        let guard = state.read().await;
        authorize(&headers, guard.config.api_key.as_deref())?;
        guard.lifecycle.clone()
    };
    let kind = PackageKind::parse(&request.kind)?;
    let policy = blocking(move || lifecycle.configure_retention(kind, request.max_versions)).await?;
    tracing::info!("Retention for {} set to {}", kind, request.max_versions);
    Ok(Json(policy))
}
