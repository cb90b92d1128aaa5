// src/server/handlers/versions.rs
//! Version, manifest and update-planning handlers

use super::{ApiResult, blocking};
use crate::db::models::Version;
use crate::error::Error;
use crate::registry::{UpdateCheck, VersionKey};
use crate::server::SharedState;
use crate::server::auth::authorize;
use crate::update::{self, Manifest, ManifestDiff, UpdatePlan};
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// GET /versions
pub async fn list_versions(State(state): State<SharedState>) -> ApiResult<Json<Vec<Version>>> {
    let registry = state.read().await.registry.clone();
    Ok(Json(blocking(move || registry.list_versions()).await?))
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub current: String,
    pub platform: String,
    #[serde(alias = "architecture")]
    pub arch: String,
}

/// GET /versions/check?current=&platform=&arch=
pub async fn check_update(
    State(state): State<SharedState>,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<UpdateCheck>> {
    let registry = state.read().await.registry.clone();
    let check = blocking(move || registry.check_update(&query.current, &query.platform, &query.arch)).await?;
    Ok(Json(check))
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: String,
    pub platform: String,
    #[serde(alias = "architecture")]
    pub arch: String,
}

impl VersionQuery {
    fn key(&self) -> VersionKey {
        VersionKey::new(&self.version, &self.platform, &self.arch)
    }
}

/// GET /versions/manifest?version=&platform=&arch=
pub async fn version_manifest(
    State(state): State<SharedState>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Json<Manifest>> {
    let registry = state.read().await.registry.clone();
    let manifest = blocking(move || registry.version_manifest(&query.key())).await?;
    Ok(Json(manifest))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    pub platform: String,
    #[serde(alias = "architecture")]
    pub arch: String,
    /// Target version; the latest available when omitted
    pub version: Option<String>,
    /// Version the caller's files belong to, enables cached patch sizes
    pub from_version: Option<String>,
    /// The caller's local files
    pub manifest: Manifest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    pub version: String,
    pub diff: ManifestDiff,
    pub plan: UpdatePlan,
}

/// POST /versions/diff
///
/// Compares the caller's manifest against a version on the server and plans
/// the update.
pub async fn diff_versions(
    State(state): State<SharedState>,
    Json(request): Json<DiffRequest>,
) -> ApiResult<Json<DiffResponse>> {
    let (registry, planner) = {
        let guard = state.read().await;
        (guard.registry.clone(), guard.planner.clone())
    };

    let response = blocking(move || {
        let version = match request.version {
            Some(v) => v,
            None => registry
                .check_update(
                    request.from_version.as_deref().unwrap_or_default(),
                    &request.platform,
                    &request.arch,
                )?
                .latest_version
                .ok_or_else(|| {
                    Error::NotFoundError(format!(
                        "no versions for {}/{}",
                        request.platform, request.arch
                    ))
                })?,
        };
        let key = VersionKey::new(&version, &request.platform, &request.arch);
        let remote = registry.version_manifest(&key)?;
        let diff = update::diff(&request.manifest, &remote);

        // Real sizes of patches that are already cached
        let mut known = HashMap::new();
        if let Some(from) = request.from_version.as_deref() {
            for entry in &diff.modified {
                if let Ok(Some(patch)) =
                    registry.cached_file_patch(&request.platform, &request.arch, from, &version, &entry.path)
                {
                    known.insert(entry.path.clone(), patch.size);
                }
            }
        }

        let plan = planner.plan_with_patch_sizes(&request.manifest, &remote, &known);
        Ok(DiffResponse { version, diff, plan })
    })
    .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ProtectRequest {
    pub version: String,
    pub platform: String,
    #[serde(alias = "architecture")]
    pub arch: String,
    pub protected: bool,
}

/// POST /versions/protect
pub async fn protect_version(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<ProtectRequest>,
) -> ApiResult<StatusCode> {
    let registry = {
        let guard = state.read().await;
        authorize(&headers, guard.config.api_key.as_deref())?;
        guard.registry.clone()
    };
    let key = VersionKey::new(&request.version, &request.platform, &request.arch);
    blocking(move || registry.set_version_protected(&key, request.protected)).await?;
    Ok(StatusCode::NO_CONTENT)
}
