// src/server/routes.rs
//! Axum router configuration for the deltaship server
//!
//! Byte-serving routes (package downloads, version files, patches) skip the
//! compression layer: their payloads are binary and often already
//! compressed, and compression would break byte ranges.

use crate::server::SharedState;
use crate::server::handlers::{files, jobs, packages, storage, uploads, versions};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};

/// Create the main application router
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let body_limit = state
        .try_read()
        .map(|s| usize::try_from(s.config.max_upload_size).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);

    let byte_routes = Router::new()
        .route("/download/*location", get(files::download_package))
        .route("/files/download", get(files::download_file))
        .route("/files/patch", get(files::download_patch))
        .route(
            "/uploads/:name",
            put(uploads::put_chunk)
                .head(uploads::upload_status)
                .delete(uploads::discard_upload),
        )
        .with_state(state.clone());

    let api_routes = Router::new()
        .route("/health", get(health_check))
        // Registry
        .route(
            "/packages",
            get(packages::list_packages).post(packages::upload_package),
        )
        .route("/packages/:id", get(packages::get_package))
        .route("/packages/:id/rollback", post(packages::rollback_package))
        // Versions and update planning
        .route("/versions", get(versions::list_versions))
        .route("/versions/check", get(versions::check_update))
        .route("/versions/manifest", get(versions::version_manifest))
        .route("/versions/diff", post(versions::diff_versions))
        .route("/versions/protect", post(versions::protect_version))
        // Storage lifecycle
        .route("/storage/health", get(storage::storage_health))
        .route(
            "/storage/cleanup",
            get(storage::cleanup_history).post(storage::start_cleanup),
        )
        .route("/storage/cleanup/:id", get(storage::get_cleanup))
        .route("/storage/snapshots", get(storage::list_snapshots))
        .route(
            "/storage/retention",
            get(storage::get_retention).post(storage::configure_retention),
        )
        // Background jobs (202 Accepted polling)
        .route("/jobs", get(jobs::job_stats))
        .route("/jobs/:id", get(jobs::get_job))
        .layer(CompressionLayer::new())
        .with_state(state);

    Router::new()
        .merge(byte_routes)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
