// src/server/mod.rs
//! Deltaship HTTP server
//!
//! This module provides an HTTP server that:
//! - Accepts package uploads (multipart or resumable staged chunks)
//! - Answers update checks, manifests and diff/plan requests
//! - Serves packages and individual version files with byte-range resume
//! - Generates and caches per-file patches in the background
//! - Exposes storage health, cleanup, retention and rollback to operators
//! - Runs a lifecycle monitor that cleans up when usage crosses thresholds

mod auth;
mod handlers;
mod jobs;
mod monitor;
mod routes;

pub use jobs::{Job, JobId, JobKind, JobManager, JobStats, JobStatus};
pub use monitor::run_monitor_loop;
pub use routes::create_router;

use crate::config::EngineConfig;
use crate::lifecycle::StorageLifecycleManager;
use crate::registry::Registry;
use crate::update::UpdatePlanner;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Shared secret for privileged requests; `None` disables the check
    pub api_key: Option<String>,
    /// Largest accepted request body
    pub max_upload_size: u64,
    /// Interval of the lifecycle monitor
    pub monitor_interval: Duration,
    /// Maximum concurrent background jobs
    pub max_concurrent_jobs: usize,
    /// How long finished jobs stay queryable
    pub job_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_key: None,
            max_upload_size: 4 * 1024 * 1024 * 1024, // 4GB
            monitor_interval: Duration::from_secs(600),
            max_concurrent_jobs: 2,
            job_ttl: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    /// Server settings from an engine configuration
    pub fn from_engine(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            bind_addr: config
                .server
                .bind
                .parse()
                .with_context(|| format!("Invalid server.bind address: {}", config.server.bind))?,
            api_key: config.server.api_key.clone(),
            max_upload_size: config.max_upload_size()?,
            monitor_interval: config.monitor_interval()?,
            ..Self::default()
        })
    }
}

/// Shared server state
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Registry,
    pub lifecycle: StorageLifecycleManager,
    pub planner: Arc<UpdatePlanner>,
    pub job_manager: JobManager,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        lifecycle: StorageLifecycleManager,
        planner: UpdatePlanner,
    ) -> Self {
        let job_manager = JobManager::new(config.max_concurrent_jobs, config.job_ttl);
        Self {
            registry: lifecycle.registry().clone(),
            lifecycle,
            planner: Arc::new(planner),
            job_manager,
            config,
        }
    }
}

pub type SharedState = Arc<RwLock<ServerState>>;

/// Start the server
pub async fn run_server(
    config: ServerConfig,
    lifecycle: StorageLifecycleManager,
    planner: UpdatePlanner,
) -> Result<()> {
    tracing::info!("Starting deltaship server on {}", config.bind_addr);
    tracing::info!("Storage root: {}", lifecycle.registry().layout().root().display());
    if config.api_key.is_none() {
        tracing::warn!("No API key configured, privileged endpoints are unauthenticated");
    }

    // Repair uploads and cleanup runs interrupted by a previous crash
    let recovering = lifecycle.clone();
    let (abandoned, interrupted) = tokio::task::spawn_blocking(move || {
        let registry = recovering.registry();
        let abandoned = registry.reconcile(registry.config().upload_timeout)?;
        let interrupted = recovering.recover_interrupted()?;
        Ok::<_, crate::Error>((abandoned, interrupted))
    })
    .await
    .context("Reconciliation task panicked")??;
    if !abandoned.is_empty() || interrupted > 0 {
        tracing::info!(
            "Reconciled {} abandoned uploads and {} interrupted cleanups",
            abandoned.len(),
            interrupted
        );
    }

    let interval = config.monitor_interval;
    let bind_addr = config.bind_addr;
    let state: SharedState = Arc::new(RwLock::new(ServerState::new(config, lifecycle, planner)));
    let app = create_router(state.clone());

    let monitor_state = state.clone();
    tokio::spawn(async move {
        run_monitor_loop(monitor_state, interval).await;
    });

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Deltaship is ready to serve");

    axum::serve(listener, app).await?;
    Ok(())
}
