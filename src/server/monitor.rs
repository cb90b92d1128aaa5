// src/server/monitor.rs
//! Background lifecycle monitor
//!
//! Checks storage health on a fixed interval and runs a cleanup when usage
//! reaches the cleanup threshold, and expires finished jobs. Abandoned
//! uploads are only reaped at startup, where nothing can still be writing
//! them. Failures are logged; the loop never exits.

use crate::lifecycle::StorageLifecycleManager;
use crate::server::SharedState;
use std::time::Duration;

/// One monitor pass; returns whether a cleanup ran
pub async fn monitor_tick(state: &SharedState) -> bool {
    let lifecycle = state.read().await.lifecycle.clone();

    let cleaned = match tokio::task::spawn_blocking(move || check_and_clean(&lifecycle)).await {
        Ok(cleaned) => cleaned,
        Err(e) => {
            tracing::error!("Monitor task panicked: {}", e);
            false
        }
    };

    let expired = state.write().await.job_manager.cleanup_expired();
    if expired > 0 {
        tracing::debug!("Expired {} finished jobs", expired);
    }
    cleaned
}

fn check_and_clean(lifecycle: &StorageLifecycleManager) -> bool {
    let report = match lifecycle.check_health() {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            return false;
        }
    };
    if !report.status.needs_cleanup() {
        return false;
    }

    tracing::info!(
        "Storage {} at {:.1}%, starting cleanup",
        report.status,
        report.usage_ratio * 100.0
    );
    match lifecycle.run_cleanup("monitor") {
        Ok(record) => {
            tracing::info!("Monitor cleanup freed {} bytes", record.bytes_freed);
            true
        }
        Err(e) => {
            tracing::error!("Monitor cleanup failed: {}", e);
            false
        }
    }
}

/// Run the monitor forever
pub async fn run_monitor_loop(state: SharedState, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        monitor_tick(&state).await;
    }
}
