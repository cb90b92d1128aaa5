// src/progress.rs

//! Rendering of transfer progress
//!
//! Transfers publish [`TransferProgress`] snapshots; a [`ProgressSink`]
//! turns them into output. Implementations:
//! - `BarProgress`: indicatif bar with bytes, speed and the current file
//! - `LogProgress`: tracing lines roughly every tenth of the transfer
//! - `SilentProgress`: no-op for scripted/quiet modes

use crate::error::{Error, Result};
use crate::transfer::{TransferHandle, TransferProgress, TransferState};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Receives every published snapshot of one transfer
pub trait ProgressSink: Send + Sync {
    fn update(&self, progress: &TransferProgress);

    /// Called once with the terminal snapshot
    fn finish(&self, progress: &TransferProgress);
}

#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn update(&self, _progress: &TransferProgress) {}

    fn finish(&self, _progress: &TransferProgress) {}
}

/// Logs progress at info level, about ten times per transfer
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    /// Last decile logged
    last_step: Mutex<u64>,
}

impl LogProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_step: Mutex::new(0),
        }
    }
}

impl ProgressSink for LogProgress {
    fn update(&self, progress: &TransferProgress) {
        let step = (progress.percent() / 10.0) as u64;
        let mut last = self.last_step.lock();
        if step > *last {
            *last = step;
            info!(
                "{}: {:.0}% ({}/{} bytes, {}/{} files)",
                self.name,
                progress.percent(),
                progress.bytes_transferred,
                progress.total_bytes,
                progress.files_completed + progress.files_skipped,
                progress.files_total
            );
        }
    }

    fn finish(&self, progress: &TransferProgress) {
        match progress.state {
            TransferState::Completed if progress.files_failed == 0 => {
                info!("{}: {}", self.name, summary(progress))
            }
            _ => warn!("{}: {}", self.name, summary(progress)),
        }
    }
}

/// Terminal progress bar
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn update(&self, progress: &TransferProgress) {
        self.bar.set_length(progress.total_bytes);
        self.bar.set_position(progress.bytes_transferred);
        let message = match (&progress.state, &progress.current_file) {
            (TransferState::Paused, _) => "paused".to_string(),
            (_, Some(file)) => file.clone(),
            _ => progress.state.to_string(),
        };
        self.bar.set_message(message);
    }

    fn finish(&self, progress: &TransferProgress) {
        self.bar.set_position(progress.bytes_transferred);
        if progress.state == TransferState::Completed && progress.files_failed == 0 {
            self.bar.finish_with_message(summary(progress));
        } else {
            self.bar.abandon_with_message(summary(progress));
        }
    }
}

/// One-line outcome of a transfer
pub fn summary(progress: &TransferProgress) -> String {
    format!(
        "{}: {} completed, {} skipped, {} failed of {} files",
        progress.state,
        progress.files_completed,
        progress.files_skipped,
        progress.files_failed,
        progress.files_total
    )
}

/// Feed a transfer's snapshots to `sink` until it finishes
pub async fn follow(handle: &TransferHandle, sink: &dyn ProgressSink) -> Result<TransferProgress> {
    let mut rx = handle.subscribe();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.state.is_terminal() {
            break;
        }
        sink.update(&snapshot);
        if rx.changed().await.is_err() {
            break;
        }
    }
    let done = handle.wait().await?;
    if !done.state.is_terminal() {
        return Err(Error::Internal(format!(
            "Transfer {} stopped in state {}",
            done.id, done.state
        )));
    }
    sink.finish(&done);
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{FileProgress, FileState, TransferDirection};

    fn progress(transferred: u64) -> TransferProgress {
        let mut p = TransferProgress::new(
            "t".into(),
            TransferDirection::Download,
            vec![FileProgress {
                path: "a".into(),
                size: 100,
                transferred: 0,
                state: FileState::Pending,
            }],
        );
        p.bytes_transferred = transferred;
        p
    }

    #[test]
    fn test_log_progress_steps() {
        let sink = LogProgress::new("download");
        sink.update(&progress(5));
        assert_eq!(*sink.last_step.lock(), 0);
        sink.update(&progress(35));
        assert_eq!(*sink.last_step.lock(), 3);
        sink.update(&progress(20));
        assert_eq!(*sink.last_step.lock(), 3);
    }

    #[test]
    fn test_summary() {
        let mut p = progress(100);
        p.set_file_state(0, FileState::Failed("bad hash".into()));
        p.state = TransferState::Completed;
        assert_eq!(summary(&p), "completed: 0 completed, 0 skipped, 1 failed of 1 files");
    }
}
