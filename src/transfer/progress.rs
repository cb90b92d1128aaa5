// src/transfer/progress.rs

//! Transfer state, progress snapshots and throughput tracking

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// State of a whole transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Downloading,
    Uploading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Downloading => "downloading",
            TransferState::Uploading => "uploading",
            TransferState::Paused => "paused",
            TransferState::Completed => "completed",
            TransferState::Cancelled => "cancelled",
            TransferState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one file within a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum FileState {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed(String),
}

impl FileState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Completed | FileState::Skipped | FileState::Failed(_)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileProgress {
    pub path: String,
    /// Expected bytes; 0 when unknown (patch payloads)
    pub size: u64,
    pub transferred: u64,
    pub state: FileState,
}

/// Consistent snapshot of a transfer, published on every change
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub id: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub eta_seconds: Option<f64>,
    pub files_total: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub current_file: Option<String>,
    pub files: Vec<FileProgress>,
    pub error: Option<String>,
}

impl TransferProgress {
    pub fn new(id: String, direction: TransferDirection, files: Vec<FileProgress>) -> Self {
        let total_bytes = files.iter().map(|f| f.size).sum();
        Self {
            id,
            direction,
            state: TransferState::Pending,
            bytes_transferred: 0,
            total_bytes,
            bytes_per_second: 0.0,
            eta_seconds: None,
            files_total: files.len(),
            files_completed: 0,
            files_failed: 0,
            files_skipped: 0,
            current_file: None,
            files,
            error: None,
        }
    }

    /// Move file `index` to `state`, keeping the counters in step
    pub fn set_file_state(&mut self, index: usize, state: FileState) {
        let Some(file) = self.files.get_mut(index) else {
            return;
        };
        match &file.state {
            FileState::Completed => self.files_completed -= 1,
            FileState::Skipped => self.files_skipped -= 1,
            FileState::Failed(_) => self.files_failed -= 1,
            FileState::Pending | FileState::InProgress => {}
        }
        match &state {
            FileState::Completed => self.files_completed += 1,
            FileState::Skipped => self.files_skipped += 1,
            FileState::Failed(_) => self.files_failed += 1,
            FileState::Pending | FileState::InProgress => {}
        }
        file.state = state;
    }

    /// Whether every file has reached a terminal state
    pub fn all_files_terminal(&self) -> bool {
        self.files.iter().all(|f| f.state.is_terminal())
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == TransferState::Completed { 100.0 } else { 0.0 };
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

/// Throughput over the last N chunk samples
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
    window: usize,
}

impl SpeedTracker {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.max(2)),
            window: window.max(2),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((at, bytes));
    }

    /// Bytes per second across the window; 0 until two samples exist
    pub fn bytes_per_second(&self) -> f64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.duration_since(*first);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample only marks the start of the window
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> FileProgress {
        FileProgress {
            path: path.to_string(),
            size,
            transferred: 0,
            state: FileState::Pending,
        }
    }

    #[test]
    fn test_counters_follow_state_changes() {
        let mut p = TransferProgress::new(
            "t".into(),
            TransferDirection::Download,
            vec![file("a", 10), file("b", 20)],
        );
        assert_eq!(p.total_bytes, 30);

        p.set_file_state(0, FileState::Failed("bad".into()));
        assert_eq!(p.files_failed, 1);
        p.set_file_state(0, FileState::Completed);
        assert_eq!(p.files_failed, 0);
        assert_eq!(p.files_completed, 1);
        assert!(!p.all_files_terminal());

        p.set_file_state(1, FileState::Skipped);
        assert!(p.all_files_terminal());
    }

    #[test]
    fn test_speed_window() {
        let mut tracker = SpeedTracker::new(3);
        let start = Instant::now();
        tracker.record_at(start, 100);
        assert_eq!(tracker.bytes_per_second(), 0.0);

        tracker.record_at(start + Duration::from_secs(1), 1000);
        tracker.record_at(start + Duration::from_secs(2), 1000);
        assert!((tracker.bytes_per_second() - 1000.0).abs() < 1e-6);

        // Oldest sample falls out of the window
        tracker.record_at(start + Duration::from_secs(3), 4000);
        assert!((tracker.bytes_per_second() - 2500.0).abs() < 1e-6);
        assert_eq!(tracker.eta(5000), Some(Duration::from_secs(2)));
    }
}
