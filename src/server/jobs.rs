// src/server/jobs.rs
//! Background job tracking
//!
//! Handles the 202 Accepted pattern for long operations:
//! - Create jobs for cleanup runs and patch generation
//! - Track job status (pending, running, completed, failed)
//! - Prevent stampede (same key = same job)
//! - Clean up finished jobs after TTL

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// What a job does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Cleanup,
    PatchGeneration,
}

/// Job status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for a worker slot
    Pending,
    Running,
    Completed,
    Failed(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Deduplication key
    pub key: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: Instant,
    /// When the job finished (for TTL cleanup)
    pub completed_at: Option<Instant>,
    /// JSON result (populated when completed)
    pub result: Option<serde_json::Value>,
}

/// Manages background jobs
pub struct JobManager {
    jobs: HashMap<JobId, Job>,
    /// Key of every unfinished job, for deduplication
    key_to_id: HashMap<String, JobId>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    job_ttl: Duration,
}

impl JobManager {
    pub fn new(max_concurrent: usize, job_ttl: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            jobs: HashMap::new(),
            key_to_id: HashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            job_ttl,
        }
    }

    /// Create a job, or return the unfinished job with the same key
    ///
    /// The flag is `true` when a new job was created. Fails when the queue
    /// is full.
    pub fn create_job(&mut self, key: String, kind: JobKind) -> Result<(JobId, bool), &'static str> {
        if let Some(&existing_id) = self.key_to_id.get(&key) {
            return Ok((existing_id, false));
        }

        // Allow 2x max_concurrent pending jobs
        let pending_count = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count();
        if pending_count >= self.max_concurrent * 2 {
            return Err("Job queue full");
        }

        let job_id = JobId::new();
        self.jobs.insert(
            job_id,
            Job {
                id: job_id,
                key: key.clone(),
                kind,
                status: JobStatus::Pending,
                created_at: Instant::now(),
                completed_at: None,
                result: None,
            },
        );
        self.key_to_id.insert(key, job_id);

        Ok((job_id, true))
    }

    pub fn get_job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn update_status(&mut self, id: &JobId, status: JobStatus) {
        if let Some(job) = self.jobs.get_mut(id) {
            if status.is_terminal() {
                job.completed_at = Some(Instant::now());
                // A finished job no longer absorbs new requests
                self.key_to_id.remove(&job.key);
            }
            job.status = status;
        }
    }

    pub fn complete_with_result(&mut self, id: &JobId, result: serde_json::Value) {
        self.update_status(id, JobStatus::Completed);
        if let Some(job) = self.jobs.get_mut(id) {
            job.result = Some(result);
        }
    }

    /// Drop finished jobs older than the TTL; returns how many were removed
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.job_ttl;
        let before = self.jobs.len();
        self.jobs.retain(|id, job| {
            let expired = job
                .completed_at
                .is_some_and(|t| now.duration_since(t) > ttl);
            if expired {
                tracing::debug!("Cleaned up expired job: {} ({})", id, job.key);
            }
            !expired
        });
        before - self.jobs.len()
    }

    /// Limits how many jobs run at once
    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats {
            total: self.jobs.len(),
            ..Default::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed(_) => stats.failed += 1,
            }
        }
        stats
    }
}

/// Job statistics
#[derive(Debug, Default, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}
