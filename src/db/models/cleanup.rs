// src/db/models/cleanup.rs

//! CleanupRecord model - audit trail of lifecycle cleanup runs

use crate::db::now;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::str::FromStr;

use super::parse_column;

/// Status of a cleanup run; `Completed` and `Failed` are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStatus {
    Running,
    Completed,
    Failed,
}

impl CleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStatus::Running => "running",
            CleanupStatus::Completed => "completed",
            CleanupStatus::Failed => "failed",
        }
    }
}

impl FromStr for CleanupStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(CleanupStatus::Running),
            "completed" => Ok(CleanupStatus::Completed),
            "failed" => Ok(CleanupStatus::Failed),
            _ => Err(format!("Invalid cleanup status: {s}")),
        }
    }
}

/// Which cleanup step removed an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStep {
    Temp,
    Hotfix,
    Patch,
    Full,
}

impl CleanupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStep::Temp => "temp",
            CleanupStep::Hotfix => "hotfix",
            CleanupStep::Patch => "patch",
            CleanupStep::Full => "full",
        }
    }
}

impl FromStr for CleanupStep {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "temp" => Ok(CleanupStep::Temp),
            "hotfix" => Ok(CleanupStep::Hotfix),
            "patch" => Ok(CleanupStep::Patch),
            "full" => Ok(CleanupStep::Full),
            _ => Err(format!("Invalid cleanup step: {s}")),
        }
    }
}

/// One removed (or attempted) item of a cleanup run
#[derive(Debug, Clone, Serialize)]
pub struct CleanupItem {
    pub id: Option<i64>,
    pub step: CleanupStep,
    pub package_id: Option<i64>,
    /// Path relative to the storage root
    pub path: String,
    pub bytes: i64,
    pub backup_path: Option<String>,
    /// Set when this item could not be removed
    pub error: Option<String>,
}

impl CleanupItem {
    pub fn new(step: CleanupStep, package_id: Option<i64>, path: String, bytes: i64) -> Self {
        Self {
            id: None,
            step,
            package_id,
            path,
            bytes,
            backup_path: None,
            error: None,
        }
    }

    /// Attach this item to a cleanup run
    pub fn insert(&mut self, conn: &Connection, cleanup_id: i64) -> Result<i64> {
        conn.execute(
            "INSERT INTO cleanup_items (cleanup_id, step, package_id, path, bytes, backup_path, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                cleanup_id,
                self.step.as_str(),
                self.package_id,
                &self.path,
                self.bytes,
                &self.backup_path,
                &self.error,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// All items of one cleanup run
    pub fn find_by_cleanup(conn: &Connection, cleanup_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, step, package_id, path, bytes, backup_path, error
             FROM cleanup_items WHERE cleanup_id = ?1 ORDER BY id",
        )?;
        let items = stmt
            .query_map([cleanup_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Most recent successful backup recorded for a package
    pub fn latest_backup_for(conn: &Connection, package_id: i64) -> Result<Option<String>> {
        let path = conn
            .query_row(
                "SELECT backup_path FROM cleanup_items
                 WHERE package_id = ?1 AND backup_path IS NOT NULL AND error IS NULL
                 ORDER BY id DESC LIMIT 1",
                [package_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            step: parse_column(row, 1)?,
            package_id: row.get(2)?,
            path: row.get(3)?,
            bytes: row.get(4)?,
            backup_path: row.get(5)?,
            error: row.get(6)?,
        })
    }
}

/// Audit of one lifecycle-manager run
#[derive(Debug, Clone, Serialize)]
pub struct CleanupRecord {
    pub id: Option<i64>,
    pub trigger_reason: String,
    pub status: CleanupStatus,
    pub usage_before: f64,
    pub usage_after: Option<f64>,
    pub bytes_freed: i64,
    /// Set when the run aborted
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub items: Vec<CleanupItem>,
}

impl CleanupRecord {
    /// Insert a new `running` record
    pub fn start(conn: &Connection, trigger_reason: &str, usage_before: f64) -> Result<Self> {
        let started_at = now();
        conn.execute(
            "INSERT INTO cleanup_records (trigger_reason, status, usage_before, started_at)
             VALUES (?1, 'running', ?2, ?3)",
            params![trigger_reason, usage_before, &started_at],
        )?;

        Ok(Self {
            id: Some(conn.last_insert_rowid()),
            trigger_reason: trigger_reason.to_string(),
            status: CleanupStatus::Running,
            usage_before,
            usage_after: None,
            bytes_freed: 0,
            error: None,
            started_at,
            finished_at: None,
            items: Vec::new(),
        })
    }

    /// Move a running record to its final state
    pub fn finish(
        &mut self,
        conn: &Connection,
        status: CleanupStatus,
        usage_after: f64,
        bytes_freed: i64,
        error: Option<String>,
    ) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::Internal("Cleanup record has no ID".to_string()))?;
        if self.status != CleanupStatus::Running {
            return Err(Error::Internal(format!(
                "Cleanup record {} is already {}",
                id,
                self.status.as_str()
            )));
        }

        let finished_at = now();
        let updated = conn.execute(
            "UPDATE cleanup_records
             SET status = ?1, usage_after = ?2, bytes_freed = ?3, error = ?4, finished_at = ?5
             WHERE id = ?6 AND status = 'running'",
            params![status.as_str(), usage_after, bytes_freed, &error, &finished_at, id],
        )?;
        if updated == 0 {
            return Err(Error::Internal(format!(
                "Cleanup record {} was closed while the run was still active",
                id
            )));
        }

        self.status = status;
        self.usage_after = Some(usage_after);
        self.bytes_freed = bytes_freed;
        self.error = error;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Find a record with its items
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let record = conn
            .query_row(
                "SELECT id, trigger_reason, status, usage_before, usage_after, bytes_freed, error,
                        started_at, finished_at
                 FROM cleanup_records WHERE id = ?1",
                [id],
                Self::from_row,
            )
            .optional()?;

        match record {
            Some(mut record) => {
                record.items = CleanupItem::find_by_cleanup(conn, id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Most recent records (without items), newest first
    pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, trigger_reason, status, usage_before, usage_after, bytes_freed, error,
                    started_at, finished_at
             FROM cleanup_records ORDER BY id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Mark runs left `running` by a crashed process as failed
    ///
    /// Only safe while holding the cleanup lock; a live run's record is
    /// otherwise indistinguishable from an orphaned one.
    pub fn fail_interrupted(conn: &Connection) -> Result<usize> {
        let n = conn.execute(
            "UPDATE cleanup_records SET status = 'failed', error = 'interrupted', finished_at = ?1
             WHERE status = 'running'",
            [now()],
        )?;
        Ok(n)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            trigger_reason: row.get(1)?,
            status: parse_column(row, 2)?,
            usage_before: row.get(3)?,
            usage_after: row.get(4)?,
            bytes_freed: row.get(5)?,
            error: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            items: Vec::new(),
        })
    }
}
