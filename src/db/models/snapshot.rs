// src/db/models/snapshot.rs

//! StorageSnapshot model - append-only usage history

use crate::db::now;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

const COLUMNS: &str = "id, total_bytes, used_bytes, available_bytes, full_bytes, patch_bytes,
                       hotfix_bytes, usage_ratio, reason, created_at";

#[derive(Debug, Clone, Serialize)]
pub struct StorageSnapshot {
    pub id: Option<i64>,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub full_bytes: i64,
    pub patch_bytes: i64,
    pub hotfix_bytes: i64,
    pub usage_ratio: f64,
    /// What caused the snapshot ("upload", "cleanup", ...)
    pub reason: String,
    pub created_at: Option<String>,
}

impl StorageSnapshot {
    pub fn new(total_bytes: u64, used_bytes: u64, reason: &str) -> Self {
        let usage_ratio = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64
        };
        Self {
            id: None,
            total_bytes: total_bytes as i64,
            used_bytes: used_bytes as i64,
            available_bytes: total_bytes.saturating_sub(used_bytes) as i64,
            full_bytes: 0,
            patch_bytes: 0,
            hotfix_bytes: 0,
            usage_ratio,
            reason: reason.to_string(),
            created_at: None,
        }
    }

    /// Insert this snapshot into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let ts = now();
        conn.execute(
            "INSERT INTO storage_snapshots (total_bytes, used_bytes, available_bytes, full_bytes,
                                            patch_bytes, hotfix_bytes, usage_ratio, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.total_bytes,
                self.used_bytes,
                self.available_bytes,
                self.full_bytes,
                self.patch_bytes,
                self.hotfix_bytes,
                self.usage_ratio,
                &self.reason,
                &ts,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        self.created_at = Some(ts);
        Ok(id)
    }

    /// Most recent snapshot
    pub fn latest(conn: &Connection) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM storage_snapshots ORDER BY id DESC LIMIT 1");
        let found = conn.query_row(&sql, [], Self::from_row).optional()?;
        Ok(found)
    }

    /// Most recent snapshots, newest first
    pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM storage_snapshots ORDER BY id DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let snapshots = stmt
            .query_map([limit as i64], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            total_bytes: row.get(1)?,
            used_bytes: row.get(2)?,
            available_bytes: row.get(3)?,
            full_bytes: row.get(4)?,
            patch_bytes: row.get(5)?,
            hotfix_bytes: row.get(6)?,
            usage_ratio: row.get(7)?,
            reason: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}
