// src/db/models/retention.rs

//! Persisted per-kind retention limits

use super::{PackageKind, parse_column};
use crate::db::now;
use crate::error::Result;
use rusqlite::{Connection, params};

/// A runtime override of the configured retention limit for one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSetting {
    pub kind: PackageKind,
    pub max_versions: u32,
    pub updated_at: String,
}

impl RetentionSetting {
    /// Insert or replace the limit for a kind
    pub fn set(conn: &Connection, kind: PackageKind, max_versions: u32) -> Result<()> {
        conn.execute(
            "INSERT INTO retention_policies (kind, max_versions, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET max_versions = excluded.max_versions,
                                             updated_at = excluded.updated_at",
            params![kind.as_str(), max_versions, now()],
        )?;
        Ok(())
    }

    /// All stored overrides
    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare("SELECT kind, max_versions, updated_at FROM retention_policies ORDER BY kind")?;
        let settings = stmt
            .query_map([], |row| {
                Ok(Self {
                    kind: parse_column(row, 0)?,
                    max_versions: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(settings)
    }
}
