// src/db/models/version.rs

//! Version model - a releasable (version, platform, architecture) triple

use crate::db::now;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

const COLUMNS: &str = "id, version, platform, architecture, is_stable, is_critical, is_protected,
                       total_size, file_count, release_date, created_at";

/// A named release for one platform/architecture
#[derive(Debug, Clone, Serialize)]
pub struct Version {
    pub id: Option<i64>,
    pub version: String,
    pub platform: String,
    pub architecture: String,
    pub is_stable: bool,
    pub is_critical: bool,
    /// Exempt from retention cleanup
    pub is_protected: bool,
    pub total_size: i64,
    pub file_count: i64,
    pub release_date: Option<String>,
    pub created_at: Option<String>,
}

impl Version {
    pub fn new(version: String, platform: String, architecture: String) -> Self {
        Self {
            id: None,
            version,
            platform,
            architecture,
            is_stable: true,
            is_critical: false,
            is_protected: false,
            total_size: 0,
            file_count: 0,
            release_date: None,
            created_at: None,
        }
    }

    /// Insert this version into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let created_at = now();
        conn.execute(
            "INSERT INTO versions (version, platform, architecture, is_stable, is_critical,
                                   is_protected, release_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &self.version,
                &self.platform,
                &self.architecture,
                self.is_stable,
                self.is_critical,
                self.is_protected,
                &self.release_date,
                &created_at,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        self.created_at = Some(created_at);
        Ok(id)
    }

    /// Find the version for a triple, creating it on first use
    pub fn find_or_create(
        conn: &Connection,
        version: &str,
        platform: &str,
        architecture: &str,
    ) -> Result<Self> {
        if let Some(existing) = Self::find(conn, version, platform, architecture)? {
            return Ok(existing);
        }

        let mut created = Self::new(
            version.to_string(),
            platform.to_string(),
            architecture.to_string(),
        );
        created.release_date = Some(now());
        created.insert(conn)?;
        Ok(created)
    }

    /// Find a version by its triple
    pub fn find(
        conn: &Connection,
        version: &str,
        platform: &str,
        architecture: &str,
    ) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM versions
             WHERE version = ?1 AND platform = ?2 AND architecture = ?3"
        );
        let found = conn
            .query_row(&sql, params![version, platform, architecture], Self::from_row)
            .optional()?;
        Ok(found)
    }

    /// Find a version by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM versions WHERE id = ?1");
        let found = conn.query_row(&sql, [id], Self::from_row).optional()?;
        Ok(found)
    }

    /// List all versions of one platform/architecture
    pub fn list_for_target(conn: &Connection, platform: &str, architecture: &str) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM versions
             WHERE platform = ?1 AND architecture = ?2 ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![platform, architecture], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// List all versions
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let sql = format!("SELECT {COLUMNS} FROM versions ORDER BY platform, architecture, created_at");
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// Apply a delta to the aggregate counters in a single statement
    pub fn add_aggregate(conn: &Connection, id: i64, size_delta: i64, file_delta: i64) -> Result<()> {
        conn.execute(
            "UPDATE versions
             SET total_size = MAX(0, total_size + ?1), file_count = MAX(0, file_count + ?2)
             WHERE id = ?3",
            params![size_delta, file_delta, id],
        )?;
        Ok(())
    }

    /// Mark a version as exempt from (or subject to) retention cleanup
    pub fn set_protected(conn: &Connection, id: i64, protected: bool) -> Result<()> {
        conn.execute(
            "UPDATE versions SET is_protected = ?1 WHERE id = ?2",
            params![protected, id],
        )?;
        Ok(())
    }

    /// Update the release flags
    pub fn set_flags(conn: &Connection, id: i64, is_stable: bool, is_critical: bool) -> Result<()> {
        conn.execute(
            "UPDATE versions SET is_stable = ?1, is_critical = ?2 WHERE id = ?3",
            params![is_stable, is_critical, id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            version: row.get(1)?,
            platform: row.get(2)?,
            architecture: row.get(3)?,
            is_stable: row.get(4)?,
            is_critical: row.get(5)?,
            is_protected: row.get(6)?,
            total_size: row.get(7)?,
            file_count: row.get(8)?,
            release_date: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}
