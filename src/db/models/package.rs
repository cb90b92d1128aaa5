// src/db/models/package.rs

//! Package model - a distributable artifact attached to a version

use crate::db::now;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::parse_column;

/// Kind of distributable artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// Complete installation archive
    Full,
    /// Binary delta from a specific earlier version
    Patch,
    /// Small targeted fix archive
    Hotfix,
}

impl PackageKind {
    pub const ALL: [PackageKind; 3] = [PackageKind::Full, PackageKind::Patch, PackageKind::Hotfix];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Full => "full",
            PackageKind::Patch => "patch",
            PackageKind::Hotfix => "hotfix",
        }
    }

    /// Parse a user-supplied kind, case-insensitively
    pub fn parse(s: &str) -> Result<Self> {
        s.to_ascii_lowercase()
            .parse()
            .map_err(|_| Error::InvalidPackageKind(s.to_string()))
    }
}

impl FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(PackageKind::Full),
            "patch" => Ok(PackageKind::Patch),
            "hotfix" => Ok(PackageKind::Hotfix),
            _ => Err(format!("Invalid package kind: {s}")),
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package lifecycle status
///
/// `Uploading -> Processing -> Available -> {Deprecated ->} Deleted`.
/// `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Uploading,
    Processing,
    Available,
    Deprecated,
    Deleted,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Uploading => "uploading",
            PackageStatus::Processing => "processing",
            PackageStatus::Available => "available",
            PackageStatus::Deprecated => "deprecated",
            PackageStatus::Deleted => "deleted",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: PackageStatus) -> bool {
        use PackageStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Uploading, Processing) => true,
            (Processing, Available) => true,
            (Available, Deprecated) | (Deprecated, Available) => true,
            _ => false,
        }
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(PackageStatus::Uploading),
            "processing" => Ok(PackageStatus::Processing),
            "available" => Ok(PackageStatus::Available),
            "deprecated" => Ok(PackageStatus::Deprecated),
            "deleted" => Ok(PackageStatus::Deleted),
            _ => Err(format!("Invalid package status: {s}")),
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection criteria for [`Package::list`]
///
/// With `include_all` unset and no explicit `status`, only `Available`
/// packages are returned.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageFilter {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub kind: Option<PackageKind>,
    pub status: Option<PackageStatus>,
    #[serde(default)]
    pub include_all: bool,
}

const SELECT: &str = "SELECT p.id, p.version_id, p.kind, p.name, p.file_name, p.size, p.content_hash,
                             p.storage_location, p.download_reference, p.status, p.from_version,
                             p.failure_reason, p.created_at, p.updated_at,
                             v.version, v.platform, v.architecture, v.is_protected
                      FROM packages p JOIN versions v ON v.id = p.version_id";

/// A Package row joined with its version triple
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub id: Option<i64>,
    pub version_id: i64,
    pub kind: PackageKind,
    /// Original file name as submitted
    pub name: String,
    /// Generated name of the stored file
    pub file_name: String,
    pub size: i64,
    pub content_hash: String,
    /// Path relative to the storage root
    pub storage_location: String,
    pub download_reference: String,
    pub status: PackageStatus,
    pub from_version: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub version: String,
    pub platform: String,
    pub architecture: String,
    pub is_protected: bool,
}

impl Package {
    /// Create a new package in `Uploading` state
    pub fn new(
        version_id: i64,
        kind: PackageKind,
        name: String,
        file_name: String,
        storage_location: String,
    ) -> Self {
        let download_reference = format!("/download/{}", storage_location.trim_start_matches('/'));
        Self {
            id: None,
            version_id,
            kind,
            name,
            file_name,
            size: 0,
            content_hash: String::new(),
            storage_location,
            download_reference,
            status: PackageStatus::Uploading,
            from_version: None,
            failure_reason: None,
            created_at: None,
            updated_at: None,
            version: String::new(),
            platform: String::new(),
            architecture: String::new(),
            is_protected: false,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let ts = now();
        conn.execute(
            "INSERT INTO packages (version_id, kind, name, file_name, size, content_hash,
                                   storage_location, download_reference, status, from_version,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                self.version_id,
                self.kind.as_str(),
                &self.name,
                &self.file_name,
                self.size,
                &self.content_hash,
                &self.storage_location,
                &self.download_reference,
                self.status.as_str(),
                &self.from_version,
                &ts,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        self.created_at = Some(ts.clone());
        self.updated_at = Some(ts);

        if self.version.is_empty()
            && let Some(v) = super::Version::find_by_id(conn, self.version_id)?
        {
            self.version = v.version;
            self.platform = v.platform;
            self.architecture = v.architecture;
            self.is_protected = v.is_protected;
        }
        Ok(id)
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let sql = format!("{SELECT} WHERE p.id = ?1");
        let found = conn.query_row(&sql, [id], Self::from_row).optional()?;
        Ok(found)
    }

    /// Find a package by its storage location
    pub fn find_by_location(conn: &Connection, location: &str) -> Result<Option<Self>> {
        let sql = format!("{SELECT} WHERE p.storage_location = ?1");
        let found = conn.query_row(&sql, [location], Self::from_row).optional()?;
        Ok(found)
    }

    /// Find non-deleted packages of one version/kind with the same original name
    pub fn find_by_name(
        conn: &Connection,
        version_id: i64,
        kind: PackageKind,
        name: &str,
    ) -> Result<Vec<Self>> {
        let sql = format!(
            "{SELECT} WHERE p.version_id = ?1 AND p.kind = ?2 AND p.name = ?3
             AND p.status != 'deleted' ORDER BY p.id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let packages = stmt
            .query_map(params![version_id, kind.as_str(), name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// List packages matching a filter, newest first
    pub fn list(conn: &Connection, filter: &PackageFilter) -> Result<Vec<Self>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(version) = &filter.version {
            clauses.push("v.version = ?");
            values.push(Box::new(version.clone()));
        }
        if let Some(platform) = &filter.platform {
            clauses.push("v.platform = ?");
            values.push(Box::new(platform.clone()));
        }
        if let Some(arch) = &filter.architecture {
            clauses.push("v.architecture = ?");
            values.push(Box::new(arch.clone()));
        }
        if let Some(kind) = filter.kind {
            clauses.push("p.kind = ?");
            values.push(Box::new(kind.as_str()));
        }
        match (filter.status, filter.include_all) {
            (Some(status), _) => {
                clauses.push("p.status = ?");
                values.push(Box::new(status.as_str()));
            }
            (None, false) => clauses.push("p.status = 'available'"),
            (None, true) => {}
        }

        let mut sql = SELECT.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY p.created_at DESC, p.id DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let packages = stmt
            .query_map(params.as_slice(), Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Available packages of one kind for a platform/architecture, newest first
    pub fn available_in_group(
        conn: &Connection,
        platform: &str,
        architecture: &str,
        kind: PackageKind,
    ) -> Result<Vec<Self>> {
        let sql = format!(
            "{SELECT} WHERE v.platform = ?1 AND v.architecture = ?2 AND p.kind = ?3
             AND p.status = 'available' ORDER BY p.created_at DESC, p.id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let packages = stmt
            .query_map(params![platform, architecture, kind.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Distinct (platform, architecture) pairs that have available packages of a kind
    pub fn groups_for_kind(conn: &Connection, kind: PackageKind) -> Result<Vec<(String, String)>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT v.platform, v.architecture
             FROM packages p JOIN versions v ON v.id = p.version_id
             WHERE p.kind = ?1 AND p.status = 'available'
             ORDER BY v.platform, v.architecture",
        )?;
        let groups = stmt
            .query_map([kind.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Packages stuck in `Uploading`/`Processing` since before `cutoff`
    pub fn find_stale(conn: &Connection, cutoff: &str) -> Result<Vec<Self>> {
        let sql = format!(
            "{SELECT} WHERE p.status IN ('uploading', 'processing') AND p.updated_at < ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let packages = stmt
            .query_map([cutoff], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Sum of available package sizes per kind
    pub fn bytes_by_kind(conn: &Connection) -> Result<Vec<(PackageKind, i64)>> {
        let mut stmt = conn.prepare(
            "SELECT kind, COALESCE(SUM(size), 0) FROM packages
             WHERE status = 'available' GROUP BY kind",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((parse_column::<PackageKind>(row, 0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record the size and hash of the stored bytes
    pub fn set_content(&mut self, conn: &Connection, size: i64, content_hash: &str) -> Result<()> {
        let id = self.require_id()?;
        let ts = now();
        conn.execute(
            "UPDATE packages SET size = ?1, content_hash = ?2, updated_at = ?3 WHERE id = ?4",
            params![size, content_hash, &ts, id],
        )?;
        self.size = size;
        self.content_hash = content_hash.to_string();
        self.updated_at = Some(ts);
        Ok(())
    }

    /// Update package status, enforcing legal transitions
    pub fn update_status(&mut self, conn: &Connection, new_status: PackageStatus) -> Result<()> {
        let id = self.require_id()?;

        if self.status != new_status && !self.status.can_transition_to(new_status) {
            // Uploading may skip Processing when bytes are verified in one pass
            let direct_publish =
                self.status == PackageStatus::Uploading && new_status == PackageStatus::Available;
            if !direct_publish {
                return Err(Error::InvalidInput(format!(
                    "Package {} cannot move from {} to {}",
                    id, self.status, new_status
                )));
            }
        }

        let ts = now();
        conn.execute(
            "UPDATE packages SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_status.as_str(), &ts, id],
        )?;
        self.status = new_status;
        self.updated_at = Some(ts);
        Ok(())
    }

    /// Mark this package deleted with a reason (integrity failure, abandonment)
    pub fn mark_failed(&mut self, conn: &Connection, reason: &str) -> Result<()> {
        let id = self.require_id()?;
        let ts = now();
        conn.execute(
            "UPDATE packages SET status = 'deleted', failure_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, &ts, id],
        )?;
        self.status = PackageStatus::Deleted;
        self.failure_reason = Some(reason.to_string());
        self.updated_at = Some(ts);
        Ok(())
    }

    /// Restore a deleted package to `Available` (rollback only)
    pub fn restore(&mut self, conn: &Connection, size: i64, content_hash: &str) -> Result<()> {
        let id = self.require_id()?;
        let ts = now();
        conn.execute(
            "UPDATE packages SET status = 'available', size = ?1, content_hash = ?2,
                                 failure_reason = NULL, updated_at = ?3
             WHERE id = ?4",
            params![size, content_hash, &ts, id],
        )?;
        self.status = PackageStatus::Available;
        self.size = size;
        self.content_hash = content_hash.to_string();
        self.failure_reason = None;
        self.updated_at = Some(ts);
        Ok(())
    }

    fn require_id(&self) -> Result<i64> {
        self.id
            .ok_or_else(|| Error::Internal("Package has not been inserted".to_string()))
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            version_id: row.get(1)?,
            kind: parse_column(row, 2)?,
            name: row.get(3)?,
            file_name: row.get(4)?,
            size: row.get(5)?,
            content_hash: row.get(6)?,
            storage_location: row.get(7)?,
            download_reference: row.get(8)?,
            status: parse_column(row, 9)?,
            from_version: row.get(10)?,
            failure_reason: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            version: row.get(14)?,
            platform: row.get(15)?,
            architecture: row.get(16)?,
            is_protected: row.get(17)?,
        })
    }
}
