// src/db/models/package_file.rs

//! PackageFile model - per-file manifest entries inside a package

use crate::error::Result;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::parse_column;

/// What a package does to one file of the installed tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Add,
    Modify,
    Delete,
    Patch,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Add => "add",
            FileOperation::Modify => "modify",
            FileOperation::Delete => "delete",
            FileOperation::Patch => "patch",
        }
    }
}

impl FromStr for FileOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "add" => Ok(FileOperation::Add),
            "modify" => Ok(FileOperation::Modify),
            "delete" => Ok(FileOperation::Delete),
            "patch" => Ok(FileOperation::Patch),
            _ => Err(format!("Invalid file operation: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageFile {
    pub id: Option<i64>,
    pub package_id: i64,
    pub relative_path: String,
    pub size: i64,
    pub content_hash: String,
    pub operation: FileOperation,
}

impl PackageFile {
    pub fn new(
        package_id: i64,
        relative_path: String,
        size: i64,
        content_hash: String,
        operation: FileOperation,
    ) -> Self {
        Self {
            id: None,
            package_id,
            relative_path,
            size,
            content_hash,
            operation,
        }
    }

    /// Insert this file entry into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO package_files (package_id, relative_path, size, content_hash, operation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.package_id,
                &self.relative_path,
                self.size,
                &self.content_hash,
                self.operation.as_str(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// All file entries of one package
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, relative_path, size, content_hash, operation
             FROM package_files WHERE package_id = ?1 ORDER BY relative_path",
        )?;
        let files = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// File entries of every available package of a version, oldest package first
    ///
    /// Later packages (hotfixes) override earlier entries for the same path when
    /// the caller folds the list into a manifest.
    pub fn find_for_version(conn: &Connection, version_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT f.id, f.package_id, f.relative_path, f.size, f.content_hash, f.operation
             FROM package_files f JOIN packages p ON p.id = f.package_id
             WHERE p.version_id = ?1 AND p.status = 'available'
             ORDER BY p.created_at, p.id, f.relative_path",
        )?;
        let files = stmt
            .query_map(params![version_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            relative_path: row.get(2)?,
            size: row.get(3)?,
            content_hash: row.get(4)?,
            operation: parse_column(row, 5)?,
        })
    }
}
