// src/db/schema.rs

//! Database schema versioning for the registry
//!
//! Tracks the applied schema version in a `schema_version` table and applies
//! the numbered migrations from [`super::migrations`] in order.

use super::migrations;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

type Migration = fn(&Connection) -> Result<()>;

/// Migrations in order; entry `n` moves the schema from version `n` to `n + 1`
const MIGRATIONS: &[Migration] = &[migrations::migrate_v1, migrations::migrate_v2];

/// Current schema version
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Highest applied version, 0 for a fresh database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )?;
    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Bring the database up to [`SCHEMA_VERSION`]
///
/// Each step runs in its own transaction together with its version row, so
/// a failed step leaves the database at the previous version.
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    debug!("Registry schema at version {}", current);

    for (index, step) in MIGRATIONS.iter().enumerate().skip(current.max(0) as usize) {
        let version = index as i32 + 1;
        info!("Migrating registry schema to version {}", version);
        let tx = conn.unchecked_transaction()?;
        step(&tx)?;
        set_schema_version(&tx, version)?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        set_schema_version(&conn, 1).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "versions",
            "packages",
            "package_files",
            "storage_snapshots",
            "cleanup_records",
            "cleanup_items",
            "retention_policies",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_package_kind_constraint() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO versions (version, platform, architecture, created_at)
             VALUES ('1.0.0', 'linux', 'x64', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO packages (version_id, kind, name, file_name, size, content_hash,
                                   storage_location, download_reference, status, created_at, updated_at)
             VALUES (1, 'nightly', 'a.zip', 'a.zip', 0, '', '', '', 'uploading', '', '')",
            [],
        );
        assert!(result.is_err());
    }
}
