// src/db/migrations.rs
//! Database migration implementations
//!
//! Each function evolves the schema by exactly one version.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Initial schema - Version 1
///
/// Creates the registry tables:
/// - versions: (version, platform, architecture) triples with aggregates
/// - packages: Full/Patch/Hotfix artifacts and their status
/// - package_files: Per-file manifest entries of a package
pub fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version TEXT NOT NULL,
            platform TEXT NOT NULL,
            architecture TEXT NOT NULL,
            is_stable INTEGER NOT NULL DEFAULT 1,
            is_critical INTEGER NOT NULL DEFAULT 0,
            is_protected INTEGER NOT NULL DEFAULT 0,
            total_size INTEGER NOT NULL DEFAULT 0,
            file_count INTEGER NOT NULL DEFAULT 0,
            release_date TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(version, platform, architecture)
        );

        CREATE INDEX idx_versions_target ON versions(platform, architecture);

        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('full', 'patch', 'hotfix')),
            name TEXT NOT NULL,
            file_name TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL DEFAULT '',
            storage_location TEXT NOT NULL,
            download_reference TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('uploading', 'processing', 'available', 'deprecated', 'deleted')),
            from_version TEXT,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (version_id) REFERENCES versions(id)
        );

        CREATE INDEX idx_packages_version ON packages(version_id);
        CREATE INDEX idx_packages_status ON packages(status);
        CREATE INDEX idx_packages_kind ON packages(kind);

        CREATE TABLE package_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            relative_path TEXT NOT NULL,
            size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            operation TEXT NOT NULL CHECK(operation IN ('add', 'modify', 'delete', 'patch')),
            UNIQUE(package_id, relative_path),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_files_package ON package_files(package_id);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Version 2: storage lifecycle tables
///
/// - storage_snapshots: Append-only usage history
/// - cleanup_records / cleanup_items: Audit of each cleanup run
/// - retention_policies: Runtime-configured per-kind limits
pub fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE storage_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            total_bytes INTEGER NOT NULL,
            used_bytes INTEGER NOT NULL,
            available_bytes INTEGER NOT NULL,
            full_bytes INTEGER NOT NULL DEFAULT 0,
            patch_bytes INTEGER NOT NULL DEFAULT 0,
            hotfix_bytes INTEGER NOT NULL DEFAULT 0,
            usage_ratio REAL NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_storage_snapshots_created ON storage_snapshots(created_at);

        CREATE TABLE cleanup_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trigger_reason TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed')),
            usage_before REAL NOT NULL,
            usage_after REAL,
            bytes_freed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE cleanup_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cleanup_id INTEGER NOT NULL,
            step TEXT NOT NULL CHECK(step IN ('temp', 'hotfix', 'patch', 'full')),
            package_id INTEGER,
            path TEXT NOT NULL,
            bytes INTEGER NOT NULL DEFAULT 0,
            backup_path TEXT,
            error TEXT,
            FOREIGN KEY (cleanup_id) REFERENCES cleanup_records(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_cleanup_items_cleanup ON cleanup_items(cleanup_id);
        CREATE INDEX idx_cleanup_items_package ON cleanup_items(package_id);

        CREATE TABLE retention_policies (
            kind TEXT PRIMARY KEY CHECK(kind IN ('full', 'patch', 'hotfix')),
            max_versions INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}
