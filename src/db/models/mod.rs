// src/db/models/mod.rs

//! Data models for registry entities
//!
//! Each struct corresponds to a database table and carries its own
//! create/read/update helpers. Status and kind columns are stored as text
//! and surfaced as closed enums.

mod cleanup;
mod package;
mod package_file;
mod retention;
mod snapshot;
mod version;

pub use cleanup::{CleanupItem, CleanupRecord, CleanupStatus, CleanupStep};
pub use package::{Package, PackageFilter, PackageKind, PackageStatus};
pub use package_file::{FileOperation, PackageFile};
pub use retention::RetentionSetting;
pub use snapshot::StorageSnapshot;
pub use version::Version;

use rusqlite::Row;
use std::str::FromStr;

/// Read a text column and parse it into a string-backed enum
pub(crate) fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use rusqlite::Connection;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn make_package(conn: &Connection, version: &Version, kind: PackageKind, name: &str) -> Package {
        let mut pkg = Package::new(
            version.id.unwrap(),
            kind,
            name.to_string(),
            format!("stored-{name}"),
            format!("packages/{}/{}/stored-{name}", kind.as_str(), version.version),
        );
        pkg.insert(conn).unwrap();
        pkg
    }

    #[test]
    fn test_version_find_or_create() {
        let (_temp, conn) = create_test_db();

        let v1 = Version::find_or_create(&conn, "2.0.0", "windows", "x64").unwrap();
        let v2 = Version::find_or_create(&conn, "2.0.0", "windows", "x64").unwrap();
        assert_eq!(v1.id, v2.id);

        let other = Version::find_or_create(&conn, "2.0.0", "linux", "x64").unwrap();
        assert_ne!(v1.id, other.id);
    }

    #[test]
    fn test_version_aggregates_accumulate() {
        let (_temp, conn) = create_test_db();
        let v = Version::find_or_create(&conn, "1.0.0", "linux", "arm64").unwrap();
        let id = v.id.unwrap();

        Version::add_aggregate(&conn, id, 100, 1).unwrap();
        Version::add_aggregate(&conn, id, 50, 2).unwrap();
        Version::add_aggregate(&conn, id, -30, -1).unwrap();

        let v = Version::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(v.total_size, 120);
        assert_eq!(v.file_count, 2);
    }

    #[test]
    fn test_package_lifecycle() {
        let (_temp, conn) = create_test_db();
        let v = Version::find_or_create(&conn, "1.0.0", "linux", "x64").unwrap();
        let mut pkg = make_package(&conn, &v, PackageKind::Full, "app.zip");
        assert_eq!(pkg.status, PackageStatus::Uploading);

        pkg.set_content(&conn, 42, "abc").unwrap();
        pkg.update_status(&conn, PackageStatus::Available).unwrap();

        let found = Package::find_by_id(&conn, pkg.id.unwrap()).unwrap().unwrap();
        assert_eq!(found.status, PackageStatus::Available);
        assert_eq!(found.size, 42);
        assert_eq!(found.version, "1.0.0");
        assert_eq!(found.platform, "linux");
    }

    #[test]
    fn test_package_filter_defaults_to_available() {
        let (_temp, conn) = create_test_db();
        let v = Version::find_or_create(&conn, "1.0.0", "linux", "x64").unwrap();
        let mut available = make_package(&conn, &v, PackageKind::Full, "a.zip");
        available
            .update_status(&conn, PackageStatus::Available)
            .unwrap();
        make_package(&conn, &v, PackageKind::Full, "b.zip");

        let listed = Package::list(&conn, &PackageFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.zip");

        let all = Package::list(
            &conn,
            &PackageFilter {
                include_all: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_group_listing_newest_first() {
        let (_temp, conn) = create_test_db();
        for (i, version) in ["1.0.1", "1.0.2", "1.0.3"].iter().enumerate() {
            let v = Version::find_or_create(&conn, version, "linux", "x64").unwrap();
            let mut pkg = make_package(&conn, &v, PackageKind::Hotfix, &format!("fix{i}.zip"));
            pkg.update_status(&conn, PackageStatus::Available).unwrap();
        }

        let group = Package::available_in_group(&conn, "linux", "x64", PackageKind::Hotfix).unwrap();
        let names: Vec<_> = group.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["fix2.zip", "fix1.zip", "fix0.zip"]);
    }

    #[test]
    fn test_package_files_unique_paths() {
        let (_temp, conn) = create_test_db();
        let v = Version::find_or_create(&conn, "1.0.0", "linux", "x64").unwrap();
        let pkg = make_package(&conn, &v, PackageKind::Full, "a.tar");
        let pkg_id = pkg.id.unwrap();

        let mut f = PackageFile::new(pkg_id, "bin/app".into(), 10, "h1".into(), FileOperation::Add);
        f.insert(&conn).unwrap();
        let mut dup = PackageFile::new(pkg_id, "bin/app".into(), 11, "h2".into(), FileOperation::Add);
        assert!(dup.insert(&conn).is_err());

        let files = PackageFile::find_by_package(&conn, pkg_id).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_cleanup_record_roundtrip() {
        let (_temp, conn) = create_test_db();
        let mut record = CleanupRecord::start(&conn, "manual", 0.8).unwrap();
        assert_eq!(record.status, CleanupStatus::Running);

        let mut item = CleanupItem::new(CleanupStep::Temp, None, "tmp/x".into(), 10);
        item.insert(&conn, record.id.unwrap()).unwrap();

        record
            .finish(&conn, CleanupStatus::Completed, 0.5, 10, None)
            .unwrap();

        let loaded = CleanupRecord::find_by_id(&conn, record.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, CleanupStatus::Completed);
        assert_eq!(loaded.bytes_freed, 10);
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].step, CleanupStep::Temp);
    }

    #[test]
    fn test_finish_refuses_a_closed_record() {
        let (_temp, conn) = create_test_db();
        let mut record = CleanupRecord::start(&conn, "manual", 0.8).unwrap();
        assert_eq!(CleanupRecord::fail_interrupted(&conn).unwrap(), 1);

        let result = record.finish(&conn, CleanupStatus::Completed, 0.5, 10, None);
        assert!(result.is_err());

        let loaded = CleanupRecord::find_by_id(&conn, record.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, CleanupStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_retention_settings_upsert() {
        let (_temp, conn) = create_test_db();
        RetentionSetting::set(&conn, PackageKind::Hotfix, 2).unwrap();
        RetentionSetting::set(&conn, PackageKind::Hotfix, 5).unwrap();

        let all = RetentionSetting::list(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, PackageKind::Hotfix);
        assert_eq!(all[0].max_versions, 5);
    }

    #[test]
    fn test_snapshot_latest() {
        let (_temp, conn) = create_test_db();
        let mut first = StorageSnapshot::new(1000, 100, "upload");
        first.insert(&conn).unwrap();
        let mut second = StorageSnapshot::new(1000, 300, "cleanup");
        second.insert(&conn).unwrap();

        let latest = StorageSnapshot::latest(&conn).unwrap().unwrap();
        assert_eq!(latest.used_bytes, 300);
        assert!((latest.usage_ratio - 0.3).abs() < f64::EPSILON);
    }
}
