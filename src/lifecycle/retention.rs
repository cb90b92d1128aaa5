// src/lifecycle/retention.rs

//! Retention limits and candidate selection

use crate::db::models::{Package, PackageKind, RetentionSetting};
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Maximum number of available, unprotected packages kept per
/// (platform, architecture, kind) group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub max_full: u32,
    pub max_patch: u32,
    pub max_hotfix: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_full: 3,
            max_patch: 10,
            max_hotfix: 20,
        }
    }
}

impl RetentionPolicy {
    pub fn limit_for(&self, kind: PackageKind) -> u32 {
        match kind {
            PackageKind::Full => self.max_full,
            PackageKind::Patch => self.max_patch,
            PackageKind::Hotfix => self.max_hotfix,
        }
    }

    pub fn set_limit(&mut self, kind: PackageKind, max_versions: u32) {
        match kind {
            PackageKind::Full => self.max_full = max_versions,
            PackageKind::Patch => self.max_patch = max_versions,
            PackageKind::Hotfix => self.max_hotfix = max_versions,
        }
    }

    /// Configured defaults overlaid with the limits stored in the registry
    pub fn load(conn: &Connection, defaults: RetentionPolicy) -> Result<Self> {
        let mut policy = defaults;
        for setting in RetentionSetting::list(conn)? {
            policy.set_limit(setting.kind, setting.max_versions);
        }
        Ok(policy)
    }
}

pub fn validate_limit(max_versions: u32) -> Result<()> {
    if max_versions == 0 {
        return Err(Error::InvalidInput(
            "Retention limit must keep at least one version".to_string(),
        ));
    }
    Ok(())
}

/// Packages beyond `limit` in a newest-first group
///
/// Protected packages are neither counted nor returned.
pub fn select_excess(group: Vec<Package>, limit: u32) -> Vec<Package> {
    group
        .into_iter()
        .filter(|p| !p.is_protected)
        .skip(limit as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::Version;

    fn package(conn: &Connection, version: &str, protected: bool) -> Package {
        let v = Version::find_or_create(conn, version, "linux", "x64").unwrap();
        if protected {
            Version::set_protected(conn, v.id.unwrap(), true).unwrap();
        }
        let mut p = Package::new(
            v.id.unwrap(),
            PackageKind::Full,
            "a.zip".into(),
            format!("{version}.zip"),
            format!("packages/full/{version}/a.zip"),
        );
        p.insert(conn).unwrap();
        p
    }

    #[test]
    fn test_select_excess_skips_protected() {
        let conn = db::open_in_memory().unwrap();
        let group = vec![
            package(&conn, "5.0", false),
            package(&conn, "4.0", true),
            package(&conn, "3.0", false),
            package(&conn, "2.0", false),
        ];

        let excess = select_excess(group, 2);
        assert_eq!(excess.len(), 1);
        assert_eq!(excess[0].version, "2.0");
    }

    #[test]
    fn test_stored_limits_override_defaults() {
        let conn = db::open_in_memory().unwrap();
        RetentionSetting::set(&conn, PackageKind::Hotfix, 2).unwrap();

        let policy = RetentionPolicy::load(&conn, RetentionPolicy::default()).unwrap();
        assert_eq!(policy.max_hotfix, 2);
        assert_eq!(policy.max_full, 3);
        assert_eq!(policy.limit_for(PackageKind::Patch), 10);
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(validate_limit(0).is_err());
        assert!(validate_limit(1).is_ok());
    }
}
