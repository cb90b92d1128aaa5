// src/lifecycle/probe.rs

//! Storage usage probes

use crate::db::paths;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Point-in-time usage of the storage backing the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl StorageUsage {
    pub fn new(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            available: total.saturating_sub(used),
        }
    }

    /// `used / total`, 0 for an empty device
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64
        }
    }

    /// Ratio after `extra` more bytes are written
    pub fn projected_ratio(&self, extra: u64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used.saturating_add(extra) as f64 / self.total as f64
    }
}

/// Source of storage usage numbers
pub trait StorageProbe: Send + Sync {
    fn usage(&self) -> Result<StorageUsage>;
}

/// Filesystem statistics of the volume holding the storage root
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    root: PathBuf,
}

impl StatvfsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StorageProbe for StatvfsProbe {
    fn usage(&self) -> Result<StorageUsage> {
        let stat = nix::sys::statvfs::statvfs(&self.root).map_err(|e| {
            Error::IoError(format!("statvfs {} failed: {}", self.root.display(), e))
        })?;

        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let free = stat.blocks_free() as u64 * fragment;
        let available = stat.blocks_available() as u64 * fragment;
        let used = total.saturating_sub(free);

        Ok(StorageUsage {
            total,
            used,
            available,
        })
    }
}

/// Fixed capacity; used bytes are whatever the registry keeps under its root
///
/// The metadata directory and the backup area are not counted: backups are
/// bounded by their own age limit and the database is not evictable.
#[derive(Debug, Clone)]
pub struct QuotaProbe {
    root: PathBuf,
    capacity: u64,
}

impl QuotaProbe {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            root: root.into(),
            capacity,
        }
    }
}

impl StorageProbe for QuotaProbe {
    fn usage(&self) -> Result<StorageUsage> {
        let excluded = [paths::metadata_dir(&self.root), self.root.join("backups")];
        let used = directory_size(&self.root, &excluded);
        Ok(StorageUsage::new(self.capacity, used))
    }
}

/// Total size of regular files under `root`, skipping `excluded` subtrees
pub fn directory_size(root: &Path, excluded: &[PathBuf]) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !excluded.iter().any(|ex| entry.path() == ex))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_quota_probe_skips_metadata_and_backups() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("packages/full")).unwrap();
        fs::create_dir_all(temp.path().join("metadata")).unwrap();
        fs::create_dir_all(temp.path().join("backups/20260101")).unwrap();
        fs::write(temp.path().join("packages/full/a.zip"), vec![0u8; 300]).unwrap();
        fs::write(temp.path().join("metadata/deltaship.db"), vec![0u8; 5000]).unwrap();
        fs::write(temp.path().join("backups/20260101/a.zip.1.bak"), vec![0u8; 700]).unwrap();

        let usage = QuotaProbe::new(temp.path(), 1000).usage().unwrap();
        assert_eq!(usage.used, 300);
        assert_eq!(usage.available, 700);
        assert!((usage.ratio() - 0.3).abs() < 1e-9);
        assert!((usage.projected_ratio(500) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_statvfs_probe_reports_volume() {
        let temp = TempDir::new().unwrap();
        let usage = StatvfsProbe::new(temp.path()).usage().unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
    }

    #[test]
    fn test_empty_device_ratio() {
        assert_eq!(StorageUsage::new(0, 0).ratio(), 0.0);
    }
}
