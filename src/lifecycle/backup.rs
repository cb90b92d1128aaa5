// src/lifecycle/backup.rs

//! Two-phase package backups
//!
//! A backup is first copied to `<final>.staging`, its hash checked, and only
//! then renamed to `backups/<YYYYMMDD>/<stored name>.<unix ts>.bak`. A crash
//! between the phases leaves a `.staging` file that the next cleanup run
//! removes; the package itself is untouched until the rename succeeded.

use crate::error::{Error, Result};
use crate::hash;
use crate::registry::StorageLayout;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const STAGING_SUFFIX: &str = ".staging";
const BACKUP_SUFFIX: &str = ".bak";

/// A copied but not yet committed backup
#[derive(Debug)]
pub struct StagedBackup {
    staging_path: PathBuf,
    final_path: PathBuf,
    size: u64,
}

impl StagedBackup {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check the staged copy against the hash the registry holds
    pub fn verify(&self, expected_hash: &str) -> Result<()> {
        hash::verify_file(&self.staging_path, expected_hash)
    }

    /// Rename the staged copy to its final name
    pub fn commit(self) -> Result<PathBuf> {
        fs::rename(&self.staging_path, &self.final_path).map_err(|e| {
            Error::IoError(format!(
                "Failed to commit backup {}: {}",
                self.final_path.display(),
                e
            ))
        })?;
        Ok(self.final_path)
    }

    /// Drop the staged copy
    pub fn discard(self) {
        if let Err(e) = fs::remove_file(&self.staging_path) {
            warn!("Failed to remove {}: {}", self.staging_path.display(), e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    layout: StorageLayout,
}

impl BackupStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Final path for a backup of `file_name` taken at `at`
    pub fn backup_path(&self, file_name: &str, at: DateTime<Utc>) -> PathBuf {
        self.layout
            .backups_dir()
            .join(at.format("%Y%m%d").to_string())
            .join(format!("{}.{}{}", file_name, at.timestamp_micros(), BACKUP_SUFFIX))
    }

    /// Phase one: copy `source` next to its final backup name
    pub fn stage(&self, source: &Path, file_name: &str) -> Result<StagedBackup> {
        let final_path = self.backup_path(file_name, Utc::now());
        let staging_path = PathBuf::from(format!("{}{}", final_path.display(), STAGING_SUFFIX));
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let size = fs::copy(source, &staging_path).map_err(|e| {
            Error::IoError(format!("Failed to back up {}: {}", source.display(), e))
        })?;
        debug!("Staged backup of {} ({} bytes)", source.display(), size);

        Ok(StagedBackup {
            staging_path,
            final_path,
            size,
        })
    }

    /// Stage, verify and commit in one call
    pub fn backup_verified(&self, source: &Path, file_name: &str, expected_hash: &str) -> Result<PathBuf> {
        let staged = self.stage(source, file_name)?;
        if let Err(e) = staged.verify(expected_hash) {
            staged.discard();
            return Err(e);
        }
        let path = staged.commit()?;
        info!("Backed up {} to {}", source.display(), path.display());
        Ok(path)
    }

    /// Most recent committed backup of a stored file name
    pub fn find_latest(&self, file_name: &str) -> Option<PathBuf> {
        let prefix = format!("{}.", file_name);
        let mut best: Option<(i64, PathBuf)> = None;

        for entry in WalkDir::new(self.layout.backups_dir())
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy();
            let Some(stamp) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(BACKUP_SUFFIX))
                .and_then(|ts| ts.parse::<i64>().ok())
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(b, _)| stamp > *b) {
                best = Some((stamp, entry.path().to_path_buf()));
            }
        }

        best.map(|(_, path)| path)
    }

    /// Remove leftover `.staging` files from interrupted runs
    pub fn recover_staged(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        for entry in WalkDir::new(self.layout.backups_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed.push(entry.path().to_path_buf()),
                    Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
                }
            }
        }
        removed
    }

    /// Committed backups last modified more than `max_age` ago, with sizes
    pub fn expired(&self, max_age: Duration) -> Vec<(PathBuf, u64)> {
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Vec::new();
        };
        WalkDir::new(self.layout.backups_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_string_lossy().ends_with(BACKUP_SUFFIX))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let modified = meta.modified().ok()?;
                (modified < cutoff).then(|| (e.path().to_path_buf(), meta.len()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BackupStore) {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        layout.ensure_dirs().unwrap();
        (temp, BackupStore::new(layout))
    }

    #[test]
    fn test_backup_verified_commits() {
        let (temp, store) = store();
        let source = temp.path().join("pkg.zip");
        fs::write(&source, b"payload").unwrap();

        let path = store
            .backup_verified(&source, "pkg.zip", &hash::sha256(b"payload"))
            .unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".bak"));
        assert_eq!(store.find_latest("pkg.zip"), Some(path));
    }

    #[test]
    fn test_bad_hash_leaves_nothing() {
        let (temp, store) = store();
        let source = temp.path().join("pkg.zip");
        fs::write(&source, b"payload").unwrap();

        let result = store.backup_verified(&source, "pkg.zip", &hash::sha256(b"other"));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert!(store.find_latest("pkg.zip").is_none());
        assert!(store.recover_staged().is_empty());
    }

    #[test]
    fn test_crash_between_phases_is_recovered() {
        let (temp, store) = store();
        let source = temp.path().join("pkg.zip");
        fs::write(&source, b"payload").unwrap();

        let staged = store.stage(&source, "pkg.zip").unwrap();
        assert_eq!(staged.size(), 7);
        std::mem::forget(staged);

        assert!(store.find_latest("pkg.zip").is_none());
        assert_eq!(store.recover_staged().len(), 1);
        assert!(source.exists());
    }

    #[test]
    fn test_find_latest_prefers_newest() {
        let (_temp, store) = store();
        let day = store.layout.backups_dir().join("20260101");
        fs::create_dir_all(&day).unwrap();
        fs::write(day.join("a.zip.100.bak"), b"old").unwrap();
        fs::write(day.join("a.zip.200.bak"), b"new").unwrap();
        fs::write(day.join("a.zip.extra.300.bak"), b"other").unwrap();

        let latest = store.find_latest("a.zip").unwrap();
        assert_eq!(fs::read(latest).unwrap(), b"new");
    }
}
