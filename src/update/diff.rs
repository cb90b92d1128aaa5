// src/update/diff.rs

//! Difference detector
//!
//! Classifies every path of two manifests. Used both for client update
//! checks (local tree vs. server manifest) and publish-time sync (new tree
//! vs. previously stored manifest).

use super::manifest::{FileEntry, Manifest};
use serde::Serialize;

/// A path with its size and hash on one side of the diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub path: String,
    pub size: u64,
    pub hash: String,
}

impl DiffEntry {
    fn new(path: &str, entry: &FileEntry) -> Self {
        Self {
            path: path.to_string(),
            size: entry.size,
            hash: entry.hash.clone(),
        }
    }
}

/// A path present on both sides with different content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModifiedEntry {
    pub path: String,
    pub old: FileEntry,
    pub new: FileEntry,
}

/// Classified difference between a local and a remote manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestDiff {
    /// Only in remote
    pub new: Vec<DiffEntry>,
    /// In both, hashes differ
    pub modified: Vec<ModifiedEntry>,
    /// Only in local (orphans on the local side)
    pub deleted: Vec<DiffEntry>,
    /// In both, hashes equal
    pub same: Vec<String>,
}

impl ManifestDiff {
    /// No new, modified or deleted paths
    pub fn is_unchanged(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.new.len() + self.modified.len() + self.deleted.len()
    }
}

/// Compare `local` against `remote`
///
/// Pure function of its inputs; output lists are sorted by path.
pub fn diff(local: &Manifest, remote: &Manifest) -> ManifestDiff {
    let mut result = ManifestDiff::default();

    for (path, remote_entry) in remote.iter() {
        match local.get(path) {
            None => result.new.push(DiffEntry::new(path, remote_entry)),
            Some(local_entry) if local_entry.hash != remote_entry.hash => {
                result.modified.push(ModifiedEntry {
                    path: path.clone(),
                    old: local_entry.clone(),
                    new: remote_entry.clone(),
                })
            }
            Some(_) => result.same.push(path.clone()),
        }
    }

    for (path, local_entry) in local.iter() {
        if !remote.contains(path) {
            result.deleted.push(DiffEntry::new(path, local_entry));
        }
    }

    result
}
