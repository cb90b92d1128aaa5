// src/update/manifest.rs

//! File tree manifests
//!
//! A manifest maps a relative path to the file's size and SHA-256. On disk
//! it is a flat JSON object keyed by path:
//!
//! ```json
//! { "bin/app": { "size": 1024, "hash": "ab12..." } }
//! ```

use crate::error::{Error, Result};
use crate::hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Size and content hash of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub hash: String,
}

impl FileEntry {
    pub fn new(size: u64, hash: impl Into<String>) -> Self {
        Self {
            size,
            hash: hash.into().to_ascii_lowercase(),
        }
    }
}

/// Mapping from relative path to [`FileEntry`], ordered by path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, FileEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest by hashing every regular file under `root`
    pub fn from_dir(root: &Path) -> Result<Self> {
        let mut manifest = Self::new();
        if !root.exists() {
            return Ok(manifest);
        }

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {}", root.display(), e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::Internal(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            let size = entry
                .metadata()
                .map_err(|e| Error::IoError(format!("Failed to stat {}: {}", entry.path().display(), e)))?
                .len();
            let hash = hash::hash_file(entry.path())?;
            manifest.insert(relative, FileEntry::new(size, hash));
        }

        debug!("Manifest of {}: {} files", root.display(), manifest.len());
        Ok(manifest)
    }

    /// Load a JSON manifest document
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read manifest {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: Manifest = serde_json::from_str(content)
            .map_err(|e| Error::ParseError(format!("Invalid manifest: {}", e)))?;

        // Re-insert to normalize hash case
        let mut manifest = Manifest::new();
        for (path, entry) in parsed.entries {
            manifest.insert(path, FileEntry::new(entry.size, entry.hash));
        }
        Ok(manifest)
    }

    /// Write as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        fs::write(path, json)
            .map_err(|e| Error::IoError(format!("Failed to write manifest {}: {}", path.display(), e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Path to hash map, the flat checksum sidecar form
    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.hash.clone()))
            .collect()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: FileEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all file sizes
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

impl FromIterator<(String, FileEntry)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (String, FileEntry)>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for (path, entry) in iter {
            manifest.insert(path, entry);
        }
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_dir_uses_relative_paths() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("bin")).unwrap();
        fs::write(temp.path().join("bin/app"), b"binary").unwrap();
        fs::write(temp.path().join("readme.txt"), b"hello").unwrap();

        let manifest = Manifest::from_dir(temp.path()).unwrap();
        assert_eq!(manifest.len(), 2);
        let app = manifest.get("bin/app").unwrap();
        assert_eq!(app.size, 6);
        assert_eq!(app.hash, hash::sha256(b"binary"));
        assert_eq!(manifest.total_size(), 11);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest::from_dir(&temp.path().join("nope")).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_json_is_flat_and_normalized() {
        let json = r#"{ "a.txt": { "size": 3, "hash": "ABCDEF" } }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.get("a.txt").unwrap().hash, "abcdef");

        let value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(value["a.txt"]["size"], 3);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(
            Manifest::from_json("[1, 2]"),
            Err(Error::ParseError(_))
        ));
    }
}
