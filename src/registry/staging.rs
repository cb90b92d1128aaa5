// src/registry/staging.rs

//! Resumable upload staging
//!
//! Clients push a package in chunks to `tmp/uploads/<name>`, each chunk
//! starting at the current staged size. Staged files live under the temp
//! directory, so abandoned ones are reaped by the lifecycle temp sweep.

use super::layout::StorageLayout;
use crate::error::{Error, Result};
use crate::hash;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info};

/// State of one staged upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpload {
    pub name: String,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct UploadStaging {
    layout: StorageLayout,
}

impl UploadStaging {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Path of a staged upload (validated name)
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        self.layout.staged_upload_path(name)
    }

    /// Current staged size, 0 when nothing is staged yet
    pub fn staged_size(&self, name: &str) -> Result<u64> {
        let path = self.path(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::IoError(format!("Failed to stat {}: {}", path.display(), e))),
        }
    }

    /// Append a chunk that must start exactly at the staged size
    ///
    /// Returns the new staged size.
    pub fn append<R: Read>(&self, name: &str, offset: u64, reader: &mut R) -> Result<u64> {
        let path = self.path(name)?;
        let staged = self.staged_size(name)?;
        if offset != staged {
            return Err(Error::OffsetMismatch {
                staged,
                requested: offset,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;

        let written = std::io::copy(reader, &mut file)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
        file.flush()?;
        file.sync_data()?;

        debug!("Staged {} bytes of {} at offset {}", written, name, offset);
        Ok(staged + written)
    }

    /// Size and hash of a staged upload
    pub fn status(&self, name: &str) -> Result<StagedUpload> {
        let path = self.path(name)?;
        if !path.exists() {
            return Err(Error::NotFoundError(format!("No staged upload named {}", name)));
        }
        Ok(StagedUpload {
            name: name.to_string(),
            size: self.staged_size(name)?,
            hash: hash::hash_file(&path)?,
        })
    }

    /// Remove a staged upload; missing files are not an error
    pub fn discard(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Discarded staged upload {}", name);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::IoError(format!("Failed to remove {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_in_order() {
        let temp = TempDir::new().unwrap();
        let staging = UploadStaging::new(StorageLayout::new(temp.path()));

        assert_eq!(staging.append("pkg.zip", 0, &mut &b"hello "[..]).unwrap(), 6);
        assert_eq!(staging.append("pkg.zip", 6, &mut &b"world"[..]).unwrap(), 11);

        let status = staging.status("pkg.zip").unwrap();
        assert_eq!(status.size, 11);
        assert_eq!(status.hash, hash::sha256(b"hello world"));
    }

    #[test]
    fn test_wrong_offset_rejected() {
        let temp = TempDir::new().unwrap();
        let staging = UploadStaging::new(StorageLayout::new(temp.path()));
        staging.append("pkg.zip", 0, &mut &b"abc"[..]).unwrap();

        match staging.append("pkg.zip", 10, &mut &b"x"[..]) {
            Err(Error::OffsetMismatch { staged, requested }) => {
                assert_eq!(staged, 3);
                assert_eq!(requested, 10);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_discard_and_bad_names() {
        let temp = TempDir::new().unwrap();
        let staging = UploadStaging::new(StorageLayout::new(temp.path()));
        staging.append("a.zip", 0, &mut &b"abc"[..]).unwrap();

        assert!(staging.discard("a.zip").unwrap());
        assert!(!staging.discard("a.zip").unwrap());
        assert!(matches!(staging.status("a.zip"), Err(Error::NotFoundError(_))));
        assert!(staging.append("../escape", 0, &mut &b"x"[..]).is_err());
    }
}
