// src/registry/ingest.rs

//! Archive ingestion into a version's file tree
//!
//! Tar archives (optionally gzip-compressed) are unpacked in two passes: the
//! first validates every entry without writing anything, the second writes
//! regular files through a temp name and renames them into place.

use super::layout::{is_tar_archive, sanitize_path};
use crate::error::{Error, Result};
use crate::hash::Hasher;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

/// One regular file extracted from an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedFile {
    pub relative_path: String,
    pub size: u64,
    pub hash: String,
}

fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open archive {}: {}", path.display(), e)))?;
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let lower = name.to_ascii_lowercase();

    let reader: Box<dyn Read> = if lower.ends_with(".gz") || lower.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// List the regular files of an archive, rejecting unsafe or duplicate paths
pub fn scan_archive(path: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(path)?;
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::InvalidInput(format!("Unreadable archive: {}", e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::InvalidInput(format!("Unreadable archive entry: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| Error::InvalidInput(format!("Bad archive path: {}", e)))?
            .to_string_lossy()
            .to_string();
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            continue;
        }
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(Error::InvalidInput(format!(
                "Links are not allowed in packages: {}",
                raw_path
            )));
        }
        if !entry_type.is_file() {
            warn!("Skipping special archive entry: {}", raw_path);
            continue;
        }

        let relative = sanitize_path(&raw_path)?;
        if !seen.insert(relative.clone()) {
            return Err(Error::InvalidInput(format!(
                "Duplicate path in archive: {}",
                relative
            )));
        }
        files.push(relative);
    }

    Ok(files)
}

/// Extract an archive into `tree_dir`, returning what was written
///
/// When `only` is given, just those paths are extracted.
pub fn extract_archive(
    archive_path: &Path,
    tree_dir: &Path,
    only: Option<&HashSet<String>>,
) -> Result<Vec<IngestedFile>> {
    if !is_tar_archive(&archive_path.to_string_lossy()) {
        return Ok(Vec::new());
    }

    // Validate everything before the first write
    scan_archive(archive_path)?;

    fs::create_dir_all(tree_dir)?;
    let mut archive = open_archive(archive_path)?;
    let mut written = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::InvalidInput(format!("Unreadable archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::InvalidInput(format!("Unreadable archive entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw_path = entry
            .path()
            .map_err(|e| Error::InvalidInput(format!("Bad archive path: {}", e)))?
            .to_string_lossy()
            .to_string();
        let relative = sanitize_path(&raw_path)?;
        if let Some(filter) = only
            && !filter.contains(&relative)
        {
            continue;
        }

        let target = tree_dir.join(&relative);
        let (size, hash) = write_entry(&mut entry, &target)?;
        debug!("Extracted {} ({} bytes)", relative, size);
        written.push(IngestedFile {
            relative_path: relative,
            size,
            hash,
        });
    }

    Ok(written)
}

fn write_entry<R: Read>(reader: &mut R, target: &Path) -> Result<(u64, String)> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = target.with_extension("ingest-tmp");
    let file = File::create(&temp_path)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {}", temp_path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, target)
        .map_err(|e| Error::IoError(format!("Failed to place {}: {}", target.display(), e)))?;
    let size = hasher.bytes_hashed();
    Ok((size, hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hash;
    use tempfile::TempDir;

    /// Build a tar archive in memory from (path, contents) pairs
    pub(crate) fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            // set_path refuses "..", so write the raw name for hostile fixtures
            let name = header.as_old_mut().name.as_mut();
            name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_writes_tree() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("app.tar");
        fs::write(&archive, build_tar(&[("bin/app", b"binary"), ("./readme", b"hi")])).unwrap();

        let tree = temp.path().join("tree");
        let files = extract_archive(&archive, &tree, None).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read(tree.join("bin/app")).unwrap(), b"binary");
        assert_eq!(files[1].relative_path, "readme");
        assert_eq!(files[0].hash, hash::sha256(b"binary"));
    }

    #[test]
    fn test_escape_rejected_before_writing() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.tar");
        fs::write(&archive, build_tar(&[("ok.txt", b"fine"), ("../evil", b"x")])).unwrap();

        let tree = temp.path().join("tree");
        let result = extract_archive(&archive, &tree, None);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!tree.join("ok.txt").exists());
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("dup.tar");
        fs::write(&archive, build_tar(&[("a", b"1"), ("./a", b"2")])).unwrap();
        assert!(matches!(scan_archive(&archive), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_non_tar_is_ignored() {
        let temp = TempDir::new().unwrap();
        let zip = temp.path().join("app.zip");
        fs::write(&zip, b"PK...").unwrap();
        assert!(extract_archive(&zip, &temp.path().join("tree"), None).unwrap().is_empty());
    }
}
