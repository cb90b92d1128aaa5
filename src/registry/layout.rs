// src/registry/layout.rs

//! On-disk storage layout
//!
//! Everything lives under one storage root:
//!
//! ```text
//! <root>/
//!   metadata/deltaship.db               registry database
//!   packages/<kind>/<version>/<file>    package artifacts
//!   files/<platform>/<arch>/<version>/  extracted version trees
//!   patches/<platform>/<arch>/<from>_to_<to>/<path>.patch
//!   backups/<YYYYMMDD>/<file>.<ts>.bak  cleanup backups
//!   tmp/                                temp files, staged uploads
//! ```
//!
//! Paths stored in the database are relative to the root so the tree can be
//! relocated.

use crate::db::models::PackageKind;
use crate::db::paths;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Storage root and the directory convention below it
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every top-level directory
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            paths::metadata_dir(&self.root),
            self.packages_dir(),
            self.files_root(),
            self.patches_dir(),
            self.backups_dir(),
            self.uploads_dir(),
        ] {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
                debug!("Created storage directory: {}", dir.display());
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        paths::db_path(&self.root)
    }

    pub fn cleanup_lock_path(&self) -> PathBuf {
        paths::cleanup_lock_path(&self.root)
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Relative directory of one kind bucket and version
    pub fn package_dir(&self, kind: PackageKind, version: &str) -> String {
        format!("packages/{}/{}", kind.as_str(), version)
    }

    pub fn files_root(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Relative directory of a version's extracted file tree
    pub fn version_files_dir(&self, platform: &str, arch: &str, version: &str) -> String {
        format!("files/{}/{}/{}", platform, arch, version)
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }

    /// Relative path of a cached per-file patch
    pub fn patch_cache_path(
        &self,
        platform: &str,
        arch: &str,
        from: &str,
        to: &str,
        relative_path: &str,
    ) -> String {
        format!(
            "patches/{}/{}/{}_to_{}/{}.patch",
            platform, arch, from, to, relative_path
        )
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.temp_dir().join("uploads")
    }

    /// Absolute path of a staged upload
    pub fn staged_upload_path(&self, name: &str) -> Result<PathBuf> {
        validate_segment("upload name", name)?;
        Ok(self.uploads_dir().join(name))
    }

    /// Resolve a root-relative path
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Express an absolute path under the root as a root-relative string
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Build the stored name for an uploaded file
///
/// Format: `<platform>-<arch>-<8 hex>-<sanitized original name>`. The random
/// component keeps repeated uploads of the same name from colliding.
pub fn generate_file_name(platform: &str, arch: &str, original: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let sanitized: String = original
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}-{}-{}", platform, arch, &id[..8], sanitized)
}

/// Return the allow-listed extension `name` ends with, longest match first
pub fn matching_extension<'a>(name: &str, allowed: &'a [String]) -> Option<&'a str> {
    let lower = name.to_ascii_lowercase();
    allowed
        .iter()
        .filter(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
        .max_by_key(|ext| ext.len())
        .map(|ext| ext.as_str())
}

/// Whether a file name is a tar archive the registry can unpack
pub fn is_tar_archive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tar") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
}

/// Validate a single path segment such as a version or platform string
pub fn validate_segment(field: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid {}: {:?}", field, value)))
    }
}

/// Normalize a relative path from an untrusted source
///
/// Rejects `..` components and absolute paths, drops `.` components, and
/// returns a forward-slash path.
pub fn sanitize_path(path: &str) -> Result<String> {
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(Error::InvalidInput(format!("Absolute path not allowed: {}", path)));
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(Error::InvalidInput(format!("Path escapes tree: {}", path)));
            }
        }
    }

    if parts.is_empty() {
        return Err(Error::InvalidInput("Empty path".to_string()));
    }
    Ok(parts.join("/"))
}
