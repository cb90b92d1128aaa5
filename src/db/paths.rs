// src/db/paths.rs
//! Centralized path derivation for registry metadata

use std::path::{Path, PathBuf};

/// Database file name inside the metadata directory
pub const DB_FILE_NAME: &str = "deltaship.db";

/// Get the directory holding the database and lock files
pub fn metadata_dir(storage_root: &Path) -> PathBuf {
    storage_root.join("metadata")
}

/// Get the database path for a storage root
pub fn db_path(storage_root: &Path) -> PathBuf {
    metadata_dir(storage_root).join(DB_FILE_NAME)
}

/// Get the lock file serializing cleanup runs across processes
pub fn cleanup_lock_path(storage_root: &Path) -> PathBuf {
    metadata_dir(storage_root).join("cleanup.lock")
}

/// Get the directory containing a database file
pub fn db_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path() {
        assert_eq!(
            db_path(Path::new("/srv/updates")),
            PathBuf::from("/srv/updates/metadata/deltaship.db")
        );
    }

    #[test]
    fn test_db_dir() {
        assert_eq!(
            db_dir(Path::new("/srv/updates/metadata/deltaship.db")),
            PathBuf::from("/srv/updates/metadata")
        );
    }

    #[test]
    fn test_cleanup_lock_path() {
        assert_eq!(
            cleanup_lock_path(Path::new("/srv/updates")),
            PathBuf::from("/srv/updates/metadata/cleanup.lock")
        );
    }
}
