// src/commands/mod.rs
//! Command handlers for the deltaship CLI

mod patch;
mod storage;
mod transfer;
mod update;

pub use patch::{cmd_patch_apply, cmd_patch_create, cmd_patch_estimate};
pub use storage::{
    cmd_cleanup, cmd_health, cmd_init, cmd_protect, cmd_reconcile, cmd_retention, cmd_rollback,
};
pub use transfer::{DownloadArgs, UploadArgs, cmd_download, cmd_upload};
pub use update::{cmd_diff, cmd_manifest, cmd_plan};

use anyhow::{Context, Result};
use deltaship::config::EngineConfig;
use deltaship::lifecycle::StorageLifecycleManager;
use deltaship::registry::Registry;
use deltaship::update::{Manifest, UpdatePlanner};
use std::path::{Path, PathBuf};

/// Configuration file read when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/deltaship/deltaship.toml";

/// Load the engine configuration, applying the `--root` override
pub fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            EngineConfig::load(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => EngineConfig::default(),
    };
    if let Some(root) = root {
        config.storage.root = root;
        config.validate()?;
    }
    Ok(config)
}

/// Open the registry described by the configuration
pub fn open_registry(config: &EngineConfig) -> Result<Registry> {
    let registry = Registry::open(config.registry_config()?)
        .with_context(|| format!("Failed to open storage at {}", config.storage_root().display()))?;
    Ok(registry)
}

/// Open the registry and its lifecycle manager
pub fn open_lifecycle(config: &EngineConfig) -> Result<StorageLifecycleManager> {
    let registry = open_registry(config)?;
    Ok(StorageLifecycleManager::new(registry, config.lifecycle_config()?)?)
}

pub fn planner(config: &EngineConfig) -> Result<UpdatePlanner> {
    Ok(UpdatePlanner::new(config.planner_config()?))
}

/// Manifest of a directory, or a saved manifest file
pub fn read_tree(path: &Path) -> Result<Manifest> {
    let manifest = if path.is_dir() {
        Manifest::from_dir(path)?
    } else {
        Manifest::load(path)?
    };
    Ok(manifest)
}

/// Print a value as pretty JSON
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format a byte count for humans
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_load_config_with_root_override() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("deltaship.toml");
        std::fs::write(
            &config_path,
            "[storage]\nroot = \"/nonexistent\"\ncapacity = \"1GB\"\n",
        )
        .unwrap();

        let config = load_config(Some(&config_path), Some(temp.path().join("store"))).unwrap();
        assert_eq!(config.storage_root(), temp.path().join("store"));
        assert_eq!(config.storage.capacity.as_deref(), Some("1GB"));
    }

    #[test]
    fn test_read_tree_from_dir_and_file() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("bin")).unwrap();
        std::fs::write(tree.join("bin/app"), b"binary").unwrap();

        let from_dir = read_tree(&tree).unwrap();
        assert!(from_dir.contains("bin/app"));

        let saved = temp.path().join("manifest.json");
        from_dir.save(&saved).unwrap();
        assert_eq!(read_tree(&saved).unwrap(), from_dir);
    }
}
