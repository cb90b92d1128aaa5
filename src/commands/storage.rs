// src/commands/storage.rs
//! Storage operator commands: health, cleanup, retention and repair

use super::{format_bytes, open_registry, print_json};
use anyhow::{Result, bail};
use deltaship::config::EngineConfig;
use deltaship::db::models::{CleanupRecord, PackageKind};
use deltaship::lifecycle::StorageLifecycleManager;
use deltaship::registry::{Registry, VersionKey};
use tracing::info;

/// Create the storage layout and database
pub fn cmd_init(config: &EngineConfig) -> Result<()> {
    let registry = open_registry(config)?;
    let layout = registry.layout();
    println!("Initialized storage at {}", layout.root().display());
    println!("  database: {}", layout.db_path().display());
    println!("  packages: {}", layout.packages_dir().display());
    println!("  backups:  {}", layout.backups_dir().display());
    Ok(())
}

pub fn cmd_health(lifecycle: &StorageLifecycleManager, json: bool) -> Result<()> {
    let report = lifecycle.check_health()?;
    if json {
        return print_json(&report);
    }

    println!("Status: {}", report.status);
    println!(
        "Usage:  {} of {} ({:.1}%), {} available",
        format_bytes(report.used_bytes),
        format_bytes(report.total_bytes),
        report.usage_ratio * 100.0,
        format_bytes(report.available_bytes)
    );
    for (kind, bytes) in &report.bytes_by_kind {
        println!("  {:<7} {}", kind, format_bytes((*bytes).max(0) as u64));
    }
    println!(
        "Retention: full {}, patch {}, hotfix {}",
        report.retention.max_full, report.retention.max_patch, report.retention.max_hotfix
    );
    if let Some(last) = &report.last_cleanup {
        println!(
            "Last cleanup: {} ({}, {} freed)",
            last.started_at,
            last.status.as_str(),
            format_bytes(last.bytes_freed.max(0) as u64)
        );
    }
    for advice in &report.recommendations {
        println!("  * {}", advice);
    }
    Ok(())
}

pub fn cmd_cleanup(lifecycle: &StorageLifecycleManager, reason: &str, history: bool) -> Result<()> {
    if history {
        let records = lifecycle.cleanup_history(20)?;
        if records.is_empty() {
            println!("No cleanup runs recorded");
        }
        for record in &records {
            print_record_line(record);
        }
        return Ok(());
    }

    info!("Starting cleanup ({})", reason);
    let record = lifecycle.run_cleanup(reason)?;
    print_record_line(&record);
    for item in &record.items {
        match &item.error {
            Some(error) => println!("  ! {} {}: {}", item.step.as_str(), item.path, error),
            None => println!(
                "  - {} {} ({})",
                item.step.as_str(),
                item.path,
                format_bytes(item.bytes.max(0) as u64)
            ),
        }
    }
    if let Some(error) = &record.error {
        bail!("Cleanup failed: {}", error);
    }
    Ok(())
}

fn print_record_line(record: &CleanupRecord) {
    let after = record
        .usage_after
        .map(|ratio| format!("{:.1}%", ratio * 100.0))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "#{} {} [{}] {}: {:.1}% -> {}, {} freed",
        record.id.unwrap_or_default(),
        record.started_at,
        record.trigger_reason,
        record.status.as_str(),
        record.usage_before * 100.0,
        after,
        format_bytes(record.bytes_freed.max(0) as u64)
    );
}

pub fn cmd_retention(
    lifecycle: &StorageLifecycleManager,
    kind: Option<&str>,
    max_versions: Option<u32>,
) -> Result<()> {
    let policy = match (kind, max_versions) {
        (Some(kind), Some(max)) => {
            let kind = PackageKind::parse(kind)?;
            let policy = lifecycle.configure_retention(kind, max)?;
            println!("Keeping {} {} versions", max, kind.as_str());
            policy
        }
        (Some(kind), None) => {
            let kind = PackageKind::parse(kind)?;
            let policy = lifecycle.retention_policy()?;
            println!("{}: {}", kind.as_str(), policy.limit_for(kind));
            return Ok(());
        }
        (None, _) => lifecycle.retention_policy()?,
    };

    for kind in PackageKind::ALL {
        println!("  {:<7} {}", kind.as_str(), policy.limit_for(kind));
    }
    Ok(())
}

pub fn cmd_rollback(lifecycle: &StorageLifecycleManager, package_id: i64) -> Result<()> {
    let package = lifecycle.rollback(package_id)?;
    println!(
        "Restored package {} ({} {} for {}/{})",
        package_id, package.kind.as_str(), package.version, package.platform, package.architecture
    );
    println!("  download: {}", package.download_reference);
    Ok(())
}

pub fn cmd_reconcile(lifecycle: &StorageLifecycleManager) -> Result<()> {
    let registry = lifecycle.registry();
    let repaired = registry.reconcile(registry.config().upload_timeout)?;
    let interrupted = lifecycle.recover_interrupted()?;
    if repaired.is_empty() && interrupted == 0 {
        println!("Nothing to reconcile");
    }
    if interrupted > 0 {
        println!("  {} interrupted cleanup runs marked failed", interrupted);
    }
    for package in &repaired {
        println!(
            "  {} {} {}: {}",
            package.id.unwrap_or_default(),
            package.version,
            package.name,
            package.status.as_str()
        );
    }
    Ok(())
}

pub fn cmd_protect(
    registry: &Registry,
    version: &str,
    platform: &str,
    arch: &str,
    unprotect: bool,
) -> Result<()> {
    let key = VersionKey::new(version, platform, arch);
    registry.set_version_protected(&key, !unprotect)?;
    if unprotect {
        println!("{} {}/{} is subject to retention again", version, platform, arch);
    } else {
        println!("{} {}/{} is protected from retention", version, platform, arch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::open_lifecycle;
    use tempfile::TempDir;

    #[test]
    fn test_init_and_retention() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::with_root(temp.path().join("store"));
        cmd_init(&config).unwrap();
        assert!(temp.path().join("store/metadata/deltaship.db").exists());

        let lifecycle = open_lifecycle(&config).unwrap();
        cmd_retention(&lifecycle, Some("hotfix"), Some(2)).unwrap();
        assert_eq!(lifecycle.retention_policy().unwrap().max_hotfix, 2);

        assert!(cmd_retention(&lifecycle, Some("hotfix"), Some(0)).is_err());
        assert!(cmd_retention(&lifecycle, Some("nightly"), Some(3)).is_err());
    }

    #[test]
    fn test_protect_unknown_version_fails() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::with_root(temp.path());
        let registry = open_registry(&config).unwrap();
        assert!(cmd_protect(&registry, "9.9.9", "linux", "x64", false).is_err());
    }
}
