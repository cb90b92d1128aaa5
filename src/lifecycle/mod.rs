// src/lifecycle/mod.rs

//! Storage lifecycle manager
//!
//! Keeps disk usage bounded. A cleanup run works through fixed steps:
//!
//! 1. temp files older than `temp_max_age` (and expired backups)
//! 2. hotfix packages beyond the hotfix retention limit
//! 3. patch packages beyond the patch retention limit
//! 4. full packages beyond the full retention limit, only while usage is
//!    still at or above the cleanup threshold
//!
//! Every trimmed package is backed up (two-phase, see [`backup`]) before its
//! bytes are removed and its status becomes `Deleted`. Runs are single-flight:
//! an in-process mutex plus an exclusive lock file shared with CLI runs.

pub mod backup;
pub mod health;
pub mod probe;
pub mod retention;

pub use backup::{BackupStore, StagedBackup};
pub use health::{HealthReport, HealthStatus, HealthThresholds};
pub use probe::{QuotaProbe, StatvfsProbe, StorageProbe, StorageUsage};
pub use retention::RetentionPolicy;

use crate::db::models::{
    CleanupItem, CleanupRecord, CleanupStatus, CleanupStep, Package, PackageKind, PackageStatus,
    RetentionSetting, StorageSnapshot,
};
use crate::error::{Error, Result};
use crate::hash;
use crate::registry::Registry;
use fs2::FileExt;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Lifecycle manager settings
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub thresholds: HealthThresholds,
    /// Limits used for kinds without a stored override
    pub default_retention: RetentionPolicy,
    pub temp_max_age: Duration,
    pub backup_max_age: Duration,
    /// Fixed capacity; filesystem statistics are used when `None`
    pub capacity: Option<u64>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            default_retention: RetentionPolicy::default(),
            temp_max_age: Duration::from_secs(24 * 60 * 60),
            backup_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            capacity: None,
        }
    }
}

#[derive(Clone)]
pub struct StorageLifecycleManager {
    registry: Registry,
    config: Arc<LifecycleConfig>,
    probe: Arc<dyn StorageProbe>,
    backups: BackupStore,
    running: Arc<Mutex<()>>,
}

impl StorageLifecycleManager {
    /// Create a manager with the probe implied by the configuration
    pub fn new(registry: Registry, config: LifecycleConfig) -> Result<Self> {
        let root = registry.layout().root().to_path_buf();
        let probe: Arc<dyn StorageProbe> = match config.capacity {
            Some(capacity) => Arc::new(QuotaProbe::new(root, capacity)),
            None => Arc::new(StatvfsProbe::new(root)),
        };
        Self::with_probe(registry, config, probe)
    }

    pub fn with_probe(
        registry: Registry,
        config: LifecycleConfig,
        probe: Arc<dyn StorageProbe>,
    ) -> Result<Self> {
        config.thresholds.validate()?;
        let backups = BackupStore::new(registry.layout().clone());
        Ok(Self {
            registry,
            config: Arc::new(config),
            probe,
            backups,
            running: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn usage(&self) -> Result<StorageUsage> {
        self.probe.usage()
    }

    /// Current health; reads only
    pub fn check_health(&self) -> Result<HealthReport> {
        let usage = self.probe.usage()?;
        let status = self.config.thresholds.classify(usage.ratio());
        let conn = self.registry.connection()?;

        let bytes_by_kind: BTreeMap<String, i64> = Package::bytes_by_kind(&conn)?
            .into_iter()
            .map(|(kind, bytes)| (kind.as_str().to_string(), bytes))
            .collect();
        let last_cleanup = CleanupRecord::list_recent(&conn, 1)?.into_iter().next();

        Ok(HealthReport {
            status,
            total_bytes: usage.total,
            used_bytes: usage.used,
            available_bytes: usage.available,
            usage_ratio: usage.ratio(),
            thresholds: self.config.thresholds,
            bytes_by_kind,
            retention: self.retention_policy()?,
            last_cleanup,
            recommendations: health::recommendations(status, &usage, &self.config.thresholds),
        })
    }

    /// Persist a usage snapshot
    pub fn record_snapshot(&self, reason: &str) -> Result<StorageSnapshot> {
        let usage = self.probe.usage()?;
        let conn = self.registry.connection()?;
        let mut snapshot = StorageSnapshot::new(usage.total, usage.used, reason);
        for (kind, bytes) in Package::bytes_by_kind(&conn)? {
            match kind {
                PackageKind::Full => snapshot.full_bytes = bytes,
                PackageKind::Patch => snapshot.patch_bytes = bytes,
                PackageKind::Hotfix => snapshot.hotfix_bytes = bytes,
            }
        }
        snapshot.insert(&conn)?;
        Ok(snapshot)
    }

    pub fn snapshots(&self, limit: usize) -> Result<Vec<StorageSnapshot>> {
        let conn = self.registry.connection()?;
        StorageSnapshot::list_recent(&conn, limit)
    }

    /// Effective retention limits
    pub fn retention_policy(&self) -> Result<RetentionPolicy> {
        let conn = self.registry.connection()?;
        RetentionPolicy::load(&conn, self.config.default_retention)
    }

    /// Change a kind's retention limit; later cleanup runs use it
    pub fn configure_retention(&self, kind: PackageKind, max_versions: u32) -> Result<RetentionPolicy> {
        retention::validate_limit(max_versions)?;
        let conn = self.registry.connection()?;
        RetentionSetting::set(&conn, kind, max_versions)?;
        info!("Retention for {} packages set to {}", kind, max_versions);
        RetentionPolicy::load(&conn, self.config.default_retention)
    }

    pub fn cleanup_history(&self, limit: usize) -> Result<Vec<CleanupRecord>> {
        let conn = self.registry.connection()?;
        CleanupRecord::list_recent(&conn, limit)
    }

    pub fn get_cleanup(&self, id: i64) -> Result<CleanupRecord> {
        let conn = self.registry.connection()?;
        CleanupRecord::find_by_id(&conn, id)?
            .ok_or_else(|| Error::NotFoundError(format!("cleanup run {}", id)))
    }

    /// Run a cleanup, rejecting the call if another run is in progress
    pub fn run_cleanup(&self, trigger: &str) -> Result<CleanupRecord> {
        let Some(_guard) = self.running.try_lock() else {
            return Err(Error::CleanupInProgress);
        };
        let _lock = self.acquire_lock_file()?;

        // Limits are read once; later reconfiguration affects the next run
        let policy = self.retention_policy()?;
        let usage_before = self.probe.usage()?;
        let conn = self.registry.connection()?;
        let mut record = CleanupRecord::start(&conn, trigger, usage_before.ratio())?;
        let cleanup_id = record
            .id
            .ok_or_else(|| Error::Internal("Cleanup record without ID".to_string()))?;

        info!(
            "Cleanup {} started ({}), usage {:.1}%",
            cleanup_id,
            trigger,
            usage_before.ratio() * 100.0
        );

        let mut run = CleanupRun {
            conn: &conn,
            cleanup_id,
            freed: 0,
            items: Vec::new(),
        };

        match self.execute_steps(&mut run, &policy) {
            Ok(()) => {
                let usage_after = self.probe.usage()?;
                let freed = run.freed;
                record.items = run.items;
                record.finish(&conn, CleanupStatus::Completed, usage_after.ratio(), freed, None)?;
                if let Err(e) = self.record_snapshot("cleanup") {
                    warn!("Failed to record snapshot after cleanup: {}", e);
                }

                let failures = record.items.iter().filter(|i| i.error.is_some()).count();
                info!(
                    "Cleanup {} completed: {} items, {} failed, {} bytes freed, usage {:.1}%",
                    cleanup_id,
                    record.items.len(),
                    failures,
                    freed,
                    usage_after.ratio() * 100.0
                );
                Ok(record)
            }
            Err(e) => {
                error!("Cleanup {} aborted: {}", cleanup_id, e);
                let usage_after = self.probe.usage().map(|u| u.ratio()).unwrap_or(usage_before.ratio());
                let freed = run.freed;
                if let Err(finish_err) =
                    record.finish(&conn, CleanupStatus::Failed, usage_after, freed, Some(e.to_string()))
                {
                    error!("Failed to record cleanup failure: {}", finish_err);
                }
                Err(e)
            }
        }
    }

    /// Close cleanup records a crashed run left `running`
    ///
    /// Skipped (returns 0) while any run holds the cleanup lock, in this
    /// process or another.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let Some(_guard) = self.running.try_lock() else {
            return Ok(0);
        };
        let _lock = match self.acquire_lock_file() {
            Ok(lock) => lock,
            Err(Error::CleanupInProgress) => return Ok(0),
            Err(e) => return Err(e),
        };

        let conn = self.registry.connection()?;
        let interrupted = CleanupRecord::fail_interrupted(&conn)?;
        if interrupted > 0 {
            warn!("Marked {} interrupted cleanup runs as failed", interrupted);
        }
        Ok(interrupted)
    }

    fn acquire_lock_file(&self) -> Result<File> {
        let path = self.registry.layout().cleanup_lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::CleanupInProgress),
            Err(e) => Err(Error::IoError(format!("Failed to lock {}: {}", path.display(), e))),
        }
    }

    fn execute_steps(&self, run: &mut CleanupRun<'_>, policy: &RetentionPolicy) -> Result<()> {
        self.sweep_temp(run)?;
        self.trim_kind(run, PackageKind::Hotfix, policy.max_hotfix)?;
        self.trim_kind(run, PackageKind::Patch, policy.max_patch)?;

        let usage = self.probe.usage()?;
        if usage.ratio() >= self.config.thresholds.cleanup {
            self.trim_kind(run, PackageKind::Full, policy.max_full)?;
        } else {
            debug!(
                "Usage {:.1}% below cleanup threshold, keeping full packages",
                usage.ratio() * 100.0
            );
        }
        Ok(())
    }

    /// Step 1: stale temp files, expired backups, interrupted backup copies
    fn sweep_temp(&self, run: &mut CleanupRun<'_>) -> Result<()> {
        let layout = self.registry.layout();

        for path in self.backups.recover_staged() {
            debug!("Removed interrupted backup {}", path.display());
        }

        let temp_dir = layout.temp_dir();
        let mut stale = Vec::new();
        if let Some(cutoff) = SystemTime::now().checked_sub(self.config.temp_max_age)
            && temp_dir.exists()
        {
            for entry in WalkDir::new(&temp_dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                if meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                    stale.push((entry.path().to_path_buf(), meta.len()));
                }
            }
        }
        stale.extend(self.backups.expired(self.config.backup_max_age));

        for (path, size) in stale {
            let mut item = CleanupItem::new(CleanupStep::Temp, None, layout.relative(&path), size as i64);
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed stale file {}", path.display());
                    run.freed += size as i64;
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    item.error = Some(e.to_string());
                }
            }
            run.record(item)?;
        }
        Ok(())
    }

    /// Steps 2-4: trim one kind to its retention limit in every group
    fn trim_kind(&self, run: &mut CleanupRun<'_>, kind: PackageKind, limit: u32) -> Result<()> {
        let step = match kind {
            PackageKind::Full => CleanupStep::Full,
            PackageKind::Patch => CleanupStep::Patch,
            PackageKind::Hotfix => CleanupStep::Hotfix,
        };

        for (platform, architecture) in Package::groups_for_kind(run.conn, kind)? {
            let group = Package::available_in_group(run.conn, &platform, &architecture, kind)?;
            let excess = retention::select_excess(group, limit);
            if excess.is_empty() {
                continue;
            }
            info!(
                "Trimming {} {} packages for {}/{} (limit {})",
                excess.len(),
                kind,
                platform,
                architecture,
                limit
            );

            for package in excess {
                let item = self.remove_package(package, step);
                if item.error.is_none() {
                    run.freed += item.bytes;
                }
                run.record(item)?;
            }
        }
        Ok(())
    }

    /// Back up then delete one package; failures land on the item
    fn remove_package(&self, mut package: Package, step: CleanupStep) -> CleanupItem {
        let mut item = CleanupItem::new(
            step,
            package.id,
            package.storage_location.clone(),
            package.size,
        );
        let Some(id) = package.id else {
            item.error = Some("package has no ID".to_string());
            return item;
        };

        let Some(_claim) = self.registry.leases().try_claim(id) else {
            debug!("Package {} is in use, skipping", id);
            item.error = Some("package is in use".to_string());
            return item;
        };

        let layout = self.registry.layout();
        let source = layout.resolve(&package.storage_location);

        let mut backup_file = None;
        if source.exists() {
            match self
                .backups
                .backup_verified(&source, &package.file_name, &package.content_hash)
            {
                Ok(backup) => {
                    item.backup_path = Some(layout.relative(&backup));
                    backup_file = Some(backup);
                }
                Err(e) => {
                    warn!("Backup of package {} failed: {}", id, e);
                    item.error = Some(format!("backup failed: {}", e));
                    return item;
                }
            }
            if let Err(e) = fs::remove_file(&source) {
                warn!("Failed to delete package {}: {}", id, e);
                item.error = Some(format!("delete failed: {}", e));
                return item;
            }
        } else {
            warn!(
                "Package {} bytes already missing at {}",
                id,
                source.display()
            );
        }

        if let Err(e) = self.registry.retire_package(&mut package) {
            warn!("Failed to retire package {}: {}", id, e);
            item.error = Some(format!("status update failed: {}", e));
            // A record that is still live must keep its bytes
            let committed = self
                .registry
                .get_package(id)
                .is_ok_and(|p| p.status == PackageStatus::Deleted);
            if !committed
                && let Some(backup) = &backup_file
                && let Err(restore_err) = fs::copy(backup, &source)
            {
                error!(
                    "Failed to put back package {} from {}: {}",
                    id,
                    backup.display(),
                    restore_err
                );
            }
            return item;
        }

        info!(
            "Removed {} package {} ({} {} bytes)",
            package.kind, id, package.name, package.size
        );
        item
    }

    /// Restore a package's bytes from its most recent backup
    pub fn rollback(&self, package_id: i64) -> Result<Package> {
        let package = self.registry.get_package(package_id)?;
        if matches!(package.status, PackageStatus::Uploading | PackageStatus::Processing) {
            return Err(Error::InvalidInput(format!(
                "Package {} is still being uploaded",
                package_id
            )));
        }

        let _claim = self
            .registry
            .leases()
            .try_claim(package_id)
            .ok_or(Error::PackageInUse(package_id))?;

        let layout = self.registry.layout();
        let conn = self.registry.connection()?;
        let backup = self
            .recorded_backup(&conn, package_id)?
            .or_else(|| self.backups.find_latest(&package.file_name))
            .ok_or_else(|| Error::NoBackupFound(package.name.clone()))?;

        let target = layout.resolve(&package.storage_location);
        if target.exists() {
            let staged = self.backups.stage(&target, &package.file_name)?;
            let saved = staged.commit()?;
            info!("Saved current bytes of package {} to {}", package_id, saved.display());
        }

        restore_file(&backup, &target)?;
        let size = fs::metadata(&target)?.len() as i64;
        let content_hash = hash::hash_file(&target)?;

        let restored = self.registry.restore_package(package_id, size, &content_hash)?;
        info!(
            "Rolled back package {} from {}",
            package_id,
            backup.display()
        );
        Ok(restored)
    }

    fn recorded_backup(&self, conn: &Connection, package_id: i64) -> Result<Option<std::path::PathBuf>> {
        let layout = self.registry.layout();
        Ok(CleanupItem::latest_backup_for(conn, package_id)?
            .map(|rel| layout.resolve(&rel))
            .filter(|path| path.is_file()))
    }

    /// Record a snapshot after an upload and clean up when usage or the
    /// package's group calls for it
    pub fn after_upload(&self, package: &Package) -> Result<Option<CleanupRecord>> {
        let snapshot = self.record_snapshot("upload")?;

        let policy = self.retention_policy()?;
        let conn = self.registry.connection()?;
        let group = Package::available_in_group(&conn, &package.platform, &package.architecture, package.kind)?;
        let over_limit = !retention::select_excess(group, policy.limit_for(package.kind)).is_empty();
        let over_threshold = snapshot.usage_ratio >= self.config.thresholds.cleanup;

        if !over_limit && !over_threshold {
            return Ok(None);
        }

        let trigger = if over_threshold { "usage threshold" } else { "retention limit" };
        match self.run_cleanup(trigger) {
            Ok(record) => Ok(Some(record)),
            Err(Error::CleanupInProgress) => {
                debug!("Post-upload cleanup skipped, another run is active");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Make room for `incoming` bytes or fail with `StorageExhausted`
    pub fn ensure_capacity(&self, incoming: u64) -> Result<()> {
        let usage = self.probe.usage()?;
        if usage.projected_ratio(incoming) < self.config.thresholds.critical {
            return Ok(());
        }

        warn!(
            "Upload of {} bytes would reach {:.1}%, running emergency cleanup",
            incoming,
            usage.projected_ratio(incoming) * 100.0
        );
        match self.run_cleanup("emergency") {
            Ok(_) | Err(Error::CleanupInProgress) => {}
            Err(e) => warn!("Emergency cleanup failed: {}", e),
        }

        let usage = self.probe.usage()?;
        if usage.projected_ratio(incoming) >= self.config.thresholds.critical {
            return Err(Error::StorageExhausted {
                used: usage.used,
                total: usage.total,
                requested: incoming,
            });
        }
        Ok(())
    }
}

/// Per-run bookkeeping
struct CleanupRun<'a> {
    conn: &'a Connection,
    cleanup_id: i64,
    freed: i64,
    items: Vec<CleanupItem>,
}

impl CleanupRun<'_> {
    fn record(&mut self, mut item: CleanupItem) -> Result<()> {
        item.insert(self.conn, self.cleanup_id)?;
        self.items.push(item);
        Ok(())
    }
}

fn restore_file(backup: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = target.with_extension("restore-tmp");
    fs::copy(backup, &temp)
        .map_err(|e| Error::IoError(format!("Failed to copy {}: {}", backup.display(), e)))?;
    fs::rename(&temp, target)
        .map_err(|e| Error::IoError(format!("Failed to restore {}: {}", target.display(), e)))?;
    Ok(())
}
