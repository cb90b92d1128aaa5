// src/registry/mod.rs

//! Package and version registry
//!
//! The registry owns every durable record (versions, packages, per-file
//! manifests) and the bytes under the storage root. A package moves
//! `Uploading -> Processing -> Available` only after its bytes are on disk
//! and verified; the status change and the version aggregate update commit
//! in one transaction.

mod ingest;
pub mod layout;
mod leases;
mod staging;

pub use ingest::{IngestedFile, extract_archive, scan_archive};
pub use layout::StorageLayout;
pub use leases::{LeaseGuard, PackageLeases};
pub use staging::{StagedUpload, UploadStaging};

use crate::config::default_allowed_extensions;
use crate::db::{
    self,
    models::{
        FileOperation, Package, PackageFile, PackageFilter, PackageKind,
        PackageStatus, Version,
    },
};
use crate::delta::{PatchEngine, PatchHeader, HEADER_LEN};
use crate::error::{Error, Result};
use crate::hash::{self, Hasher};
use crate::update::{FileEntry, Manifest};
use layout::{generate_file_name, is_tar_archive, matching_extension, sanitize_path, validate_segment};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Storage root
    pub root: PathBuf,
    /// Accepted package file extensions
    pub allowed_extensions: Vec<String>,
    /// Age after which an unfinished upload is considered abandoned
    pub upload_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowed_extensions: default_allowed_extensions(),
            upload_timeout: Duration::from_secs(3600),
        }
    }
}

/// A (version, platform, architecture) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub version: String,
    pub platform: String,
    #[serde(alias = "arch")]
    pub architecture: String,
}

impl VersionKey {
    pub fn new(version: &str, platform: &str, architecture: &str) -> Self {
        Self {
            version: version.to_string(),
            platform: platform.to_string(),
            architecture: architecture.to_string(),
        }
    }
}

fn default_operation() -> FileOperation {
    FileOperation::Add
}

/// A file entry supplied by the uploader alongside the package bytes
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredFile {
    pub path: String,
    pub size: u64,
    pub hash: String,
    #[serde(default = "default_operation")]
    pub operation: FileOperation,
}

/// Metadata of a package submission
#[derive(Debug, Clone)]
pub struct PackageUpload {
    pub key: VersionKey,
    pub kind: PackageKind,
    /// Original file name
    pub file_name: String,
    /// Source version, required for patches
    pub from_version: Option<String>,
    /// Hash the uploader claims for the bytes
    pub expected_hash: Option<String>,
    pub is_stable: Option<bool>,
    pub is_critical: Option<bool>,
    pub files: Vec<DeclaredFile>,
}

impl PackageUpload {
    pub fn new(key: VersionKey, kind: PackageKind, file_name: &str) -> Self {
        Self {
            key,
            kind,
            file_name: file_name.to_string(),
            from_version: None,
            expected_hash: None,
            is_stable: None,
            is_critical: None,
            files: Vec::new(),
        }
    }
}

/// Result of a package submission
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// New package stored and available
    Uploaded(Package),
    /// Identical content already available; carries the existing package
    Skipped(Package),
    /// Same name already available with different content; carries the existing package
    Conflict(Package),
}

impl UploadOutcome {
    pub fn package(&self) -> &Package {
        match self {
            UploadOutcome::Uploaded(p) | UploadOutcome::Skipped(p) | UploadOutcome::Conflict(p) => p,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Uploaded(_) => "uploaded",
            UploadOutcome::Skipped(_) => "skipped",
            UploadOutcome::Conflict(_) => "conflict",
        }
    }
}

/// One way to get from the caller's version to the latest
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOption {
    pub package_id: i64,
    pub kind: PackageKind,
    pub name: String,
    pub size: i64,
    pub content_hash: String,
    pub download_reference: String,
    pub from_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub has_update: bool,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub update_options: Vec<UpdateOption>,
}

/// A file of a version's tree, resolved on disk
#[derive(Debug, Clone)]
pub struct VersionFile {
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
    /// Package that provided the current bytes
    pub package_id: i64,
}

/// A cached per-file patch between two versions
#[derive(Debug, Clone)]
pub struct FilePatch {
    pub path: PathBuf,
    pub size: u64,
    pub old_hash: String,
    pub new_hash: String,
    /// Package whose bytes the target file came from
    pub package_id: i64,
}

/// Order version strings: semver when both parse, lexical otherwise
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| semver::Version::parse(s.trim_start_matches('v')).ok();
    match (parse(a), parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    config: Arc<RegistryConfig>,
    layout: StorageLayout,
    leases: PackageLeases,
}

impl Registry {
    /// Open (creating if needed) the registry at the configured root
    pub fn open(config: RegistryConfig) -> Result<Self> {
        let layout = StorageLayout::new(&config.root);
        layout.ensure_dirs()?;
        db::init(&layout.db_path())?;

        info!("Registry opened at {}", config.root.display());
        Ok(Self {
            config: Arc::new(config),
            layout,
            leases: PackageLeases::new(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn leases(&self) -> &PackageLeases {
        &self.leases
    }

    pub fn staging(&self) -> UploadStaging {
        UploadStaging::new(self.layout.clone())
    }

    /// Open a fresh database connection
    pub fn connection(&self) -> Result<Connection> {
        db::open(&self.layout.db_path())
    }

    /// Reject a submission before any I/O
    pub fn validate_upload(&self, upload: &PackageUpload) -> Result<()> {
        validate_segment("version", &upload.key.version)?;
        validate_segment("platform", &upload.key.platform)?;
        validate_segment("architecture", &upload.key.architecture)?;

        if upload.kind == PackageKind::Patch {
            match upload.from_version.as_deref() {
                None | Some("") => return Err(Error::MissingSourceVersion),
                Some(from) => validate_segment("from version", from)?,
            }
        }

        if upload.file_name.is_empty() {
            return Err(Error::InvalidInput("Missing file name".to_string()));
        }
        if matching_extension(&upload.file_name, &self.config.allowed_extensions).is_none() {
            return Err(Error::UnsupportedFileType(upload.file_name.clone()));
        }

        if let Some(expected) = &upload.expected_hash
            && !hash::is_valid_sha256(expected)
        {
            return Err(Error::InvalidInput(format!("Malformed content hash: {}", expected)));
        }

        let mut seen = HashSet::new();
        for file in &upload.files {
            let path = sanitize_path(&file.path)?;
            if !seen.insert(path.clone()) {
                return Err(Error::InvalidInput(format!("Duplicate file path: {}", path)));
            }
            if !hash::is_valid_sha256(&file.hash) {
                return Err(Error::InvalidInput(format!("Malformed hash for {}", path)));
            }
        }

        Ok(())
    }

    /// Store a package from a byte stream
    ///
    /// On integrity failure the bytes are removed, the package row ends up
    /// `Deleted` with the failure reason, and `ChecksumMismatch` is returned.
    pub fn register_package<R: Read>(&self, upload: &PackageUpload, reader: &mut R) -> Result<UploadOutcome> {
        self.validate_upload(upload)?;
        let mut conn = self.connection()?;

        if let Some(expected) = &upload.expected_hash
            && let Some(outcome) = self.match_existing(&conn, upload, &expected.to_ascii_lowercase(), None)?
        {
            info!(
                "Upload of {} resolved without transfer: {}",
                upload.file_name,
                outcome.as_str()
            );
            return Ok(outcome);
        }

        let stored_name = generate_file_name(&upload.key.platform, &upload.key.architecture, &upload.file_name);
        let location = format!(
            "{}/{}",
            self.layout.package_dir(upload.kind, &upload.key.version),
            stored_name
        );

        let mut package = db::transaction(&mut conn, |tx| {
            let version = Version::find_or_create(
                tx,
                &upload.key.version,
                &upload.key.platform,
                &upload.key.architecture,
            )?;
            let version_id = version
                .id
                .ok_or_else(|| Error::Internal("Version row without ID".to_string()))?;

            let mut package = Package::new(
                version_id,
                upload.kind,
                upload.file_name.clone(),
                stored_name.clone(),
                location.clone(),
            );
            package.from_version = upload.from_version.clone();
            package.insert(tx)?;
            Ok(package)
        })?;

        info!(
            "Receiving {} package {} for {}/{}/{}",
            upload.kind,
            upload.file_name,
            upload.key.version,
            upload.key.platform,
            upload.key.architecture
        );

        match self.receive(&mut conn, &mut package, upload, reader) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Upload of {} failed: {}", upload.file_name, e);
                self.abandon(&conn, &mut package, &e.to_string());
                Err(e)
            }
        }
    }

    /// Register a previously staged upload, discarding the staged file afterwards
    pub fn register_staged(&self, upload: &PackageUpload, staged_name: &str) -> Result<UploadOutcome> {
        let staging = self.staging();
        let path = staging.path(staged_name)?;
        let mut file = File::open(&path)
            .map_err(|_| Error::NotFoundError(format!("No staged upload named {}", staged_name)))?;

        let result = self.register_package(upload, &mut file);
        drop(file);

        match &result {
            Err(e) if e.is_retryable() => {}
            _ => {
                staging.discard(staged_name)?;
            }
        }
        result
    }

    fn receive<R: Read>(
        &self,
        conn: &mut Connection,
        package: &mut Package,
        upload: &PackageUpload,
        reader: &mut R,
    ) -> Result<UploadOutcome> {
        let path = self.layout.resolve(&package.storage_location);
        let (size, streamed_hash) = write_stream(reader, &path)?;
        package.set_content(conn, size as i64, &streamed_hash)?;
        package.update_status(conn, PackageStatus::Processing)?;

        self.verify_stored(package, &streamed_hash, upload.expected_hash.as_deref())?;

        if let Some(outcome) = self.match_existing(conn, upload, &streamed_hash, package.id)? {
            let reason = match &outcome {
                UploadOutcome::Skipped(existing) => {
                    format!("duplicate of package {}", existing.id.unwrap_or_default())
                }
                _ => format!("conflicts with an existing {}", upload.file_name),
            };
            self.abandon(conn, package, &reason);
            return Ok(outcome);
        }

        let files = self.collect_files(package, upload)?;
        let file_count = files.len().max(1) as i64;

        db::transaction(conn, |tx| {
            for file in &files {
                let mut row = PackageFile::new(
                    package.id.unwrap_or_default(),
                    file.path.clone(),
                    file.size as i64,
                    file.hash.clone(),
                    file.operation,
                );
                row.insert(tx)?;
            }
            package.update_status(tx, PackageStatus::Available)?;
            Version::add_aggregate(tx, package.version_id, package.size, file_count)?;
            if upload.is_stable.is_some() || upload.is_critical.is_some() {
                let version = Version::find_by_id(tx, package.version_id)?
                    .ok_or_else(|| Error::NotFoundError(format!("version {}", package.version_id)))?;
                Version::set_flags(
                    tx,
                    package.version_id,
                    upload.is_stable.unwrap_or(version.is_stable),
                    upload.is_critical.unwrap_or(version.is_critical),
                )?;
            }
            Ok(())
        })?;

        info!(
            "Package {} available: {} ({} bytes, {})",
            package.id.unwrap_or_default(),
            package.name,
            package.size,
            &package.content_hash[..12.min(package.content_hash.len())]
        );
        Ok(UploadOutcome::Uploaded(package.clone()))
    }

    /// Re-hash stored bytes and compare with the streamed and claimed hashes
    pub(crate) fn verify_stored(
        &self,
        package: &Package,
        streamed_hash: &str,
        expected: Option<&str>,
    ) -> Result<()> {
        let path = self.layout.resolve(&package.storage_location);
        let on_disk = hash::hash_file(&path)?;

        if on_disk != streamed_hash {
            return Err(Error::ChecksumMismatch {
                expected: streamed_hash.to_string(),
                actual: on_disk,
            });
        }
        if let Some(expected) = expected
            && expected.to_ascii_lowercase() != on_disk
        {
            return Err(Error::ChecksumMismatch {
                expected: expected.to_string(),
                actual: on_disk,
            });
        }
        Ok(())
    }

    /// Compare against available packages with the same version, kind and name
    fn match_existing(
        &self,
        conn: &Connection,
        upload: &PackageUpload,
        content_hash: &str,
        exclude: Option<i64>,
    ) -> Result<Option<UploadOutcome>> {
        let Some(version) = Version::find(
            conn,
            &upload.key.version,
            &upload.key.platform,
            &upload.key.architecture,
        )?
        else {
            return Ok(None);
        };
        let Some(version_id) = version.id else {
            return Ok(None);
        };

        let existing: Vec<Package> = Package::find_by_name(conn, version_id, upload.kind, &upload.file_name)?
            .into_iter()
            .filter(|p| p.id != exclude && p.status == PackageStatus::Available)
            .collect();

        if let Some(same) = existing.iter().find(|p| p.content_hash == content_hash) {
            return Ok(Some(UploadOutcome::Skipped(same.clone())));
        }
        Ok(existing.into_iter().next().map(UploadOutcome::Conflict))
    }

    /// Files to record for a package: unpacked archive contents or the declared list
    fn collect_files(&self, package: &Package, upload: &PackageUpload) -> Result<Vec<DeclaredFile>> {
        if package.kind != PackageKind::Patch && is_tar_archive(&package.name) {
            if !upload.files.is_empty() {
                debug!("Ignoring declared file list for archive {}", package.name);
            }
            let archive = self.layout.resolve(&package.storage_location);
            let tree = self.version_tree(package);
            let ingested = extract_archive(&archive, &tree, None)?;
            info!("Ingested {} files from {}", ingested.len(), package.name);
            return Ok(ingested
                .into_iter()
                .map(|f| DeclaredFile {
                    path: f.relative_path,
                    size: f.size,
                    hash: f.hash,
                    operation: FileOperation::Add,
                })
                .collect());
        }

        upload
            .files
            .iter()
            .map(|f| {
                Ok(DeclaredFile {
                    path: sanitize_path(&f.path)?,
                    size: f.size,
                    hash: f.hash.to_ascii_lowercase(),
                    operation: f.operation,
                })
            })
            .collect()
    }

    fn version_tree(&self, package: &Package) -> PathBuf {
        self.layout.resolve(&self.layout.version_files_dir(
            &package.platform,
            &package.architecture,
            &package.version,
        ))
    }

    /// Remove a failed upload's bytes and mark it deleted
    fn abandon(&self, conn: &Connection, package: &mut Package, reason: &str) {
        let path = self.layout.resolve(&package.storage_location);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
        if let Err(e) = package.mark_failed(conn, reason) {
            error!(
                "Failed to mark package {:?} deleted: {}",
                package.id, e
            );
        }
    }

    /// List packages (available only unless the filter says otherwise)
    pub fn list_packages(&self, filter: &PackageFilter) -> Result<Vec<Package>> {
        let conn = self.connection()?;
        Package::list(&conn, filter)
    }

    pub fn get_package(&self, id: i64) -> Result<Package> {
        let conn = self.connection()?;
        Package::find_by_id(&conn, id)?.ok_or_else(|| Error::NotFoundError(format!("package {}", id)))
    }

    pub fn find_version(&self, key: &VersionKey) -> Result<Version> {
        let conn = self.connection()?;
        Version::find(&conn, &key.version, &key.platform, &key.architecture)?.ok_or_else(|| {
            Error::NotFoundError(format!(
                "version {}/{}/{}",
                key.version, key.platform, key.architecture
            ))
        })
    }

    pub fn list_versions(&self) -> Result<Vec<Version>> {
        let conn = self.connection()?;
        Version::list_all(&conn)
    }

    /// File entries of a version's available packages
    pub fn get_files(&self, key: &VersionKey) -> Result<Vec<PackageFile>> {
        let version = self.find_version(key)?;
        let conn = self.connection()?;
        PackageFile::find_for_version(&conn, version.id.unwrap_or_default())
    }

    /// Effective file tree of a version: later packages override earlier ones
    fn version_file_index(conn: &Connection, version_id: i64) -> Result<BTreeMap<String, PackageFile>> {
        let mut index = BTreeMap::new();
        for file in PackageFile::find_for_version(conn, version_id)? {
            match file.operation {
                FileOperation::Delete => {
                    index.remove(&file.relative_path);
                }
                _ => {
                    index.insert(file.relative_path.clone(), file);
                }
            }
        }
        Ok(index)
    }

    /// Manifest of a version's file tree
    pub fn version_manifest(&self, key: &VersionKey) -> Result<Manifest> {
        let version = self.find_version(key)?;
        let conn = self.connection()?;
        let index = Self::version_file_index(&conn, version.id.unwrap_or_default())?;
        Ok(index
            .into_iter()
            .map(|(path, file)| (path, FileEntry::new(file.size as u64, file.content_hash)))
            .collect())
    }

    /// What a client at `current` should download
    pub fn check_update(&self, current: &str, platform: &str, architecture: &str) -> Result<UpdateCheck> {
        let conn = self.connection()?;
        let available = Package::list(
            &conn,
            &PackageFilter {
                platform: Some(platform.to_string()),
                architecture: Some(architecture.to_string()),
                ..Default::default()
            },
        )?;

        let latest = available
            .iter()
            .map(|p| p.version.as_str())
            .max_by(|a, b| compare_versions(a, b))
            .map(str::to_string);

        let has_update = latest
            .as_deref()
            .map(|l| compare_versions(l, current) == Ordering::Greater)
            .unwrap_or(false);

        let mut update_options = Vec::new();
        if let (true, Some(latest)) = (has_update, latest.as_deref()) {
            for package in available.iter().filter(|p| p.version == latest) {
                let wanted = match package.kind {
                    PackageKind::Full | PackageKind::Hotfix => true,
                    PackageKind::Patch => package.from_version.as_deref() == Some(current),
                };
                if wanted {
                    update_options.push(UpdateOption {
                        package_id: package.id.unwrap_or_default(),
                        kind: package.kind,
                        name: package.name.clone(),
                        size: package.size,
                        content_hash: package.content_hash.clone(),
                        download_reference: package.download_reference.clone(),
                        from_version: package.from_version.clone(),
                    });
                }
            }
            update_options.sort_by_key(|o| o.size);
        }

        Ok(UpdateCheck {
            has_update,
            current_version: current.to_string(),
            latest_version: latest,
            update_options,
        })
    }

    /// Exempt a version from (or return it to) retention cleanup
    pub fn set_version_protected(&self, key: &VersionKey, protected: bool) -> Result<()> {
        let version = self.find_version(key)?;
        let conn = self.connection()?;
        Version::set_protected(&conn, version.id.unwrap_or_default(), protected)?;
        info!(
            "Version {}/{}/{} protected = {}",
            key.version, key.platform, key.architecture, protected
        );
        Ok(())
    }

    /// Repair uploads left behind by a crash
    ///
    /// Packages stuck in `Uploading`/`Processing` longer than `timeout` lose
    /// their bytes and become `Deleted`. Meant for startup or an explicit
    /// operator run: a live upload older than `timeout` looks the same.
    pub fn reconcile(&self, timeout: Duration) -> Result<Vec<Package>> {
        let conn = self.connection()?;
        let age = chrono::Duration::from_std(timeout).map_err(|e| Error::InvalidInput(e.to_string()))?;
        let cutoff = db::format_timestamp(chrono::Utc::now() - age);

        let mut abandoned = Package::find_stale(&conn, &cutoff)?;
        for package in &mut abandoned {
            info!(
                "Reconciling abandoned upload {} ({})",
                package.id.unwrap_or_default(),
                package.name
            );
            self.abandon(&conn, package, "abandoned upload");
        }

        Ok(abandoned)
    }

    /// Record that a package's bytes are gone
    ///
    /// Sets `Deleted`, subtracts it from the version aggregates, and prunes
    /// extracted files no remaining package provides.
    pub fn retire_package(&self, package: &mut Package) -> Result<()> {
        let id = package
            .id
            .ok_or_else(|| Error::Internal("Package has no ID".to_string()))?;
        let mut conn = self.connection()?;
        let files = PackageFile::find_by_package(&conn, id)?;
        let counted = matches!(package.status, PackageStatus::Available | PackageStatus::Deprecated);
        let file_count = files.len().max(1) as i64;

        db::transaction(&mut conn, |tx| {
            package.update_status(tx, PackageStatus::Deleted)?;
            if counted {
                Version::add_aggregate(tx, package.version_id, -package.size, -file_count)?;
            }
            Ok(())
        })?;

        if !files.is_empty() {
            self.prune_version_tree(&conn, package, &files)?;
        }
        Ok(())
    }

    fn prune_version_tree(&self, conn: &Connection, package: &Package, files: &[PackageFile]) -> Result<()> {
        let tree = self.version_tree(package);
        let index = Self::version_file_index(conn, package.version_id)?;
        let mut restore: HashMap<i64, HashSet<String>> = HashMap::new();

        for file in files {
            let target = tree.join(&file.relative_path);
            match index.get(&file.relative_path) {
                None => {
                    if let Err(e) = fs::remove_file(&target)
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        warn!("Failed to remove {}: {}", target.display(), e);
                    }
                }
                Some(owner) if owner.content_hash != file.content_hash => {
                    restore
                        .entry(owner.package_id)
                        .or_default()
                        .insert(file.relative_path.clone());
                }
                Some(_) => {}
            }
        }

        for (owner_id, paths) in restore {
            let Some(owner) = Package::find_by_id(conn, owner_id)? else {
                continue;
            };
            let archive = self.layout.resolve(&owner.storage_location);
            debug!("Restoring {} files from package {}", paths.len(), owner_id);
            extract_archive(&archive, &tree, Some(&paths))?;
        }
        Ok(())
    }

    /// Bring a deleted package back after its bytes were restored
    pub fn restore_package(&self, package_id: i64, size: i64, content_hash: &str) -> Result<Package> {
        let mut conn = self.connection()?;
        let mut package = Package::find_by_id(&conn, package_id)?
            .ok_or_else(|| Error::NotFoundError(format!("package {}", package_id)))?;
        let files = PackageFile::find_by_package(&conn, package_id)?;
        let was_counted = matches!(package.status, PackageStatus::Available | PackageStatus::Deprecated);
        let file_count = files.len().max(1) as i64;
        let previous_size = package.size;

        db::transaction(&mut conn, |tx| {
            package.restore(tx, size, content_hash)?;
            if was_counted {
                Version::add_aggregate(tx, package.version_id, size - previous_size, 0)?;
            } else {
                Version::add_aggregate(tx, package.version_id, size, file_count)?;
            }
            Ok(())
        })?;

        if package.kind != PackageKind::Patch && is_tar_archive(&package.name) && !files.is_empty() {
            let archive = self.layout.resolve(&package.storage_location);
            extract_archive(&archive, &self.version_tree(&package), None)?;
        }

        info!("Package {} restored ({} bytes)", package_id, size);
        Ok(package)
    }

    /// Resolve one file of a version's tree
    pub fn resolve_version_file(&self, key: &VersionKey, relative_path: &str) -> Result<VersionFile> {
        let relative = sanitize_path(relative_path)?;
        let version = self.find_version(key)?;
        let conn = self.connection()?;
        let index = Self::version_file_index(&conn, version.id.unwrap_or_default())?;

        let entry = index.get(&relative).ok_or_else(|| {
            Error::NotFoundError(format!("{} in version {}", relative, key.version))
        })?;
        let path = self
            .layout
            .resolve(&self.layout.version_files_dir(&key.platform, &key.architecture, &key.version))
            .join(&relative);
        if !path.is_file() {
            return Err(Error::NotFoundError(format!("{} is missing on disk", relative)));
        }

        Ok(VersionFile {
            path,
            size: entry.size as u64,
            hash: entry.content_hash.clone(),
            package_id: entry.package_id,
        })
    }

    /// Resolve an available package by its storage location
    pub fn resolve_download(&self, location: &str) -> Result<(Package, PathBuf)> {
        let location = sanitize_path(location)?;
        let conn = self.connection()?;
        let package = Package::find_by_location(&conn, &location)?
            .filter(|p| p.status == PackageStatus::Available)
            .ok_or_else(|| Error::NotFoundError(location.clone()))?;
        let path = self.layout.resolve(&package.storage_location);
        Ok((package, path))
    }

    /// Patch turning `from`'s copy of a file into `to`'s, generated on first use
    pub fn file_patch(
        &self,
        platform: &str,
        architecture: &str,
        from: &str,
        to: &str,
        relative_path: &str,
    ) -> Result<FilePatch> {
        let (old, new, cache) = self.patch_sources(platform, architecture, from, to, relative_path)?;
        if !cached_patch_matches(&cache, &old.hash, &new.hash) {
            PatchEngine::default().create_patch_file(&old.path, &new.path, &cache)?;
        }
        finish_patch(cache, old, new)
    }

    /// Like [`Registry::file_patch`] but never generates; `None` when no
    /// up-to-date patch is cached
    pub fn cached_file_patch(
        &self,
        platform: &str,
        architecture: &str,
        from: &str,
        to: &str,
        relative_path: &str,
    ) -> Result<Option<FilePatch>> {
        let (old, new, cache) = self.patch_sources(platform, architecture, from, to, relative_path)?;
        if !cached_patch_matches(&cache, &old.hash, &new.hash) {
            return Ok(None);
        }
        finish_patch(cache, old, new).map(Some)
    }

    fn patch_sources(
        &self,
        platform: &str,
        architecture: &str,
        from: &str,
        to: &str,
        relative_path: &str,
    ) -> Result<(VersionFile, VersionFile, PathBuf)> {
        validate_segment("from version", from)?;
        validate_segment("to version", to)?;
        let old = self.resolve_version_file(&VersionKey::new(from, platform, architecture), relative_path)?;
        let new = self.resolve_version_file(&VersionKey::new(to, platform, architecture), relative_path)?;
        let relative = sanitize_path(relative_path)?;
        let cache = self
            .layout
            .resolve(&self.layout.patch_cache_path(platform, architecture, from, to, &relative));
        Ok((old, new, cache))
    }
}

fn finish_patch(cache: PathBuf, old: VersionFile, new: VersionFile) -> Result<FilePatch> {
    let size = fs::metadata(&cache)?.len();
    Ok(FilePatch {
        path: cache,
        size,
        old_hash: old.hash,
        new_hash: new.hash,
        package_id: new.package_id,
    })
}

fn cached_patch_matches(cache: &Path, old_hash: &str, new_hash: &str) -> bool {
    let mut header = [0u8; HEADER_LEN];
    let Ok(mut file) = File::open(cache) else {
        return false;
    };
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    match PatchHeader::decode(&header) {
        Ok(h) => h.old_hash_hex() == old_hash && h.new_hash_hex() == new_hash,
        Err(_) => false,
    }
}

/// Stream a reader to `path`, returning (bytes written, SHA-256)
fn write_stream<R: Read>(reader: &mut R, path: &Path) -> Result<(u64, String)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(path)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| Error::IoError(format!("Upload stream failed: {}", e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer
            .write_all(&buffer[..n])
            .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| Error::IoError(format!("Failed to flush {}: {}", path.display(), e)))?;
    file.sync_all()?;

    let size = hasher.bytes_hashed();
    Ok((size, hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ingest::tests::build_tar;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Registry) {
        let temp = TempDir::new().unwrap();
        let registry = Registry::open(RegistryConfig::new(temp.path())).unwrap();
        (temp, registry)
    }

    fn upload(version: &str, kind: PackageKind, name: &str) -> PackageUpload {
        PackageUpload::new(VersionKey::new(version, "windows", "x64"), kind, name)
    }

    fn uploaded(outcome: UploadOutcome) -> Package {
        match outcome {
            UploadOutcome::Uploaded(p) => p,
            other => panic!("expected upload, got {}", other.as_str()),
        }
    }

    #[test]
    fn test_validation_happens_before_io() {
        let (temp, registry) = registry();

        let mut patch = upload("2.0.0", PackageKind::Patch, "p.patch");
        assert!(matches!(
            registry.register_package(&patch, &mut &b"x"[..]),
            Err(Error::MissingSourceVersion)
        ));
        patch.from_version = Some("1.0.0".into());
        patch.file_name = "p.txt".into();
        assert!(matches!(
            registry.register_package(&patch, &mut &b"x"[..]),
            Err(Error::UnsupportedFileType(_))
        ));

        let conn = registry.connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM packages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(fs::read_dir(temp.path().join("packages")).unwrap().next().is_none());
    }

    #[test]
    fn test_register_updates_aggregates() {
        let (_temp, registry) = registry();
        let data = vec![1u8; 5000];
        let pkg = uploaded(
            registry
                .register_package(&upload("2.0.0", PackageKind::Full, "app.zip"), &mut data.as_slice())
                .unwrap(),
        );

        assert_eq!(pkg.status, PackageStatus::Available);
        assert_eq!(pkg.content_hash, hash::sha256(&data));
        assert!(pkg.storage_location.starts_with("packages/full/2.0.0/windows-x64-"));
        assert!(pkg.download_reference.starts_with("/download/packages/full/2.0.0/"));

        let version = registry
            .find_version(&VersionKey::new("2.0.0", "windows", "x64"))
            .unwrap();
        assert_eq!(version.total_size, 5000);
        assert_eq!(version.file_count, 1);
    }

    #[test]
    fn test_expected_hash_mismatch_is_integrity_error() {
        let (temp, registry) = registry();
        let mut up = upload("2.0.0", PackageKind::Full, "app.zip");
        up.expected_hash = Some(hash::sha256(b"something else"));

        let result = registry.register_package(&up, &mut &b"actual bytes"[..]);
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));

        let all = registry
            .list_packages(&PackageFilter {
                include_all: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, PackageStatus::Deleted);
        assert!(all[0].failure_reason.is_some());
        assert!(!temp.path().join(&all[0].storage_location).exists());
        assert!(registry.list_packages(&PackageFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_verify_detects_bytes_changed_after_write() {
        let (_temp, registry) = registry();
        let pkg = uploaded(
            registry
                .register_package(&upload("1.0.0", PackageKind::Full, "a.zip"), &mut &b"good"[..])
                .unwrap(),
        );
        fs::write(registry.layout().resolve(&pkg.storage_location), b"bad!").unwrap();

        assert!(matches!(
            registry.verify_stored(&pkg, &hash::sha256(b"good"), None),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_skipped_and_conflict_outcomes() {
        let (_temp, registry) = registry();
        let up = upload("1.0.0", PackageKind::Full, "app.zip");
        uploaded(registry.register_package(&up, &mut &b"v1"[..]).unwrap());

        let again = registry.register_package(&up, &mut &b"v1"[..]).unwrap();
        assert!(matches!(again, UploadOutcome::Skipped(_)));

        let different = registry.register_package(&up, &mut &b"v2"[..]).unwrap();
        assert!(matches!(different, UploadOutcome::Conflict(_)));

        let mut with_hash = up.clone();
        with_hash.expected_hash = Some(hash::sha256(b"v1"));
        let early = registry.register_package(&with_hash, &mut &b""[..]).unwrap();
        assert!(matches!(early, UploadOutcome::Skipped(_)));

        assert_eq!(registry.list_packages(&PackageFilter::default()).unwrap().len(), 1);
        let version = registry.find_version(&up.key).unwrap();
        assert_eq!(version.total_size, 2);
    }

    #[test]
    fn test_tar_ingestion_and_manifest() {
        let (temp, registry) = registry();
        let tar = build_tar(&[("bin/app", b"binary-v1"), ("data/config.json", b"{}")]);
        let key = VersionKey::new("1.0.0", "windows", "x64");

        uploaded(
            registry
                .register_package(&upload("1.0.0", PackageKind::Full, "app.tar"), &mut tar.as_slice())
                .unwrap(),
        );

        let manifest = registry.version_manifest(&key).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get("bin/app").unwrap().hash, hash::sha256(b"binary-v1"));
        assert!(temp.path().join("files/windows/x64/1.0.0/bin/app").exists());

        let file = registry.resolve_version_file(&key, "bin/app").unwrap();
        assert_eq!(file.size, 9);
        assert_eq!(registry.get_files(&key).unwrap().len(), 2);
        assert_eq!(registry.find_version(&key).unwrap().file_count, 2);
    }

    #[test]
    fn test_tar_with_escape_is_rejected() {
        let (_temp, registry) = registry();
        let tar = build_tar(&[("../../etc/passwd", b"x")]);
        let result = registry.register_package(&upload("1.0.0", PackageKind::Full, "evil.tar"), &mut tar.as_slice());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(registry.list_packages(&PackageFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_declared_paths_rejected() {
        let (_temp, registry) = registry();
        let mut up = upload("1.0.0", PackageKind::Hotfix, "fix.zip");
        let h = hash::sha256(b"x");
        up.files = vec![
            DeclaredFile { path: "a".into(), size: 1, hash: h.clone(), operation: FileOperation::Modify },
            DeclaredFile { path: "./a".into(), size: 1, hash: h, operation: FileOperation::Modify },
        ];
        assert!(matches!(
            registry.register_package(&up, &mut &b"x"[..]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_check_update_options() {
        let (_temp, registry) = registry();
        uploaded(registry.register_package(&upload("1.9.0", PackageKind::Full, "old.zip"), &mut &b"old"[..]).unwrap());
        uploaded(registry.register_package(&upload("2.0.0", PackageKind::Full, "new.zip"), &mut &b"new full"[..]).unwrap());

        let mut patch = upload("2.0.0", PackageKind::Patch, "from190.patch");
        patch.from_version = Some("1.9.0".into());
        uploaded(registry.register_package(&patch, &mut &b"p"[..]).unwrap());

        let mut other_patch = upload("2.0.0", PackageKind::Patch, "from180.patch");
        other_patch.from_version = Some("1.8.0".into());
        uploaded(registry.register_package(&other_patch, &mut &b"q"[..]).unwrap());

        let check = registry.check_update("1.9.0", "windows", "x64").unwrap();
        assert!(check.has_update);
        assert_eq!(check.latest_version.as_deref(), Some("2.0.0"));
        let kinds: Vec<_> = check.update_options.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![PackageKind::Patch, PackageKind::Full]);

        let current = registry.check_update("2.0.0", "windows", "x64").unwrap();
        assert!(!current.has_update);
        assert!(current.update_options.is_empty());

        let other = registry.check_update("1.0.0", "linux", "x64").unwrap();
        assert!(!other.has_update);
        assert!(other.latest_version.is_none());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("v2.0.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0.0-rc.1", "2.0.0"), Ordering::Less);
        assert_eq!(compare_versions("2024.10", "2024.9"), Ordering::Less);
    }

    #[test]
    fn test_reconcile_abandoned_uploads() {
        let (temp, registry) = registry();
        let conn = registry.connection().unwrap();
        let version = Version::find_or_create(&conn, "1.0.0", "windows", "x64").unwrap();
        let mut pkg = Package::new(
            version.id.unwrap(),
            PackageKind::Full,
            "a.zip".into(),
            "stored.zip".into(),
            "packages/full/1.0.0/stored.zip".into(),
        );
        pkg.insert(&conn).unwrap();
        fs::create_dir_all(temp.path().join("packages/full/1.0.0")).unwrap();
        fs::write(temp.path().join("packages/full/1.0.0/stored.zip"), b"partial").unwrap();

        assert!(registry.reconcile(Duration::from_secs(3600)).unwrap().is_empty());

        let repaired = registry.reconcile(Duration::ZERO).unwrap();
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].status, PackageStatus::Deleted);
        assert!(!temp.path().join("packages/full/1.0.0/stored.zip").exists());
    }

    #[test]
    fn test_retire_and_restore() {
        let (_temp, registry) = registry();
        let tar = build_tar(&[("bin/app", b"app")]);
        let key = VersionKey::new("1.0.0", "windows", "x64");
        let mut pkg = uploaded(
            registry
                .register_package(&upload("1.0.0", PackageKind::Full, "app.tar"), &mut tar.as_slice())
                .unwrap(),
        );
        let size = pkg.size;
        let content_hash = pkg.content_hash.clone();

        registry.retire_package(&mut pkg).unwrap();
        assert_eq!(pkg.status, PackageStatus::Deleted);
        assert_eq!(registry.find_version(&key).unwrap().total_size, 0);
        assert!(registry.resolve_version_file(&key, "bin/app").is_err());

        let restored = registry.restore_package(pkg.id.unwrap(), size, &content_hash).unwrap();
        assert_eq!(restored.status, PackageStatus::Available);
        assert_eq!(registry.find_version(&key).unwrap().total_size, size);
        assert!(registry.resolve_version_file(&key, "bin/app").is_ok());
    }

    #[test]
    fn test_file_patch_cached() {
        let (_temp, registry) = registry();
        let v1 = "line one\n".repeat(500);
        let v2 = format!("{}changed\n", "line one\n".repeat(499));
        for (version, body) in [("1.0.0", &v1), ("1.1.0", &v2)] {
            let tar = build_tar(&[("app.txt", body.as_bytes())]);
            uploaded(
                registry
                    .register_package(&upload(version, PackageKind::Full, "app.tar"), &mut tar.as_slice())
                    .unwrap(),
            );
        }

        let patch = registry.file_patch("windows", "x64", "1.0.0", "1.1.0", "app.txt").unwrap();
        assert_eq!(patch.new_hash, hash::sha256(v2.as_bytes()));
        let bytes = fs::read(&patch.path).unwrap();
        let rebuilt = PatchEngine::default().apply_patch(v1.as_bytes(), &bytes).unwrap();
        assert_eq!(rebuilt, v2.as_bytes());

        let again = registry.file_patch("windows", "x64", "1.0.0", "1.1.0", "app.txt").unwrap();
        assert_eq!(again.size, patch.size);
    }

    #[test]
    fn test_register_staged() {
        let (_temp, registry) = registry();
        let staging = registry.staging();
        staging.append("big.zip", 0, &mut &b"part1-"[..]).unwrap();
        staging.append("big.zip", 6, &mut &b"part2"[..]).unwrap();

        let pkg = uploaded(
            registry
                .register_staged(&upload("3.0.0", PackageKind::Full, "big.zip"), "big.zip")
                .unwrap(),
        );
        assert_eq!(pkg.content_hash, hash::sha256(b"part1-part2"));
        assert_eq!(staging.staged_size("big.zip").unwrap(), 0);
    }
}
