// tests/common/mod.rs

//! Shared helpers for integration tests.

#![allow(dead_code)]

use deltaship::db::models::{Package, PackageKind};
use deltaship::lifecycle::{LifecycleConfig, QuotaProbe, StorageLifecycleManager};
use deltaship::registry::{PackageUpload, Registry, RegistryConfig, UploadOutcome, VersionKey};
use std::sync::Arc;
use tempfile::TempDir;

pub const PLATFORM: &str = "linux";
pub const ARCH: &str = "x64";

/// A storage root with a registry and a lifecycle manager over a fixed quota.
///
/// Keep the struct alive; dropping it removes the root.
pub struct TestStore {
    pub temp: TempDir,
    pub lifecycle: StorageLifecycleManager,
}

impl TestStore {
    pub fn new(capacity: u64) -> Self {
        let temp = TempDir::new().unwrap();
        let registry = Registry::open(RegistryConfig::new(temp.path())).unwrap();
        let lifecycle = with_capacity(&registry, capacity);
        Self { temp, lifecycle }
    }

    pub fn registry(&self) -> &Registry {
        self.lifecycle.registry()
    }

    /// Register a package and run the post-upload lifecycle check
    pub fn publish(&self, upload: &PackageUpload, bytes: &[u8]) -> Package {
        let outcome = self
            .registry()
            .register_package(upload, &mut &bytes[..])
            .unwrap();
        match outcome {
            UploadOutcome::Uploaded(package) => {
                self.lifecycle.after_upload(&package).unwrap();
                package
            }
            other => panic!("unexpected outcome {}", other.as_str()),
        }
    }

    /// Publish a full tar archive holding `files`
    pub fn publish_tree(&self, version: &str, files: &[(&str, &[u8])]) -> Package {
        let upload = PackageUpload::new(
            VersionKey::new(version, PLATFORM, ARCH),
            PackageKind::Full,
            "app.tar",
        );
        self.publish(&upload, &build_tar(files))
    }
}

/// Lifecycle manager for an existing registry with a different quota
pub fn with_capacity(registry: &Registry, capacity: u64) -> StorageLifecycleManager {
    let probe = Arc::new(QuotaProbe::new(registry.layout().root(), capacity));
    StorageLifecycleManager::with_probe(registry.clone(), LifecycleConfig::default(), probe).unwrap()
}

pub fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Text large enough to be worth patching
pub fn patchable(seed: &str) -> Vec<u8> {
    format!("{seed} configuration line\n").repeat(400).into_bytes()
}
