// tests/transfer_resume.rs

//! Interrupted transfers pick up where they stopped against a real registry.

mod common;

use async_trait::async_trait;
use common::{ARCH, PLATFORM, TestStore, patchable};
use deltaship::db::models::{PackageKind, PackageStatus};
use deltaship::hash;
use deltaship::registry::{PackageUpload, StagedUpload, UploadOutcome, VersionKey};
use deltaship::transfer::{
    DownloadRequest, FileState, RegistryRemote, RemoteObject, RemoteStore, TransferConfig,
    TransferManager, TransferState,
};
use deltaship::update::{Manifest, UpdatePlanner};
use deltaship::Result;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

/// Registry remote that counts the bytes it serves and receives
struct CountingRemote {
    inner: RegistryRemote,
    read: AtomicU64,
    written: AtomicU64,
}

impl CountingRemote {
    fn new(store: &TestStore) -> Arc<Self> {
        Arc::new(Self {
            inner: RegistryRemote::new(store.registry().clone(), PLATFORM, ARCH),
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl RemoteStore for CountingRemote {
    async fn read_range(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>> {
        let data = self.inner.read_range(object, offset, len).await?;
        self.read.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(data)
    }

    async fn upload_status(&self, name: &str) -> Result<Option<StagedUpload>> {
        self.inner.upload_status(name).await
    }

    async fn write_chunk(&self, name: &str, offset: u64, data: Vec<u8>) -> Result<u64> {
        self.written.fetch_add(data.len() as u64, Ordering::SeqCst);
        self.inner.write_chunk(name, offset, data).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

fn manager(remote: Arc<CountingRemote>) -> TransferManager {
    let config = TransferConfig {
        chunk_size: 1024,
        ..Default::default()
    };
    TransferManager::new(config, remote)
}

fn install_request(store: &TestStore, dest: &Path) -> DownloadRequest {
    let target = store
        .registry()
        .version_manifest(&VersionKey::new("1.0.0", PLATFORM, ARCH))
        .unwrap();
    DownloadRequest {
        to_version: "1.0.0".to_string(),
        from_version: None,
        plan: UpdatePlanner::default().plan(&Manifest::new(), &target),
        destination: dest.to_path_buf(),
        selection: None,
    }
}

#[tokio::test]
async fn test_download_continues_from_partial_file() {
    let store = TestStore::new(100 * 1024 * 1024);
    let app = patchable("resume");
    store.publish_tree("1.0.0", &[("bin/app", &app)]);

    // A previous run stopped after 4000 bytes
    let dest = TempDir::new().unwrap();
    std::fs::create_dir_all(dest.path().join("bin")).unwrap();
    std::fs::write(dest.path().join("bin/app.part"), &app[..4000]).unwrap();

    let remote = CountingRemote::new(&store);
    let handle = manager(remote.clone())
        .start_download(install_request(&store, dest.path()))
        .unwrap();
    let done = handle.wait().await.unwrap();

    assert_eq!(done.state, TransferState::Completed);
    assert_eq!(done.bytes_transferred, app.len() as u64);
    assert_eq!(remote.read.load(Ordering::SeqCst), app.len() as u64 - 4000);
    assert_eq!(std::fs::read(dest.path().join("bin/app")).unwrap(), app);
    assert!(!dest.path().join("bin/app.part").exists());
}

#[tokio::test]
async fn test_tampered_partial_is_discarded_then_refetched() {
    let store = TestStore::new(100 * 1024 * 1024);
    let app = patchable("tamper");
    store.publish_tree("1.0.0", &[("bin/app", &app)]);

    let dest = TempDir::new().unwrap();
    std::fs::create_dir_all(dest.path().join("bin")).unwrap();
    std::fs::write(dest.path().join("bin/app.part"), vec![0u8; 4000]).unwrap();

    let remote = CountingRemote::new(&store);
    let transfers = manager(remote.clone());
    let first = transfers
        .start_download(install_request(&store, dest.path()))
        .unwrap()
        .wait()
        .await
        .unwrap();
    // Every file reached a final state, one of them a failure
    assert_eq!(first.state, TransferState::Completed);
    assert_eq!(first.files_failed, 1);
    assert!(matches!(first.files[0].state, FileState::Failed(_)));
    assert!(!dest.path().join("bin/app").exists());
    assert!(!dest.path().join("bin/app.part").exists());

    let second = transfers
        .start_download(install_request(&store, dest.path()))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(second.state, TransferState::Completed);
    assert_eq!(std::fs::read(dest.path().join("bin/app")).unwrap(), app);
}

#[tokio::test]
async fn test_staged_upload_resumes_and_registers() {
    let store = TestStore::new(100 * 1024 * 1024);
    let payload = patchable("upload");
    let source = TempDir::new().unwrap();
    let file = source.path().join("fix.zip");
    std::fs::write(&file, &payload).unwrap();

    // The first half made it to staging before the connection dropped
    let half = payload.len() / 2;
    let staging = store.registry().staging();
    staging
        .append("linux-x64-1.0.1-fix.zip", 0, &mut &payload[..half])
        .unwrap();

    let remote = CountingRemote::new(&store);
    let done = manager(remote.clone())
        .start_upload(&file, "linux-x64-1.0.1-fix.zip")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(done.state, TransferState::Completed);
    assert_eq!(remote.written.load(Ordering::SeqCst), (payload.len() - half) as u64);

    let mut upload = PackageUpload::new(
        VersionKey::new("1.0.1", PLATFORM, ARCH),
        PackageKind::Hotfix,
        "fix.zip",
    );
    upload.expected_hash = Some(hash::sha256(&payload));
    let outcome = store
        .registry()
        .register_staged(&upload, "linux-x64-1.0.1-fix.zip")
        .unwrap();
    let package = match outcome {
        UploadOutcome::Uploaded(package) => package,
        other => panic!("unexpected outcome {}", other.as_str()),
    };
    assert_eq!(package.status, PackageStatus::Available);
    assert_eq!(package.size, payload.len() as i64);

    // Registering consumed the staged bytes
    assert!(staging.status("linux-x64-1.0.1-fix.zip").is_err());
}
