// tests/update_flow.rs

//! Publish two versions, install the first, then upgrade with patches.

mod common;

use common::{ARCH, PLATFORM, TestStore, patchable};
use deltaship::db::models::PackageKind;
use deltaship::registry::VersionKey;
use deltaship::transfer::{
    DownloadRequest, RegistryRemote, TransferConfig, TransferManager, TransferState,
    remove_deleted,
};
use deltaship::update::{self, Manifest, ReplaceReason, UpdatePlan, UpdatePlanner};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn publish_versions(store: &TestStore) -> (Vec<u8>, Vec<u8>) {
    let app_v1 = patchable("alpha");
    let mut app_v2 = app_v1.clone();
    app_v2.extend_from_slice(b"one more line\n");

    store.publish_tree(
        "1.0.0",
        &[
            ("bin/app", &app_v1),
            ("share/readme.txt", b"version one"),
            ("share/legacy.txt", b"dropped in two"),
        ],
    );
    store.publish_tree(
        "2.0.0",
        &[
            ("bin/app", &app_v2),
            ("share/readme.txt", b"version two"),
            ("share/notes.txt", b"new in two"),
        ],
    );
    (app_v1, app_v2)
}

async fn download(
    store: &TestStore,
    dest: &Path,
    to_version: &str,
    from_version: Option<&str>,
    plan: UpdatePlan,
) -> deltaship::TransferProgress {
    let remote = RegistryRemote::new(store.registry().clone(), PLATFORM, ARCH);
    let config = TransferConfig {
        chunk_size: 1024,
        ..Default::default()
    };
    let manager = TransferManager::new(config, Arc::new(remote));
    let handle = manager
        .start_download(DownloadRequest {
            to_version: to_version.to_string(),
            from_version: from_version.map(str::to_string),
            plan,
            destination: dest.to_path_buf(),
            selection: None,
        })
        .unwrap();
    handle.wait().await.unwrap()
}

fn manifest(store: &TestStore, version: &str) -> Manifest {
    store
        .registry()
        .version_manifest(&VersionKey::new(version, PLATFORM, ARCH))
        .unwrap()
}

#[test]
fn test_update_check_offers_latest_full_package() {
    let store = TestStore::new(100 * 1024 * 1024);
    publish_versions(&store);

    let check = store.registry().check_update("1.0.0", PLATFORM, ARCH).unwrap();
    assert!(check.has_update);
    assert_eq!(check.latest_version.as_deref(), Some("2.0.0"));
    assert_eq!(check.update_options.len(), 1);
    assert_eq!(check.update_options[0].kind, PackageKind::Full);
    assert!(check.update_options[0].download_reference.starts_with("/download/"));

    let current = store.registry().check_update("2.0.0", PLATFORM, ARCH).unwrap();
    assert!(!current.has_update);
    assert!(current.update_options.is_empty());
}

#[test]
fn test_manifests_diff_between_versions() {
    let store = TestStore::new(100 * 1024 * 1024);
    publish_versions(&store);

    let diff = update::diff(&manifest(&store, "1.0.0"), &manifest(&store, "2.0.0"));
    let paths = |entries: &[update::DiffEntry]| -> Vec<String> {
        entries.iter().map(|e| e.path.clone()).collect()
    };
    assert_eq!(paths(&diff.new[..]), vec!["share/notes.txt"]);
    assert_eq!(paths(&diff.deleted[..]), vec!["share/legacy.txt"]);
    let modified: Vec<&str> = diff.modified.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(modified, vec!["bin/app", "share/readme.txt"]);
    assert!(diff.same.is_empty());
}

#[tokio::test]
async fn test_install_then_upgrade_with_patches() {
    let store = TestStore::new(100 * 1024 * 1024);
    let (app_v1, app_v2) = publish_versions(&store);
    let planner = UpdatePlanner::default();

    // Fresh install of 1.0.0
    let install = TempDir::new().unwrap();
    let plan = planner.plan(&Manifest::new(), &manifest(&store, "1.0.0"));
    assert_eq!(plan.to_add.len(), 3);
    let done = download(&store, install.path(), "1.0.0", None, plan).await;
    assert_eq!(done.state, TransferState::Completed);
    assert_eq!(done.files_completed, 3);
    assert_eq!(std::fs::read(install.path().join("bin/app")).unwrap(), app_v1);

    // Upgrade to 2.0.0 from what is on disk
    let local = Manifest::from_dir(install.path()).unwrap();
    assert_eq!(local, manifest(&store, "1.0.0"));
    let plan = planner.plan(&local, &manifest(&store, "2.0.0"));

    assert_eq!(plan.to_patch.len(), 1);
    assert_eq!(plan.to_patch[0].path, "bin/app");
    assert!(plan.to_patch[0].estimated);
    assert_eq!(plan.to_replace.len(), 1);
    assert_eq!(plan.to_replace[0].reason, ReplaceReason::TooSmall);
    assert_eq!(plan.to_add.len(), 1);
    assert_eq!(plan.to_delete.len(), 1);
    assert!(plan.total_transfer_size < plan.total_original_size);

    let done = download(&store, install.path(), "2.0.0", Some("1.0.0"), plan.clone()).await;
    assert_eq!(done.state, TransferState::Completed);
    assert_eq!(done.files_failed, 0);
    assert_eq!(remove_deleted(&plan, install.path()).unwrap(), 1);

    assert_eq!(std::fs::read(install.path().join("bin/app")).unwrap(), app_v2);
    assert_eq!(
        Manifest::from_dir(install.path()).unwrap(),
        manifest(&store, "2.0.0")
    );

    // The patch served during the upgrade is now cached with its real size
    let cached = store
        .registry()
        .cached_file_patch(PLATFORM, ARCH, "1.0.0", "2.0.0", "bin/app")
        .unwrap()
        .unwrap();
    assert!(cached.size < app_v2.len() as u64);

    // Planning again with the known size is no longer an estimate
    let mut known = std::collections::HashMap::new();
    known.insert("bin/app".to_string(), cached.size);
    let replanned = planner.plan_with_patch_sizes(
        &manifest(&store, "1.0.0"),
        &manifest(&store, "2.0.0"),
        &known,
    );
    assert!(!replanned.to_patch[0].estimated);
    assert_eq!(replanned.to_patch[0].patch_size, cached.size);

    // A second run has nothing left to do
    let local = Manifest::from_dir(install.path()).unwrap();
    assert!(planner.plan(&local, &manifest(&store, "2.0.0")).is_empty());
}
