// src/commands/transfer.rs
//! Client commands: download a version into a directory, publish a package
//!
//! Both work against a server when `--server` is given and against the local
//! storage root otherwise.

use super::update::print_plan;
use super::{format_bytes, open_lifecycle, open_registry, planner};
use anyhow::{Context, Result, anyhow, bail};
use deltaship::config::EngineConfig;
use deltaship::db::models::PackageKind;
use deltaship::hash;
use deltaship::progress::{self, BarProgress, LogProgress, ProgressSink};
use deltaship::registry::{PackageUpload, UploadOutcome, VersionKey};
use deltaship::transfer::remote::status_error;
use deltaship::transfer::{
    DownloadRequest, HttpRemote, RegistryRemote, RemoteStore, TransferManager, TransferProgress,
    TransferState, remove_deleted,
};
use deltaship::update::{Manifest, UpdatePlan};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Options of the download command
pub struct DownloadArgs<'a> {
    pub dest: &'a Path,
    pub platform: &'a str,
    pub arch: &'a str,
    pub version: Option<String>,
    pub from: Option<String>,
    pub server: Option<&'a str>,
    pub files: Vec<String>,
    pub keep_deleted: bool,
    pub quiet: bool,
}

/// Options of the upload command
pub struct UploadArgs<'a> {
    pub file: &'a Path,
    pub version: &'a str,
    pub platform: &'a str,
    pub arch: &'a str,
    pub kind: &'a str,
    pub from: Option<String>,
    pub server: Option<&'a str>,
    pub api_key: Option<String>,
    pub quiet: bool,
}

#[derive(Debug, Deserialize)]
struct DiffReply {
    version: String,
    plan: UpdatePlan,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadReply {
    package_id: i64,
    download_reference: String,
    content_hash: String,
    outcome: String,
}

/// Manifest of the destination, ignoring partial downloads
fn local_manifest(dest: &Path) -> Result<Manifest> {
    if !dest.exists() {
        return Ok(Manifest::new());
    }
    let mut manifest = Manifest::from_dir(dest)?;
    let partial: Vec<String> = manifest
        .iter()
        .map(|(path, _)| path.clone())
        .filter(|path| path.ends_with(".part"))
        .collect();
    for path in &partial {
        manifest.remove(path);
    }
    Ok(manifest)
}

async fn plan_remote(remote: &HttpRemote, args: &DownloadArgs<'_>, local: &Manifest) -> Result<DiffReply> {
    let body = serde_json::json!({
        "platform": args.platform,
        "arch": args.arch,
        "version": args.version,
        "fromVersion": args.from,
        "manifest": local,
    });
    let response = remote
        .client()
        .post(format!("{}/versions/diff", remote.base_url()))
        .json(&body)
        .send()
        .await
        .context("Failed to reach the server")?;
    if !response.status().is_success() {
        return Err(status_error(response.status(), "Planning the update").into());
    }
    Ok(response.json().await.context("Malformed plan from the server")?)
}

fn plan_local(config: &EngineConfig, args: &DownloadArgs<'_>, local: &Manifest) -> Result<DiffReply> {
    let registry = open_registry(config)?;
    let version = match &args.version {
        Some(version) => version.clone(),
        None => registry
            .check_update(args.from.as_deref().unwrap_or_default(), args.platform, args.arch)?
            .latest_version
            .ok_or_else(|| anyhow!("No versions for {}/{}", args.platform, args.arch))?,
    };
    let target = registry.version_manifest(&VersionKey::new(&version, args.platform, args.arch))?;
    let plan = planner(config)?.plan(local, &target);
    Ok(DiffReply { version, plan })
}

fn sink_for(quiet: bool, name: &str, total: u64) -> Box<dyn ProgressSink> {
    if quiet {
        Box::new(LogProgress::new(name))
    } else {
        Box::new(BarProgress::new(total))
    }
}

fn report_failures(done: &TransferProgress) {
    for file in &done.files {
        if let deltaship::transfer::FileState::Failed(reason) = &file.state {
            warn!("{} failed: {}", file.path, reason);
        }
    }
}

pub async fn cmd_download(config: &EngineConfig, args: DownloadArgs<'_>) -> Result<()> {
    let local = local_manifest(args.dest)?;
    info!("Local tree has {} files", local.len());

    let (reply, remote): (DiffReply, Arc<dyn RemoteStore>) = match args.server {
        Some(server) => {
            let remote = HttpRemote::new(server, args.platform, args.arch)?;
            let reply = plan_remote(&remote, &args, &local).await?;
            (reply, Arc::new(remote))
        }
        None => {
            let reply = plan_local(config, &args, &local)?;
            let registry = open_registry(config)?;
            (reply, Arc::new(RegistryRemote::new(registry, args.platform, args.arch)))
        }
    };

    println!("Updating {} to {}", args.dest.display(), reply.version);
    print_plan(&reply.plan);
    if reply.plan.is_empty() {
        return Ok(());
    }

    let selection = (!args.files.is_empty()).then(|| args.files.clone());
    let manager = TransferManager::new(config.transfer_config()?, remote);
    let handle = manager.start_download(DownloadRequest {
        to_version: reply.version.clone(),
        from_version: args.from.clone(),
        plan: reply.plan.clone(),
        destination: args.dest.to_path_buf(),
        selection: selection.clone(),
    })?;

    let total = handle.progress().total_bytes;
    let sink = sink_for(args.quiet, "download", total);
    let done = progress::follow(&handle, sink.as_ref()).await?;
    report_failures(&done);

    if done.state != TransferState::Completed || done.files_failed > 0 {
        bail!("{}", progress::summary(&done));
    }

    if selection.is_none() && !args.keep_deleted {
        let removed = remove_deleted(&reply.plan, args.dest)?;
        if removed > 0 {
            println!("Removed {} files no longer shipped", removed);
        }
    }
    println!("{}", progress::summary(&done));
    Ok(())
}

/// Name of a staged upload; stable across runs so an interrupted upload resumes
fn staged_name(args: &UploadArgs<'_>, file_name: &str) -> String {
    format!("{}-{}-{}-{}", args.platform, args.arch, args.version, file_name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._-+".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub async fn cmd_upload(config: &EngineConfig, args: UploadArgs<'_>) -> Result<()> {
    let kind = PackageKind::parse(args.kind)?;
    let file_name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} is not a file", args.file.display()))?
        .to_string();
    let content_hash = hash::hash_file(args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    match args.server {
        Some(server) => upload_remote(config, server, &args, kind, &file_name, &content_hash).await,
        None => upload_local(config, &args, kind, &file_name, &content_hash),
    }
}

async fn upload_remote(
    config: &EngineConfig,
    server: &str,
    args: &UploadArgs<'_>,
    kind: PackageKind,
    file_name: &str,
    content_hash: &str,
) -> Result<()> {
    let api_key = args.api_key.clone().or_else(|| config.server.api_key.clone());
    let remote = Arc::new(HttpRemote::new(server, args.platform, args.arch)?.with_api_key(api_key));
    let name = staged_name(args, file_name);

    let manager = TransferManager::new(config.transfer_config()?, remote.clone());
    let handle = manager.start_upload(args.file, &name)?;
    let total = handle.progress().total_bytes;
    let sink = sink_for(args.quiet, "upload", total);
    let done = progress::follow(&handle, sink.as_ref()).await?;
    report_failures(&done);
    if done.state != TransferState::Completed {
        bail!("{}", progress::summary(&done));
    }

    let mut form = reqwest::multipart::Form::new()
        .text("version", args.version.to_string())
        .text("platform", args.platform.to_string())
        .text("arch", args.arch.to_string())
        .text("kind", kind.as_str())
        .text("expectedHash", content_hash.to_string())
        .text("stagedUpload", name)
        .text("fileName", file_name.to_string());
    if let Some(from) = &args.from {
        form = form.text("fromVersion", from.clone());
    }

    let mut request = remote
        .client()
        .post(format!("{}/packages", remote.base_url()))
        .multipart(form);
    if let Some(key) = remote.api_key() {
        request = request.header("X-Api-Key", key);
    }
    let response = request.send().await.context("Failed to reach the server")?;
    let status = response.status();
    if status == reqwest::StatusCode::CONFLICT {
        bail!("{} {} already exists with different content", args.version, file_name);
    }
    if !status.is_success() {
        return Err(status_error(status, "Registering the package").into());
    }

    let reply: UploadReply = response.json().await.context("Malformed reply from the server")?;
    println!(
        "{} package {} ({}): {}",
        reply.outcome, reply.package_id, reply.content_hash, reply.download_reference
    );
    Ok(())
}

fn upload_local(
    config: &EngineConfig,
    args: &UploadArgs<'_>,
    kind: PackageKind,
    file_name: &str,
    content_hash: &str,
) -> Result<()> {
    let lifecycle = open_lifecycle(config)?;
    let registry = lifecycle.registry();

    let mut upload = PackageUpload::new(VersionKey::new(args.version, args.platform, args.arch), kind, file_name);
    upload.from_version = args.from.clone();
    upload.expected_hash = Some(content_hash.to_string());
    registry.validate_upload(&upload)?;

    let size = std::fs::metadata(args.file)?.len();
    lifecycle.ensure_capacity(size)?;

    let mut file = std::fs::File::open(args.file)?;
    let outcome = registry.register_package(&upload, &mut file)?;
    let package = match &outcome {
        UploadOutcome::Uploaded(package) => {
            if let Some(record) = lifecycle.after_upload(package)? {
                println!(
                    "Retention cleanup #{} freed {}",
                    record.id.unwrap_or_default(),
                    format_bytes(record.bytes_freed.max(0) as u64)
                );
            }
            package
        }
        UploadOutcome::Skipped(package) => package,
        UploadOutcome::Conflict(_) => {
            bail!("{} {} already exists with different content", args.version, file_name)
        }
    };

    println!(
        "{} package {} ({}, {}): {}",
        outcome.as_str(),
        package.id.unwrap_or_default(),
        format_bytes(package.size.max(0) as u64),
        package.content_hash,
        package.download_reference
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
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

    fn upload_args<'a>(file: &'a Path, version: &'a str) -> UploadArgs<'a> {
        UploadArgs {
            file,
            version,
            platform: "linux",
            arch: "x64",
            kind: "full",
            from: None,
            server: None,
            api_key: None,
            quiet: true,
        }
    }

    #[test]
    fn test_staged_name_is_segment_safe() {
        let file = Path::new("My App (1).tar");
        let args = upload_args(file, "1.0.0");
        assert_eq!(staged_name(&args, "My App (1).tar"), "linux-x64-1.0.0-My_App__1_.tar");
    }

    #[test]
    fn test_local_manifest_skips_partial_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("app.bin"), b"app").unwrap();
        std::fs::write(temp.path().join("lib.so.part"), b"partial").unwrap();

        let manifest = local_manifest(temp.path()).unwrap();
        assert!(manifest.contains("app.bin"));
        assert!(!manifest.contains("lib.so.part"));
        assert!(local_manifest(&temp.path().join("missing")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_upload_then_download() {
        let temp = TempDir::new().unwrap();
        let mut config = EngineConfig::with_root(temp.path().join("store"));
        config.storage.capacity = Some("1GB".to_string());

        let package = temp.path().join("app.tar");
        std::fs::write(
            &package,
            build_tar(&[("bin/app", b"app v1"), ("share/readme.txt", b"read me")]),
        )
        .unwrap();
        cmd_upload(&config, upload_args(&package, "1.0.0")).await.unwrap();
        // Same bytes again are skipped, not rejected
        cmd_upload(&config, upload_args(&package, "1.0.0")).await.unwrap();

        let dest = temp.path().join("install");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), b"old").unwrap();

        cmd_download(
            &config,
            DownloadArgs {
                dest: &dest,
                platform: "linux",
                arch: "x64",
                version: None,
                from: None,
                server: None,
                files: Vec::new(),
                keep_deleted: false,
                quiet: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(dest.join("bin/app")).unwrap(), b"app v1");
        assert_eq!(std::fs::read(dest.join("share/readme.txt")).unwrap(), b"read me");
        assert!(!dest.join("stale.txt").exists());
    }
}
