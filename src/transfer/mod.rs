// src/transfer/mod.rs

//! Resumable, integrity-verified transfers
//!
//! A transfer runs on a background task and publishes [`TransferProgress`]
//! snapshots through a watch channel. The controlling side only shares the
//! pause and cancel flags with the worker; both are checked at every chunk
//! boundary, so pausing or cancelling takes effect within one chunk.
//!
//! Downloads write to `<target>.part` and resume from its size with range
//! reads. Every finished file is hashed and compared with the plan before it
//! replaces the target; a mismatch deletes the bytes and fails only that file.

pub mod progress;
pub mod remote;

pub use progress::{
    FileProgress, FileState, SpeedTracker, TransferDirection, TransferProgress, TransferState,
};
pub use remote::{HttpRemote, RegistryRemote, RemoteObject, RemoteStore};

use crate::delta::PatchEngine;
use crate::error::{Error, Result};
use crate::hash;
use crate::registry::layout::sanitize_path;
use crate::update::UpdatePlan;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PART_SUFFIX: &str = ".part";
const PATCH_PART_SUFFIX: &str = ".patch.part";
const PATCHED_SUFFIX: &str = ".patched";

/// Transfer manager settings
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Attempts per chunk for transient failures
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
    /// Samples in the rolling speed window
    pub speed_window: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            speed_window: 10,
        }
    }
}

/// How one file of a download gets its bytes
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileSource {
    /// Fetch the whole file
    Full,
    /// Fetch a patch and apply it to the existing file
    Patch { from: String },
}

#[derive(Debug, Clone)]
struct DownloadItem {
    path: String,
    size: u64,
    hash: String,
    source: FileSource,
}

/// What to download
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Version the plan moves to
    pub to_version: String,
    /// Version the local tree is at; required when the plan has patches
    pub from_version: Option<String>,
    pub plan: UpdatePlan,
    pub destination: PathBuf,
    /// Paths to transfer; all transferable files when `None`
    pub selection: Option<Vec<String>>,
}

/// Flags and snapshot shared between a handle and its worker
struct TransferShared {
    progress: Mutex<TransferProgress>,
    tx: watch::Sender<TransferProgress>,
    paused: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
}

impl TransferShared {
    fn new(progress: TransferProgress) -> Arc<Self> {
        let (tx, _rx) = watch::channel(progress.clone());
        Arc::new(Self {
            progress: Mutex::new(progress),
            tx,
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Mutate the snapshot and publish it under the same lock
    fn update<F: FnOnce(&mut TransferProgress)>(&self, f: F) {
        let mut progress = self.progress.lock();
        f(&mut progress);
        self.tx.send_replace(progress.clone());
    }

    fn snapshot(&self) -> TransferProgress {
        self.progress.lock().clone()
    }

    /// Chunk boundary: wait while paused, error when cancelled
    async fn checkpoint(&self, running: TransferState) -> Result<()> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if !self.paused.load(Ordering::SeqCst) {
                let resumed = self.progress.lock().state == TransferState::Paused;
                if resumed {
                    self.update(|p| p.state = running);
                }
                return Ok(());
            }
            let waiting = self.wake.notified();
            if self.progress.lock().state != TransferState::Paused {
                self.update(|p| p.state = TransferState::Paused);
            }
            if self.paused.load(Ordering::SeqCst) && !self.cancelled.load(Ordering::SeqCst) {
                waiting.await;
            }
        }
    }
}

/// Caller's side of a running transfer
#[derive(Clone)]
pub struct TransferHandle {
    id: String,
    shared: Arc<TransferShared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop at the next chunk boundary until resumed
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    /// Stop at the next chunk boundary; completed files are kept
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    pub fn progress(&self) -> TransferProgress {
        self.shared.snapshot()
    }

    /// Stream of progress snapshots
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.shared.tx.subscribe()
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> Result<TransferProgress> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("Transfer task failed: {e}")))?;
        } else {
            let mut rx = self.subscribe();
            rx.wait_for(|p| p.state.is_terminal())
                .await
                .map_err(|e| Error::Internal(format!("Transfer channel closed: {e}")))?;
        }
        Ok(self.progress())
    }
}

pub struct TransferManager {
    config: TransferConfig,
    remote: Arc<dyn RemoteStore>,
    transfers: DashMap<String, TransferHandle>,
}

impl TransferManager {
    pub fn new(config: TransferConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            remote,
            transfers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn get(&self, id: &str) -> Option<TransferHandle> {
        self.transfers.get(id).map(|h| h.clone())
    }

    /// Snapshots of every transfer started by this manager
    pub fn list(&self) -> Vec<TransferProgress> {
        self.transfers.iter().map(|h| h.progress()).collect()
    }

    /// Forget finished transfers
    pub fn prune_finished(&self) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|_, h| !h.progress().state.is_terminal());
        before - self.transfers.len()
    }

    /// Start downloading the files of a plan
    pub fn start_download(&self, request: DownloadRequest) -> Result<TransferHandle> {
        let items = download_items(&request)?;
        fs::create_dir_all(&request.destination)?;

        let files = items
            .iter()
            .map(|item| FileProgress {
                path: item.path.clone(),
                size: item.size,
                transferred: 0,
                state: FileState::Pending,
            })
            .collect();
        let id = uuid::Uuid::new_v4().to_string();
        let shared = TransferShared::new(TransferProgress::new(
            id.clone(),
            TransferDirection::Download,
            files,
        ));

        info!(
            "Starting download {} of {} files to {}",
            id,
            items.len(),
            request.destination.display()
        );

        let worker = DownloadWorker {
            config: self.config.clone(),
            remote: self.remote.clone(),
            shared: shared.clone(),
            to_version: request.to_version,
            destination: request.destination,
            speed: SpeedTracker::new(self.config.speed_window),
        };
        let task = tokio::spawn(worker.run(items));
        Ok(self.register(id, shared, task))
    }

    /// Start uploading a local file into the remote's staging area under `name`
    pub fn start_upload(&self, source: &Path, name: &str) -> Result<TransferHandle> {
        let size = fs::metadata(source)
            .map_err(|e| Error::NotFoundError(format!("{}: {}", source.display(), e)))?
            .len();
        let id = uuid::Uuid::new_v4().to_string();
        let shared = TransferShared::new(TransferProgress::new(
            id.clone(),
            TransferDirection::Upload,
            vec![FileProgress {
                path: name.to_string(),
                size,
                transferred: 0,
                state: FileState::Pending,
            }],
        ));

        info!("Starting upload {} of {} ({} bytes)", id, source.display(), size);

        let worker = UploadWorker {
            config: self.config.clone(),
            remote: self.remote.clone(),
            shared: shared.clone(),
            source: source.to_path_buf(),
            name: name.to_string(),
            size,
            speed: SpeedTracker::new(self.config.speed_window),
        };
        let task = tokio::spawn(worker.run());
        Ok(self.register(id, shared, task))
    }

    fn register(&self, id: String, shared: Arc<TransferShared>, task: JoinHandle<()>) -> TransferHandle {
        let handle = TransferHandle {
            id: id.clone(),
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        };
        self.transfers.insert(id, handle.clone());
        handle
    }
}

/// Flatten a plan into the files to fetch, honouring the selection
fn download_items(request: &DownloadRequest) -> Result<Vec<DownloadItem>> {
    let plan = &request.plan;
    let mut items: Vec<DownloadItem> = plan
        .to_add
        .iter()
        .map(|f| (f.path.clone(), f.size, f.hash.clone()))
        .chain(plan.to_replace.iter().map(|f| (f.path.clone(), f.size, f.hash.clone())))
        .map(|(path, size, hash)| DownloadItem {
            path,
            size,
            hash,
            source: FileSource::Full,
        })
        .collect();

    if !plan.to_patch.is_empty() {
        let from = request.from_version.clone().ok_or_else(|| {
            Error::InvalidInput("Patched files need the local version".to_string())
        })?;
        items.extend(plan.to_patch.iter().map(|f| DownloadItem {
            path: f.path.clone(),
            size: f.size,
            hash: f.hash.clone(),
            source: FileSource::Patch { from: from.clone() },
        }));
    }

    for item in &mut items {
        item.path = sanitize_path(&item.path)?;
    }

    if let Some(selection) = &request.selection {
        let wanted: HashSet<String> = selection
            .iter()
            .map(|p| sanitize_path(p))
            .collect::<Result<_>>()?;
        let known: HashSet<&str> = items.iter().map(|i| i.path.as_str()).collect();
        if let Some(unknown) = wanted.iter().find(|p| !known.contains(p.as_str())) {
            return Err(Error::InvalidInput(format!("{} is not part of the plan", unknown)));
        }
        items.retain(|i| wanted.contains(&i.path));
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

/// Remove the plan's deleted files from a tree; returns how many were removed
pub fn remove_deleted(plan: &UpdatePlan, destination: &Path) -> Result<usize> {
    let mut removed = 0;
    for file in &plan.to_delete {
        let target = destination.join(sanitize_path(&file.path)?);
        match fs::remove_file(&target) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to remove {}: {}",
                    target.display(),
                    e
                )));
            }
        }
    }
    Ok(removed)
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn with_retries<T, F, Fut>(config: &TransferConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                warn!("{} attempt {} failed: {}, retrying...", what, attempt, e);
                tokio::time::sleep(config.retry_delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

struct DownloadWorker {
    config: TransferConfig,
    remote: Arc<dyn RemoteStore>,
    shared: Arc<TransferShared>,
    to_version: String,
    destination: PathBuf,
    speed: SpeedTracker,
}

impl DownloadWorker {
    async fn run(mut self, items: Vec<DownloadItem>) {
        self.shared.update(|p| p.state = TransferState::Downloading);

        for (index, item) in items.iter().enumerate() {
            self.shared.update(|p| {
                p.current_file = Some(item.path.clone());
                p.set_file_state(index, FileState::InProgress);
            });

            match self.transfer_file(index, item).await {
                Ok(state) => {
                    debug!("{}: {:?}", item.path, state);
                    self.shared.update(|p| p.set_file_state(index, state));
                }
                Err(Error::Cancelled) => {
                    info!("Download {} cancelled", self.shared.snapshot().id);
                    self.shared.update(|p| {
                        p.set_file_state(index, FileState::Pending);
                        p.state = TransferState::Cancelled;
                        p.current_file = None;
                    });
                    return;
                }
                Err(e) => {
                    warn!("Download of {} failed: {}", item.path, e);
                    self.shared
                        .update(|p| p.set_file_state(index, FileState::Failed(e.to_string())));
                }
            }
        }

        self.shared.update(|p| {
            p.current_file = None;
            p.eta_seconds = None;
            p.state = if p.all_files_terminal() {
                TransferState::Completed
            } else {
                TransferState::Failed
            };
        });
        let done = self.shared.snapshot();
        info!(
            "Download {} finished: {} completed, {} skipped, {} failed",
            done.id, done.files_completed, done.files_skipped, done.files_failed
        );
    }

    async fn transfer_file(&mut self, index: usize, item: &DownloadItem) -> Result<FileState> {
        let target = self.destination.join(&item.path);

        if target.is_file() && hash::hash_file(&target).ok().as_deref() == Some(item.hash.as_str()) {
            self.add_bytes(index, item.size, false);
            return Ok(FileState::Skipped);
        }

        match &item.source {
            FileSource::Full => self.fetch_full(index, item, &target).await,
            FileSource::Patch { from } => self.fetch_patch(index, item, from, &target).await,
        }
    }

    async fn fetch_full(&mut self, index: usize, item: &DownloadItem, target: &Path) -> Result<FileState> {
        let part = suffixed(target, PART_SUFFIX);
        let mut offset = resume_offset(&part, Some(item.size))?;
        if offset > 0 {
            info!("Resuming {} at byte {}", item.path, offset);
            self.add_bytes(index, offset, false);
        }

        if item.size == 0 {
            append_at(&part, 0, &[])?;
        }

        let object = RemoteObject::File {
            version: self.to_version.clone(),
            path: item.path.clone(),
        };
        while offset < item.size {
            self.shared.checkpoint(TransferState::Downloading).await?;
            let want = (item.size - offset).min(self.config.chunk_size as u64);
            let chunk = self.read_chunk(&object, offset, want).await?;
            if chunk.is_empty() {
                return Ok(FileState::Failed(format!(
                    "remote ended at {} of {} bytes",
                    offset, item.size
                )));
            }
            append_at(&part, offset, &chunk)?;
            offset += chunk.len() as u64;
            self.add_bytes(index, chunk.len() as u64, true);
        }

        let actual = hash::hash_file(&part)?;
        if actual != item.hash {
            warn!("Hash mismatch for {}, discarding download", item.path);
            fs::remove_file(&part)?;
            self.retract_bytes(index);
            return Ok(FileState::Failed(
                Error::ChecksumMismatch {
                    expected: item.hash.clone(),
                    actual,
                }
                .to_string(),
            ));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&part, target)
            .map_err(|e| Error::IoError(format!("Failed to place {}: {}", target.display(), e)))?;
        Ok(FileState::Completed)
    }

    async fn fetch_patch(
        &mut self,
        index: usize,
        item: &DownloadItem,
        from: &str,
        target: &Path,
    ) -> Result<FileState> {
        if !target.is_file() {
            return Ok(FileState::Failed("base file for patch is missing".to_string()));
        }

        let part = suffixed(target, PATCH_PART_SUFFIX);
        let mut offset = resume_offset(&part, None)?;
        let object = RemoteObject::Patch {
            from: from.to_string(),
            to: self.to_version.clone(),
            path: item.path.clone(),
        };

        // Patch length is unknown up front; read until a short chunk
        loop {
            self.shared.checkpoint(TransferState::Downloading).await?;
            let want = self.config.chunk_size as u64;
            let chunk = self.read_chunk(&object, offset, want).await?;
            if !chunk.is_empty() {
                append_at(&part, offset, &chunk)?;
                offset += chunk.len() as u64;
                self.add_bytes(index, chunk.len() as u64, true);
            }
            if (chunk.len() as u64) < want {
                break;
            }
        }

        // Patched bytes land beside the target and replace it only once verified
        let patched = suffixed(target, PATCHED_SUFFIX);
        let engine = PatchEngine::default();
        let applied = {
            let target = target.to_path_buf();
            let part = part.clone();
            let patched = patched.clone();
            tokio::task::spawn_blocking(move || engine.apply_patch_file(&target, &part, &patched))
                .await
                .map_err(|e| Error::Internal(format!("Patch task failed: {e}")))?
        };
        // The patch is useless after success and suspect after failure
        if let Err(e) = fs::remove_file(&part) {
            debug!("Failed to remove {}: {}", part.display(), e);
        }

        let failure = match applied {
            Ok(new_hash) if new_hash == item.hash => {
                fs::rename(&patched, target).map_err(|e| {
                    Error::IoError(format!("Failed to place {}: {}", target.display(), e))
                })?;
                self.settle_bytes(index, item.size);
                return Ok(FileState::Completed);
            }
            Ok(new_hash) => {
                warn!("Hash mismatch for patched {}, discarding result", item.path);
                Error::ChecksumMismatch {
                    expected: item.hash.clone(),
                    actual: new_hash,
                }
            }
            Err(e) => e,
        };

        if patched.exists() {
            fs::remove_file(&patched)?;
        }
        self.retract_bytes(index);
        Ok(FileState::Failed(failure.to_string()))
    }

    async fn read_chunk(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>> {
        let remote = self.remote.clone();
        with_retries(&self.config, &format!("Chunk of {}", object.path()), || {
            let remote = remote.clone();
            async move { remote.read_range(object, offset, len).await }
        })
        .await
    }

    /// Count `bytes` toward file `index`; `sample` feeds the speed window
    fn add_bytes(&mut self, index: usize, bytes: u64, sample: bool) {
        if sample {
            self.speed.record(bytes);
        }
        let speed = self.speed.bytes_per_second();
        let eta = |p: &TransferProgress| {
            let remaining = p.total_bytes.saturating_sub(p.bytes_transferred);
            (speed > 0.0).then(|| remaining as f64 / speed)
        };
        self.shared.update(|p| {
            if let Some(file) = p.files.get_mut(index) {
                file.transferred += bytes;
            }
            p.bytes_transferred += bytes;
            p.bytes_per_second = speed;
            p.eta_seconds = eta(p);
        });
    }

    /// Undo a file's counted bytes after its download was discarded
    fn retract_bytes(&mut self, index: usize) {
        self.shared.update(|p| {
            if let Some(file) = p.files.get_mut(index) {
                p.bytes_transferred = p.bytes_transferred.saturating_sub(file.transferred);
                file.transferred = 0;
            }
        });
    }

    /// Patched files report their full size as transferred once applied
    fn settle_bytes(&mut self, index: usize, size: u64) {
        self.shared.update(|p| {
            if let Some(file) = p.files.get_mut(index) {
                if file.transferred < size {
                    p.bytes_transferred += size - file.transferred;
                } else {
                    p.bytes_transferred -= file.transferred - size;
                }
                file.transferred = size;
            }
        });
    }
}

/// Size of a partial file to resume from
///
/// A partial copy is usable when it is non-empty and shorter than the
/// target; anything else is discarded and the file starts over.
fn resume_offset(part: &Path, target_size: Option<u64>) -> Result<u64> {
    let size = match fs::metadata(part) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let usable = size > 0 && target_size.is_none_or(|t| size < t);
    if usable {
        return Ok(size);
    }
    fs::remove_file(part)?;
    Ok(0)
}

fn append_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(())
}

struct UploadWorker {
    config: TransferConfig,
    remote: Arc<dyn RemoteStore>,
    shared: Arc<TransferShared>,
    source: PathBuf,
    name: String,
    size: u64,
    speed: SpeedTracker,
}

impl UploadWorker {
    async fn run(mut self) {
        self.shared.update(|p| {
            p.state = TransferState::Uploading;
            p.current_file = Some(self.name.clone());
            p.set_file_state(0, FileState::InProgress);
        });

        let (file_state, state) = match self.upload().await {
            Ok(state) => (state, TransferState::Completed),
            Err(Error::Cancelled) => (FileState::Pending, TransferState::Cancelled),
            Err(e) => {
                warn!("Upload of {} failed: {}", self.name, e);
                let message = e.to_string();
                self.shared.update(|p| p.error = Some(message.clone()));
                (FileState::Failed(message), TransferState::Failed)
            }
        };

        self.shared.update(|p| {
            p.set_file_state(0, file_state);
            p.state = state;
            p.current_file = None;
            p.eta_seconds = None;
        });
        info!("Upload of {} finished: {}", self.name, state);
    }

    async fn upload(&mut self) -> Result<FileState> {
        let local_hash = {
            let source = self.source.clone();
            tokio::task::spawn_blocking(move || hash::hash_file(&source))
                .await
                .map_err(|e| Error::Internal(format!("Hash task failed: {e}")))??
        };

        let mut offset = match self.remote.upload_status(&self.name).await? {
            Some(staged) if staged.size == self.size && staged.hash == local_hash => {
                self.count(self.size, false);
                return Ok(FileState::Skipped);
            }
            Some(staged) if staged.size < self.size => staged.size,
            Some(staged) => {
                return Err(Error::OffsetMismatch {
                    staged: staged.size,
                    requested: self.size,
                });
            }
            None => {
                // An empty source has no chunks; stage it explicitly
                if self.size == 0 {
                    self.remote.write_chunk(&self.name, 0, Vec::new()).await?;
                }
                0
            }
        };
        if offset > 0 {
            info!("Resuming upload of {} at byte {}", self.name, offset);
            self.count(offset, false);
        }

        while offset < self.size {
            self.shared.checkpoint(TransferState::Uploading).await?;
            let want = (self.size - offset).min(self.config.chunk_size as u64);
            let chunk = read_local(&self.source, offset, want)?;

            let remote = self.remote.clone();
            let name = self.name.clone();
            let result = with_retries(&self.config, &format!("Upload chunk of {}", self.name), || {
                let remote = remote.clone();
                let name = name.clone();
                let chunk = chunk.clone();
                async move { remote.write_chunk(&name, offset, chunk).await }
            })
            .await;

            match result {
                Ok(new_size) => {
                    let advanced = new_size.saturating_sub(offset);
                    offset = new_size;
                    self.count(advanced, true);
                }
                // A retried chunk may have landed; continue from what the remote holds
                Err(Error::OffsetMismatch { staged, .. }) if staged <= self.size => {
                    debug!("Resynchronising upload of {} at {}", self.name, staged);
                    let delta = staged as i64 - offset as i64;
                    offset = staged;
                    self.shared.update(|p| {
                        p.bytes_transferred = (p.bytes_transferred as i64 + delta).max(0) as u64;
                        p.files[0].transferred = offset;
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let remote_hash = self
            .remote
            .upload_status(&self.name)
            .await?
            .map(|s| s.hash)
            .unwrap_or_default();
        if remote_hash != local_hash {
            return Err(Error::ChecksumMismatch {
                expected: local_hash,
                actual: remote_hash,
            });
        }
        Ok(FileState::Completed)
    }

    fn count(&mut self, bytes: u64, sample: bool) {
        if sample {
            self.speed.record(bytes);
        }
        let speed = self.speed.bytes_per_second();
        self.shared.update(|p| {
            p.files[0].transferred += bytes;
            p.bytes_transferred += bytes;
            p.bytes_per_second = speed;
            let remaining = p.total_bytes.saturating_sub(p.bytes_transferred);
            p.eta_seconds = (speed > 0.0).then(|| remaining as f64 / speed);
        });
    }
}

fn read_local(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StagedUpload;
    use crate::update::{PlannedFile, PatchedFile};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// In-memory remote with optional injected failures
    #[derive(Default)]
    struct MemoryRemote {
        files: HashMap<String, Vec<u8>>,
        patches: HashMap<String, Vec<u8>>,
        fail_reads: AtomicUsize,
        reads: AtomicUsize,
        staged: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn read_range(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) > 0 {
                self.fail_reads.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::DownloadError("connection reset".into()));
            }
            let data = match object {
                RemoteObject::File { path, .. } => self.files.get(path),
                RemoteObject::Patch { path, .. } => self.patches.get(path),
            }
            .ok_or_else(|| Error::NotFoundError(object.path().to_string()))?;
            let start = (offset as usize).min(data.len());
            let end = (start + len as usize).min(data.len());
            Ok(data[start..end].to_vec())
        }

        async fn upload_status(&self, name: &str) -> Result<Option<StagedUpload>> {
            Ok(self.staged.lock().get(name).map(|d| StagedUpload {
                name: name.to_string(),
                size: d.len() as u64,
                hash: hash::sha256(d),
            }))
        }

        async fn write_chunk(&self, name: &str, offset: u64, data: Vec<u8>) -> Result<u64> {
            let mut staged = self.staged.lock();
            let entry = staged.entry(name.to_string()).or_default();
            if entry.len() as u64 != offset {
                return Err(Error::OffsetMismatch {
                    staged: entry.len() as u64,
                    requested: offset,
                });
            }
            entry.extend_from_slice(&data);
            Ok(entry.len() as u64)
        }

        fn name(&self) -> &str {
            "memory"
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 4,
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            speed_window: 10,
        }
    }

    fn planned(path: &str, data: &[u8]) -> PlannedFile {
        PlannedFile {
            path: path.to_string(),
            size: data.len() as u64,
            hash: hash::sha256(data),
        }
    }

    fn request(dest: &Path, files: Vec<PlannedFile>) -> DownloadRequest {
        DownloadRequest {
            to_version: "2.0.0".into(),
            from_version: None,
            plan: UpdatePlan {
                to_add: files,
                ..Default::default()
            },
            destination: dest.to_path_buf(),
            selection: None,
        }
    }

    #[tokio::test]
    async fn test_download_and_skip() {
        let temp = TempDir::new().unwrap();
        let mut remote = MemoryRemote::default();
        remote.files.insert("a.txt".into(), b"hello world".to_vec());
        remote.files.insert("b/c.bin".into(), b"0123456789".to_vec());
        fs::write(temp.path().join("a.txt"), b"hello world").unwrap();

        let manager = TransferManager::new(config(), Arc::new(remote));
        let handle = manager
            .start_download(request(
                temp.path(),
                vec![planned("a.txt", b"hello world"), planned("b/c.bin", b"0123456789")],
            ))
            .unwrap();
        let done = handle.wait().await.unwrap();

        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.files_skipped, 1);
        assert_eq!(done.files_completed, 1);
        assert_eq!(done.bytes_transferred, 21);
        assert_eq!(fs::read(temp.path().join("b/c.bin")).unwrap(), b"0123456789");
        assert!(!temp.path().join("b/c.bin.part").exists());
    }

    #[tokio::test]
    async fn test_resume_from_partial() {
        let temp = TempDir::new().unwrap();
        let data = b"abcdefghijklmnop".to_vec();
        let mut remote = MemoryRemote::default();
        remote.files.insert("f".into(), data.clone());
        fs::write(temp.path().join("f.part"), &data[..6]).unwrap();

        let remote = Arc::new(remote);
        let manager = TransferManager::new(config(), remote.clone());
        let done = manager
            .start_download(request(temp.path(), vec![planned("f", &data)]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.files_completed, 1);
        assert_eq!(fs::read(temp.path().join("f")).unwrap(), data);
        // 10 remaining bytes in chunks of 4
        assert_eq!(remote.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_alone() {
        let temp = TempDir::new().unwrap();
        let mut remote = MemoryRemote::default();
        remote.files.insert("good".into(), b"good data".to_vec());
        remote.files.insert("bad".into(), b"tampered!".to_vec());

        let manager = TransferManager::new(config(), Arc::new(remote));
        let done = manager
            .start_download(request(
                temp.path(),
                vec![planned("bad", b"original!"), planned("good", b"good data")],
            ))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.files_failed, 1);
        assert_eq!(done.files_completed, 1);
        assert!(!temp.path().join("bad").exists());
        assert!(!temp.path().join("bad.part").exists());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let temp = TempDir::new().unwrap();
        let mut remote = MemoryRemote::default();
        remote.files.insert("f".into(), b"12345678".to_vec());
        remote.fail_reads.store(2, Ordering::SeqCst);

        let manager = TransferManager::new(config(), Arc::new(remote));
        let done = manager
            .start_download(request(temp.path(), vec![planned("f", b"12345678")]))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(done.files_completed, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_file() {
        let temp = TempDir::new().unwrap();
        let mut remote = MemoryRemote::default();
        remote.files.insert("f".into(), b"12345678".to_vec());
        remote.fail_reads.store(10, Ordering::SeqCst);

        let manager = TransferManager::new(config(), Arc::new(remote));
        let done = manager
            .start_download(request(temp.path(), vec![planned("f", b"12345678")]))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(done.files_failed, 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_for_resume() {
        let temp = TempDir::new().unwrap();
        let data = vec![7u8; 64];
        let mut remote = MemoryRemote::default();
        remote.files.insert("f".into(), data.clone());
        let remote = Arc::new(remote);

        let manager = TransferManager::new(config(), remote.clone());
        let handle = manager
            .start_download(request(temp.path(), vec![planned("f", &data)]))
            .unwrap();
        handle.pause();
        let mut rx = handle.subscribe();
        rx.wait_for(|p| p.state == TransferState::Paused || p.state.is_terminal())
            .await
            .unwrap();
        handle.cancel();
        let done = handle.wait().await.unwrap();
        assert_eq!(done.state, TransferState::Cancelled);

        let resumed = manager
            .start_download(request(temp.path(), vec![planned("f", &data)]))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(resumed.state, TransferState::Completed);
        assert_eq!(hash::hash_file(&temp.path().join("f")).unwrap(), hash::sha256(&data));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let temp = TempDir::new().unwrap();
        let data = vec![3u8; 40];
        let mut remote = MemoryRemote::default();
        remote.files.insert("f".into(), data.clone());

        let manager = TransferManager::new(config(), Arc::new(remote));
        let handle = manager
            .start_download(request(temp.path(), vec![planned("f", &data)]))
            .unwrap();
        handle.pause();
        let mut rx = handle.subscribe();
        rx.wait_for(|p| p.state == TransferState::Paused || p.state.is_terminal())
            .await
            .unwrap();
        handle.resume();

        let done = handle.wait().await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(fs::read(temp.path().join("f")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_patch_download_applies() {
        let temp = TempDir::new().unwrap();
        let old = "base line\n".repeat(300).into_bytes();
        let mut new = old.clone();
        new.extend_from_slice(b"appended\n");
        let patch = PatchEngine::default().create_patch(&old, &new).unwrap();
        fs::write(temp.path().join("app.txt"), &old).unwrap();

        let mut remote = MemoryRemote::default();
        remote.patches.insert("app.txt".into(), patch);
        let manager = TransferManager::new(config(), Arc::new(remote));

        let plan = UpdatePlan {
            to_patch: vec![PatchedFile {
                path: "app.txt".into(),
                old_size: old.len() as u64,
                old_hash: hash::sha256(&old),
                size: new.len() as u64,
                hash: hash::sha256(&new),
                patch_size: 100,
                estimated: true,
            }],
            ..Default::default()
        };
        let done = manager
            .start_download(DownloadRequest {
                to_version: "2.0.0".into(),
                from_version: Some("1.0.0".into()),
                plan,
                destination: temp.path().to_path_buf(),
                selection: None,
            })
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.files_completed, 1);
        assert_eq!(done.bytes_transferred, new.len() as u64);
        assert_eq!(fs::read(temp.path().join("app.txt")).unwrap(), new);
        assert!(!temp.path().join("app.txt.patch.part").exists());
    }

    #[tokio::test]
    async fn test_selection_limits_files() {
        let temp = TempDir::new().unwrap();
        let mut remote = MemoryRemote::default();
        remote.files.insert("a".into(), b"aaaa".to_vec());
        remote.files.insert("b".into(), b"bbbb".to_vec());
        let manager = TransferManager::new(config(), Arc::new(remote));

        let mut req = request(temp.path(), vec![planned("a", b"aaaa"), planned("b", b"bbbb")]);
        req.selection = Some(vec!["b".into()]);
        let done = manager.start_download(req).unwrap().wait().await.unwrap();
        assert_eq!(done.files_total, 1);
        assert!(!temp.path().join("a").exists());

        let mut bad = request(temp.path(), vec![planned("a", b"aaaa")]);
        bad.selection = Some(vec!["zzz".into()]);
        assert!(matches!(manager.start_download(bad), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_upload_resumes_and_verifies() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("pkg.zip");
        let data: Vec<u8> = (0..30u8).collect();
        fs::write(&source, &data).unwrap();

        let remote = Arc::new(MemoryRemote::default());
        remote.staged.lock().insert("pkg.zip".into(), data[..10].to_vec());

        let manager = TransferManager::new(config(), remote.clone());
        let done = manager.start_upload(&source, "pkg.zip").unwrap().wait().await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.bytes_transferred, 30);
        assert_eq!(remote.staged.lock().get("pkg.zip").unwrap(), &data);

        let again = manager.start_upload(&source, "pkg.zip").unwrap().wait().await.unwrap();
        assert_eq!(again.files_skipped, 1);
        assert_eq!(manager.list().len(), 2);
        assert_eq!(manager.prune_finished(), 2);
    }

    #[tokio::test]
    async fn test_empty_file_download() {
        let temp = TempDir::new().unwrap();
        let mut remote = MemoryRemote::default();
        remote.files.insert("empty.txt".into(), Vec::new());

        let manager = TransferManager::new(config(), Arc::new(remote));
        let done = manager
            .start_download(request(temp.path(), vec![planned("empty.txt", b"")]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.files_completed, 1);
        assert_eq!(done.files_failed, 0);
        assert_eq!(fs::read(temp.path().join("empty.txt")).unwrap(), b"");
        assert!(!temp.path().join("empty.txt.part").exists());
    }

    #[tokio::test]
    async fn test_empty_file_upload() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("empty.zip");
        fs::write(&source, b"").unwrap();

        let remote = Arc::new(MemoryRemote::default());
        let manager = TransferManager::new(config(), remote.clone());
        let done = manager.start_upload(&source, "empty.zip").unwrap().wait().await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.files_completed, 1);
        assert_eq!(remote.staged.lock().get("empty.zip").unwrap(), &Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_patch_result_with_wrong_hash_is_discarded() {
        let temp = TempDir::new().unwrap();
        let old = "base line\n".repeat(300).into_bytes();
        let mut other = old.clone();
        other.extend_from_slice(b"not what the plan expects\n");
        let mut wanted = old.clone();
        wanted.extend_from_slice(b"appended\n");
        let patch = PatchEngine::default().create_patch(&old, &other).unwrap();
        fs::write(temp.path().join("app.txt"), &old).unwrap();

        let mut remote = MemoryRemote::default();
        remote.patches.insert("app.txt".into(), patch);
        let manager = TransferManager::new(config(), Arc::new(remote));

        let plan = UpdatePlan {
            to_patch: vec![PatchedFile {
                path: "app.txt".into(),
                old_size: old.len() as u64,
                old_hash: hash::sha256(&old),
                size: wanted.len() as u64,
                hash: hash::sha256(&wanted),
                patch_size: 100,
                estimated: true,
            }],
            ..Default::default()
        };
        let done = manager
            .start_download(DownloadRequest {
                to_version: "2.0.0".into(),
                from_version: Some("1.0.0".into()),
                plan,
                destination: temp.path().to_path_buf(),
                selection: None,
            })
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.files_failed, 1);
        assert_eq!(done.bytes_transferred, 0);
        // The original stays in place for a later retry
        assert_eq!(fs::read(temp.path().join("app.txt")).unwrap(), old);
        assert!(!temp.path().join("app.txt.patched").exists());
        assert!(!temp.path().join("app.txt.patch.part").exists());
    }

    #[test]
    fn test_remove_deleted() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("old.txt"), b"x").unwrap();
        let plan = UpdatePlan {
            to_delete: vec![planned("old.txt", b"x"), planned("gone.txt", b"y")],
            ..Default::default()
        };
        assert_eq!(remove_deleted(&plan, temp.path()).unwrap(), 1);
        assert!(!temp.path().join("old.txt").exists());
    }
}
