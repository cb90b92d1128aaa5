// src/transfer/remote.rs
//! Transfer remotes
//!
//! A remote serves byte ranges of version files and patches, and accepts
//! chunked uploads into its staging area:
//! - `HttpRemote` talks to a deltaship server
//! - `RegistryRemote` reads straight from a local registry

use crate::error::{Error, Result};
use crate::registry::{Registry, StagedUpload, VersionKey};
use async_trait::async_trait;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Something a remote can serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteObject {
    /// A file of a version's tree
    File { version: String, path: String },
    /// The patch between two versions of a file
    Patch {
        from: String,
        to: String,
        path: String,
    },
}

impl RemoteObject {
    pub fn path(&self) -> &str {
        match self {
            RemoteObject::File { path, .. } | RemoteObject::Patch { path, .. } => path,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read up to `len` bytes starting at `offset`
    ///
    /// Returns fewer bytes (possibly none) at the end of the object.
    async fn read_range(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Staged size and hash of an upload, `None` when nothing is staged
    async fn upload_status(&self, name: &str) -> Result<Option<StagedUpload>>;

    /// Append a chunk that starts at `offset`; returns the new staged size
    async fn write_chunk(&self, name: &str, offset: u64, data: Vec<u8>) -> Result<u64>;

    /// Human-readable name for logging
    fn name(&self) -> &str;
}

/// Server-backed remote
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    platform: String,
    architecture: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, platform: &str, architecture: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            platform: platform.to_string(),
            architecture: architecture.to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    fn object_request(&self, object: &RemoteObject) -> reqwest::RequestBuilder {
        match object {
            RemoteObject::File { version, path } => self
                .client
                .get(format!("{}/files/download", self.base_url))
                .query(&[
                    ("version", version.as_str()),
                    ("platform", self.platform.as_str()),
                    ("arch", self.architecture.as_str()),
                    ("path", path.as_str()),
                ]),
            RemoteObject::Patch { from, to, path } => self
                .client
                .get(format!("{}/files/patch", self.base_url))
                .query(&[
                    ("from", from.as_str()),
                    ("to", to.as_str()),
                    ("platform", self.platform.as_str()),
                    ("arch", self.architecture.as_str()),
                    ("path", path.as_str()),
                ]),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }
}

/// Map an HTTP failure status to the error taxonomy
pub fn status_error(status: reqwest::StatusCode, context: &str) -> Error {
    match status.as_u16() {
        400 => Error::InvalidInput(format!("{context}: HTTP {status}")),
        401 | 403 => Error::Unauthorized(format!("{context}: HTTP {status}")),
        404 => Error::NotFoundError(context.to_string()),
        422 => Error::ChecksumMismatch {
            expected: context.to_string(),
            actual: format!("HTTP {status}"),
        },
        507 => Error::StorageExhausted {
            used: 0,
            total: 0,
            requested: 0,
        },
        _ => Error::DownloadError(format!("{context}: HTTP {status}")),
    }
}

fn offset_header(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("X-Upload-Offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn read_range(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset + len - 1;
        let response = self
            .object_request(object)
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to fetch {}: {e}", object.path())))?;

        let status = response.status();
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        // Patch generation was queued; the retry loop asks again
        if status == reqwest::StatusCode::ACCEPTED {
            return Err(Error::DownloadError(format!(
                "{} is still being prepared",
                object.path()
            )));
        }
        if !status.is_success() {
            return Err(status_error(status, object.path()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to read {}: {e}", object.path())))?;

        // A server ignoring the range sends the whole object
        if status == reqwest::StatusCode::OK {
            let start = (offset as usize).min(body.len());
            let stop = (start + len as usize).min(body.len());
            return Ok(body[start..stop].to_vec());
        }
        Ok(body.to_vec())
    }

    async fn upload_status(&self, name: &str) -> Result<Option<StagedUpload>> {
        let url = format!("{}/uploads/{}", self.base_url, name);
        let response = self
            .authorized(self.client.head(&url))
            .send()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to query upload {name}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response.status(), name));
        }

        let size = offset_header(&response).unwrap_or(0);
        let hash = response
            .headers()
            .get("X-Content-Hash")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Some(StagedUpload {
            name: name.to_string(),
            size,
            hash,
        }))
    }

    async fn write_chunk(&self, name: &str, offset: u64, data: Vec<u8>) -> Result<u64> {
        let url = format!("{}/uploads/{}", self.base_url, name);
        let len = data.len() as u64;
        let response = self
            .authorized(self.client.put(&url))
            .header("X-Upload-Offset", offset.to_string())
            .body(data)
            .send()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to upload chunk of {name}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let staged = offset_header(&response).unwrap_or(0);
            return Err(Error::OffsetMismatch {
                staged,
                requested: offset,
            });
        }
        if !status.is_success() {
            return Err(status_error(status, name));
        }
        Ok(offset_header(&response).unwrap_or(offset + len))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Remote reading directly from a registry on the same machine
#[derive(Clone)]
pub struct RegistryRemote {
    registry: Registry,
    platform: String,
    architecture: String,
}

impl RegistryRemote {
    pub fn new(registry: Registry, platform: &str, architecture: &str) -> Self {
        Self {
            registry,
            platform: platform.to_string(),
            architecture: architecture.to_string(),
        }
    }

    fn read_file_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = File::open(path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", path.display())))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len.min(8 * 1024 * 1024) as usize);
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn blocking_read(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>> {
        let (path, package_id) = match object {
            RemoteObject::File { version, path } => {
                let key = VersionKey::new(version, &self.platform, &self.architecture);
                let file = self.registry.resolve_version_file(&key, path)?;
                (file.path, file.package_id)
            }
            RemoteObject::Patch { from, to, path } => {
                let patch = self
                    .registry
                    .file_patch(&self.platform, &self.architecture, from, to, path)?;
                (patch.path, patch.package_id)
            }
        };

        // Hold a lease so cleanup cannot remove the bytes mid-read
        let _lease = self
            .registry
            .leases()
            .acquire(package_id)
            .ok_or_else(|| Error::NotFoundError(format!("{} is being removed", object.path())))?;
        debug!("Reading {} bytes of {} at {}", len, path.display(), offset);
        Self::read_file_range(&path, offset, len)
    }
}

#[async_trait]
impl RemoteStore for RegistryRemote {
    async fn read_range(&self, object: &RemoteObject, offset: u64, len: u64) -> Result<Vec<u8>> {
        let this = self.clone();
        let object = object.clone();
        tokio::task::spawn_blocking(move || this.blocking_read(&object, offset, len))
            .await
            .map_err(|e| Error::Internal(format!("Read task failed: {e}")))?
    }

    async fn upload_status(&self, name: &str) -> Result<Option<StagedUpload>> {
        let staging = self.registry.staging();
        match staging.status(name) {
            Ok(status) => Ok(Some(status)),
            Err(Error::NotFoundError(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_chunk(&self, name: &str, offset: u64, data: Vec<u8>) -> Result<u64> {
        let staging = self.registry.staging();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || staging.append(&name, offset, &mut data.as_slice()))
            .await
            .map_err(|e| Error::Internal(format!("Write task failed: {e}")))?
    }

    fn name(&self) -> &str {
        "registry"
    }
}
