// src/server/handlers/files.rs
//! Byte-serving handlers: stored packages, version files and patches
//!
//! All three support single byte-range requests so interrupted transfers
//! resume where they stopped. The package lease travels with the response
//! body, so cleanup cannot delete the bytes while they stream.

use super::{ApiResult, CONTENT_HASH_HEADER, blocking, spawn_job};
use crate::error::Error;
use crate::hash;
use crate::registry::{LeaseGuard, Registry, VersionKey};
use crate::server::SharedState;
use crate::server::jobs::JobKind;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Parse an HTTP Range header against a file size
///
/// Only single ranges are supported: `bytes=0-1023`, `bytes=500-` and the
/// suffix form `bytes=-500`.
pub fn parse_range_header(range_header: &str, file_size: u64) -> Option<(u64, u64)> {
    let range = range_header.strip_prefix("bytes=")?;
    if range.contains(',') {
        return None;
    }

    let (first, last) = range.split_once('-')?;
    if first.is_empty() {
        // Suffix range: last N bytes
        let suffix_len: u64 = last.parse().ok()?;
        if suffix_len == 0 || suffix_len > file_size {
            return None;
        }
        return Some((file_size - suffix_len, file_size - 1));
    }

    let start: u64 = first.parse().ok()?;
    if start >= file_size {
        return None;
    }
    if last.is_empty() {
        return Some((start, file_size - 1));
    }

    let end: u64 = last.parse().ok()?;
    if start > end {
        return None;
    }
    Some((start, end.min(file_size - 1)))
}

/// Bytes to serve plus the lease protecting them
struct ServedFile {
    path: PathBuf,
    size: u64,
    hash: String,
    lease: LeaseGuard,
}

async fn stream_file(served: ServedFile, headers: &HeaderMap) -> ApiResult<Response> {
    let ServedFile {
        path,
        size,
        hash,
        lease,
    } = served;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|value| parse_range_header(value, size));

    let (status, start, len) = match range {
        Some(Some((start, end))) => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        Some(None) => {
            return Ok(Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                .header(CONTENT_HASH_HEADER, hash)
                .body(Body::empty())
                .map_err(|e| Error::Internal(e.to_string()))?);
        }
        None => (StatusCode::OK, 0, size),
    };

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }

    let stream = ReaderStream::new(file.take(len)).map(move |chunk| {
        let _held = &lease;
        chunk
    });

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, format!("\"{}\"", hash))
        .header(CONTENT_HASH_HEADER, hash);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + len - 1, size),
        );
    }
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(e.to_string()).into())
}

fn take_lease(registry: &Registry, package_id: i64, what: &str) -> crate::Result<LeaseGuard> {
    registry
        .leases()
        .acquire(package_id)
        .ok_or_else(|| Error::NotFoundError(format!("{} is being removed", what)))
}

/// GET /download/*location
///
/// Serves a stored package by its download reference.
pub async fn download_package(
    State(state): State<SharedState>,
    Path(location): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let registry = state.read().await.registry.clone();
    let served = blocking(move || {
        let (package, path) = registry.resolve_download(&location)?;
        let package_id = package.id.unwrap_or_default();
        let lease = take_lease(&registry, package_id, &location)?;
        Ok(ServedFile {
            path,
            size: package.size as u64,
            hash: package.content_hash,
            lease,
        })
    })
    .await?;
    stream_file(served, &headers).await
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub version: String,
    pub platform: String,
    #[serde(alias = "architecture")]
    pub arch: String,
    pub path: String,
}

/// GET /files/download?version=&platform=&arch=&path=
pub async fn download_file(
    State(state): State<SharedState>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let registry = state.read().await.registry.clone();
    let served = blocking(move || {
        let key = VersionKey::new(&query.version, &query.platform, &query.arch);
        let file = registry.resolve_version_file(&key, &query.path)?;
        let lease = take_lease(&registry, file.package_id, &query.path)?;
        Ok(ServedFile {
            path: file.path,
            size: file.size,
            hash: file.hash,
            lease,
        })
    })
    .await?;
    stream_file(served, &headers).await
}

#[derive(Debug, Deserialize)]
pub struct PatchQuery {
    pub from: String,
    pub to: String,
    pub platform: String,
    #[serde(alias = "architecture")]
    pub arch: String,
    pub path: String,
}

/// GET /files/patch?from=&to=&platform=&arch=&path=
///
/// Serves the cached patch when it is up to date. Otherwise queues patch
/// generation and answers 202; clients retry until the patch is ready.
pub async fn download_patch(
    State(state): State<SharedState>,
    Query(query): Query<PatchQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let registry = state.read().await.registry.clone();
    let lookup = {
        let registry = registry.clone();
        let (platform, arch, from, to, path) = (
            query.platform.clone(),
            query.arch.clone(),
            query.from.clone(),
            query.to.clone(),
            query.path.clone(),
        );
        blocking(move || {
            let Some(patch) = registry.cached_file_patch(&platform, &arch, &from, &to, &path)? else {
                return Ok(None);
            };
            let lease = take_lease(&registry, patch.package_id, &path)?;
            let hash = hash::hash_file(&patch.path)?;
            Ok(Some(ServedFile {
                path: patch.path,
                size: patch.size,
                hash,
                lease,
            }))
        })
        .await?
    };

    if let Some(served) = lookup {
        return stream_file(served, &headers).await;
    }

    let key = format!(
        "patch:{}:{}:{}:{}:{}",
        query.platform, query.arch, query.from, query.to, query.path
    );
    tracing::debug!("Queueing patch generation for {}", key);
    Ok(spawn_job(&state, key, JobKind::PatchGeneration, move || {
        let patch = registry.file_patch(&query.platform, &query.arch, &query.from, &query.to, &query.path)?;
        Ok(serde_json::json!({
            "path": query.path,
            "size": patch.size,
            "oldHash": patch.old_hash,
            "newHash": patch.new_hash,
        }))
    })
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range_header("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range_header("bytes=-100", 1000), Some((900, 999)));
        // End clamped to the file
        assert_eq!(parse_range_header("bytes=900-5000", 1000), Some((900, 999)));
    }

    #[test]
    fn test_parse_range_header_unsatisfiable() {
        assert_eq!(parse_range_header("bytes=1000-", 1000), None);
        assert_eq!(parse_range_header("bytes=5-1", 1000), None);
        assert_eq!(parse_range_header("bytes=0-1,5-9", 1000), None);
        assert_eq!(parse_range_header("items=0-1", 1000), None);
        assert_eq!(parse_range_header("bytes=-0", 1000), None);
        assert_eq!(parse_range_header("bytes=0-", 0), None);
    }
}
