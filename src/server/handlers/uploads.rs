// src/server/handlers/uploads.rs
//! Resumable upload staging handlers
//!
//! `PUT /uploads/:name` appends the body at the offset given in
//! `X-Upload-Offset`; a wrong offset answers 409 with the staged size in the
//! same header. `HEAD` reports the staged size and hash.

use super::{ApiResult, CONTENT_HASH_HEADER, UPLOAD_OFFSET_HEADER, blocking};
use crate::error::Error;
use crate::server::SharedState;
use crate::server::auth::authorize;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};

fn upload_offset(headers: &HeaderMap) -> crate::Result<u64> {
    let value = headers
        .get(UPLOAD_OFFSET_HEADER)
        .ok_or_else(|| Error::InvalidInput(format!("Missing {} header", UPLOAD_OFFSET_HEADER)))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::InvalidInput(format!("Invalid {} header", UPLOAD_OFFSET_HEADER)))
}

async fn staging_for(state: &SharedState, headers: &HeaderMap) -> crate::Result<crate::registry::UploadStaging> {
    let guard = state.read().await;
    authorize(headers, guard.config.api_key.as_deref())?;
    Ok(guard.registry.staging())
}

/// PUT /uploads/:name
pub async fn put_chunk(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let staging = staging_for(&state, &headers).await?;
    let offset = upload_offset(&headers)?;

    let len = body.len();
    let staged = blocking(move || staging.append(&name, offset, &mut &body[..])).await?;
    tracing::debug!("Staged {} bytes at {} (now {})", len, offset, staged);

    Response::builder()
        .status(StatusCode::OK)
        .header(UPLOAD_OFFSET_HEADER, staged)
        .body(Body::empty())
        .map_err(|e| Error::Internal(e.to_string()).into())
}

/// HEAD /uploads/:name
pub async fn upload_status(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let staging = staging_for(&state, &headers).await?;
    let status = blocking(move || staging.status(&name)).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(UPLOAD_OFFSET_HEADER, status.size)
        .header(CONTENT_HASH_HEADER, status.hash)
        .body(Body::empty())
        .map_err(|e| Error::Internal(e.to_string()).into())
}

/// DELETE /uploads/:name
pub async fn discard_upload(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let staging = staging_for(&state, &headers).await?;
    let label = name.clone();
    if blocking(move || staging.discard(&name)).await? {
        tracing::info!("Discarded staged upload {}", label);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFoundError(format!("No staged upload named {}", label)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_upload_offset_header() {
        let mut headers = HeaderMap::new();
        assert!(upload_offset(&headers).is_err());
        headers.insert(UPLOAD_OFFSET_HEADER, HeaderValue::from_static("abc"));
        assert!(upload_offset(&headers).is_err());
        headers.insert(UPLOAD_OFFSET_HEADER, HeaderValue::from_static("4096"));
        assert_eq!(upload_offset(&headers).unwrap(), 4096);
    }
}
