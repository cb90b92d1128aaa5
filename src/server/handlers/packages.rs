// src/server/handlers/packages.rs
//! Package submission, listing and rollback handlers

use super::{ApiResult, blocking};
use crate::db::models::{Package, PackageFilter, PackageKind};
use crate::error::Error;
use crate::registry::{DeclaredFile, PackageUpload, UploadOutcome, VersionKey};
use crate::server::SharedState;
use crate::server::auth::authorize;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Metadata fields collected from the multipart form
///
/// Metadata must precede the `file` part so the submission is validated
/// before any bytes are spooled.
#[derive(Debug, Default)]
struct UploadForm {
    version: Option<String>,
    platform: Option<String>,
    arch: Option<String>,
    kind: Option<String>,
    from_version: Option<String>,
    expected_hash: Option<String>,
    is_stable: Option<bool>,
    is_critical: Option<bool>,
    files: Vec<DeclaredFile>,
    staged_upload: Option<String>,
    /// Original name of a staged package
    file_name: Option<String>,
}

fn required(value: &Option<String>, field: &str) -> crate::Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("Missing required field: {}", field)))
}

fn parse_flag(field: &str, value: &str) -> crate::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::InvalidInput(format!("Invalid {}: {}", field, other))),
    }
}

impl UploadForm {
    fn set(&mut self, name: &str, value: String) -> crate::Result<()> {
        match name {
            "version" => self.version = Some(value),
            "platform" => self.platform = Some(value),
            "arch" | "architecture" => self.arch = Some(value),
            "kind" | "type" => self.kind = Some(value),
            "fromVersion" | "from_version" => {
                self.from_version = Some(value).filter(|v| !v.trim().is_empty())
            }
            "expectedHash" | "contentHash" => self.expected_hash = Some(value.trim().to_string()),
            "isStable" => self.is_stable = Some(parse_flag(name, &value)?),
            "isCritical" => self.is_critical = Some(parse_flag(name, &value)?),
            "files" => {
                self.files = serde_json::from_str(&value)
                    .map_err(|e| Error::InvalidInput(format!("Invalid files list: {}", e)))?
            }
            "stagedUpload" | "staged_upload" => self.staged_upload = Some(value),
            "fileName" | "file_name" => self.file_name = Some(value),
            other => warn!("Ignoring unknown upload field: {}", other),
        }
        Ok(())
    }

    fn build(&self, file_name: &str) -> crate::Result<PackageUpload> {
        let key = VersionKey::new(
            &required(&self.version, "version")?,
            &required(&self.platform, "platform")?,
            &required(&self.arch, "arch")?,
        );
        let kind = PackageKind::parse(&required(&self.kind, "kind")?)?;

        let mut upload = PackageUpload::new(key, kind, file_name);
        upload.from_version = self.from_version.clone();
        upload.expected_hash = self.expected_hash.clone();
        upload.is_stable = self.is_stable;
        upload.is_critical = self.is_critical;
        upload.files = self.files.clone();
        Ok(upload)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub package_id: i64,
    pub download_reference: String,
    pub content_hash: String,
    pub size: i64,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_id: Option<i64>,
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> Error {
    Error::InvalidInput(format!("Malformed multipart body: {}", e))
}

/// POST /packages
///
/// Multipart form with `version`, `platform`, `arch`, `kind`, optional
/// `fromVersion`, `expectedHash`, `isStable`, `isCritical`, `files` (JSON
/// list of declared files) and either a `file` part or a `stagedUpload` name
/// (with an optional `fileName` to record instead of the staged name).
///
/// Returns 201 for a new package, 200 when identical content already exists
/// and 409 when the name is taken by different content.
pub async fn upload_package(
    State(state): State<SharedState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let (registry, lifecycle) = {
        let guard = state.read().await;
        authorize(&headers, guard.config.api_key.as_deref())?;
        (guard.registry.clone(), guard.lifecycle.clone())
    };

    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let mut form = UploadForm::default();
    let mut spooled: Option<(PackageUpload, tempfile::NamedTempFile)> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name != "file" && name != "package" {
            let value = field.text().await.map_err(multipart_error)?;
            form.set(&name, value)?;
            continue;
        }
        if spooled.is_some() {
            return Err(Error::InvalidInput("Only one file part is allowed".to_string()).into());
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let upload = form.build(&file_name)?;
        registry.validate_upload(&upload)?;

        let temp_dir = registry.layout().temp_dir();
        let capacity = lifecycle.clone();
        let temp = blocking(move || {
            capacity.ensure_capacity(declared_length)?;
            std::fs::create_dir_all(&temp_dir)?;
            Ok(tempfile::Builder::new().prefix("upload-").tempfile_in(&temp_dir)?)
        })
        .await?;

        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .await?;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);
        spooled = Some((upload, temp));
    }

    let outcome = match spooled {
        Some((upload, temp)) => {
            blocking(move || {
                let mut file = temp.reopen()?;
                registry.register_package(&upload, &mut file)
            })
            .await?
        }
        None => {
            let staged = form.staged_upload.clone().ok_or_else(|| {
                Error::InvalidInput("Missing file part or stagedUpload name".to_string())
            })?;
            let upload = form.build(form.file_name.as_deref().unwrap_or(&staged))?;
            registry.validate_upload(&upload)?;
            let capacity = lifecycle.clone();
            blocking(move || {
                let staged_size = registry.staging().staged_size(&staged)?;
                capacity.ensure_capacity(staged_size)?;
                registry.register_staged(&upload, &staged)
            })
            .await?
        }
    };

    let cleanup_id = match &outcome {
        UploadOutcome::Uploaded(package) => {
            let package = package.clone();
            match blocking(move || lifecycle.after_upload(&package)).await {
                Ok(record) => record.and_then(|r| r.id),
                Err(e) => {
                    // The package is stored; retention catches up on the next run
                    warn!("Post-upload lifecycle check failed: {}", e);
                    None
                }
            }
        }
        _ => None,
    };

    let status = match &outcome {
        UploadOutcome::Uploaded(_) => StatusCode::CREATED,
        UploadOutcome::Skipped(_) => StatusCode::OK,
        UploadOutcome::Conflict(_) => StatusCode::CONFLICT,
    };
    let package = outcome.package();
    info!(
        "Upload of {} finished: {} (package {})",
        package.name,
        outcome.as_str(),
        package.id.unwrap_or_default()
    );

    let body = UploadResponse {
        package_id: package.id.unwrap_or_default(),
        download_reference: package.download_reference.clone(),
        content_hash: package.content_hash.clone(),
        size: package.size,
        outcome: outcome.as_str(),
        cleanup_id,
    };
    Ok((status, Json(body)).into_response())
}

/// GET /packages
pub async fn list_packages(
    State(state): State<SharedState>,
    Query(filter): Query<PackageFilter>,
) -> ApiResult<Json<Vec<Package>>> {
    let registry = state.read().await.registry.clone();
    Ok(Json(blocking(move || registry.list_packages(&filter)).await?))
}

/// GET /packages/:id
pub async fn get_package(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Package>> {
    let registry = state.read().await.registry.clone();
    Ok(Json(blocking(move || registry.get_package(id)).await?))
}

/// POST /packages/:id/rollback
pub async fn rollback_package(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Package>> {
    let lifecycle = {
        let guard = state.read().await;
        authorize(&headers, guard.config.api_key.as_deref())?;
        guard.lifecycle.clone()
    };
    let package = blocking(move || lifecycle.rollback(id)).await?;
    info!("Package {} rolled back", id);
    Ok(Json(package))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_builds_upload() {
        let mut form = UploadForm::default();
        form.set("version", "2.0.0".into()).unwrap();
        form.set("platform", "windows".into()).unwrap();
        form.set("arch", "x64".into()).unwrap();
        form.set("kind", "Patch".into()).unwrap();
        form.set("fromVersion", "1.9.0".into()).unwrap();
        form.set("isCritical", "true".into()).unwrap();

        let upload = form.build("app.zip").unwrap();
        assert_eq!(upload.kind, PackageKind::Patch);
        assert_eq!(upload.from_version.as_deref(), Some("1.9.0"));
        assert_eq!(upload.is_critical, Some(true));
        assert_eq!(upload.key.architecture, "x64");
    }

    #[test]
    fn test_form_rejects_missing_and_bad_fields() {
        let mut form = UploadForm::default();
        form.set("version", "2.0.0".into()).unwrap();
        assert!(matches!(form.build("app.zip"), Err(Error::InvalidInput(_))));

        assert!(form.set("isStable", "maybe".into()).is_err());
        assert!(form.set("files", "not json".into()).is_err());

        form.set("platform", "linux".into()).unwrap();
        form.set("arch", "arm64".into()).unwrap();
        form.set("kind", "bogus".into()).unwrap();
        assert!(matches!(
            form.build("app.zip"),
            Err(Error::InvalidPackageKind(_))
        ));
    }
}
