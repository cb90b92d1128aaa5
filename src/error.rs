// src/error.rs

//! Error types for the distribution engine
//!
//! Every fallible library operation returns [`Result`]. Errors are grouped
//! into coarse classes (see [`ErrorClass`]) so callers such as the HTTP
//! layer and the transfer retry loop can react without matching on every
//! variant.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input, rejected before any I/O
    Validation,
    /// Missing or wrong credentials, rejected before any I/O
    Authorization,
    /// Hash or size mismatch; the offending bytes are discarded
    Integrity,
    /// Storage exhausted even after emergency cleanup
    Capacity,
    /// Unknown version, package, file or job
    NotFound,
    /// Conflicting state (e.g. a cleanup already running)
    Conflict,
    /// Disk or network failure that may succeed on retry
    TransientIo,
    /// Anything else
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Capacity => "capacity",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid package kind: {0}")]
    InvalidPackageKind(String),

    #[error("Patch packages require a source version")]
    MissingSourceVersion,

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Patch corrupt: {0}")]
    PatchCorrupt(String),

    #[error("Storage exhausted: {used} of {total} bytes used, {requested} bytes requested")]
    StorageExhausted { used: u64, total: u64, requested: u64 },

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("No backup found for {0}")]
    NoBackupFound(String),

    #[error("A cleanup run is already in progress")]
    CleanupInProgress,

    #[error("Package {0} is in use")]
    PackageInUse(i64),

    #[error("Upload offset mismatch: staged {staged} bytes, request starts at {requested}")]
    OffsetMismatch { staged: u64, requested: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Delta error: {0}")]
    DeltaError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidPackageKind(_)
            | Error::MissingSourceVersion
            | Error::UnsupportedFileType(_)
            | Error::InvalidInput(_)
            | Error::ParseError(_) => ErrorClass::Validation,
            Error::Unauthorized(_) => ErrorClass::Authorization,
            Error::ChecksumMismatch { .. } | Error::PatchCorrupt(_) => ErrorClass::Integrity,
            Error::StorageExhausted { .. } => ErrorClass::Capacity,
            Error::NotFoundError(_) | Error::NoBackupFound(_) => ErrorClass::NotFound,
            Error::CleanupInProgress
            | Error::PackageInUse(_)
            | Error::Cancelled
            | Error::OffsetMismatch { .. } => ErrorClass::Conflict,
            Error::IoError(_) | Error::Io(_) | Error::DownloadError(_) => ErrorClass::TransientIo,
            Error::DeltaError(_) | Error::DatabaseError(_) | Error::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether a transfer chunk operation failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientIo
    }
}
