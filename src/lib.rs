// src/lib.rs

//! Deltaship
//!
//! Incremental package distribution: publish versions of an application per
//! platform and architecture, and move installed trees between versions by
//! transferring only what changed.
//!
//! # Architecture
//!
//! - Registry: SQLite is the source of truth for versions, packages and
//!   their files; package bytes live under a single storage root
//! - Lifecycle: usage thresholds drive retention cleanup, with verified
//!   backups and rollback of removed packages
//! - Update planning: manifests are diffed and every changed file is either
//!   replaced or patched, whichever is cheaper to ship
//! - Delta: zstd dictionary patches that verify both source and result
//! - Transfer: resumable, hash-checked downloads and staged uploads with
//!   pause/resume/cancel and live progress

pub mod config;
pub mod db;
pub mod delta;
mod error;
pub mod hash;
pub mod lifecycle;
pub mod progress;
pub mod registry;
pub mod transfer;
pub mod update;

#[cfg(feature = "server")]
pub mod server;

pub use config::EngineConfig;
pub use delta::{PatchEngine, PatchEstimate, PatchMetrics};
pub use error::{Error, ErrorClass, Result};
pub use lifecycle::{HealthReport, HealthStatus, RetentionPolicy, StorageLifecycleManager};
pub use progress::{BarProgress, LogProgress, ProgressSink, SilentProgress};
pub use registry::{PackageUpload, Registry, RegistryConfig, UploadOutcome, VersionKey};
pub use transfer::{
    DownloadRequest, TransferHandle, TransferManager, TransferProgress, TransferState,
};
pub use update::{Manifest, ManifestDiff, UpdatePlan, UpdatePlanner};
