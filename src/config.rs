// src/config.rs
//! Configuration file parsing for the distribution engine
//!
//! Supports TOML configuration files with the following sections:
//! - [server] - Bind address and operator API key
//! - [storage] - Root directory, capacity quota, health thresholds
//! - [retention] - Default per-kind retention limits
//! - [planner] - Patch-vs-replace heuristics
//! - [transfer] - Chunking, retries and speed sampling
//!
//! The loaded [`EngineConfig`] is an immutable snapshot. Components receive
//! their own typed configuration through the `*_config()` accessors and never
//! read ambient state afterwards.

use crate::lifecycle::{HealthThresholds, LifecycleConfig, RetentionPolicy};
use crate::registry::RegistryConfig;
use crate::transfer::TransferConfig;
use crate::update::PlannerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct EngineConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSection,

    /// Retention defaults
    #[serde(default)]
    pub retention: RetentionSection,

    /// Update planner heuristics
    #[serde(default)]
    pub planner: PlannerSection,

    /// Transfer settings
    #[serde(default)]
    pub transfer: TransferSection,
}

/// Server configuration section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Public API bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared secret for privileged requests
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable to read the API key from (resolved at load time)
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Maximum accepted upload body size (e.g., "4GB")
    #[serde(default = "default_max_upload")]
    pub max_upload_size: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
            api_key_env: None,
            max_upload_size: default_max_upload(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_upload() -> String {
    "4GB".to_string()
}

/// Storage configuration section
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// Root directory for all storage
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Capacity quota (e.g., "500GB"); filesystem statistics are used when unset
    #[serde(default)]
    pub capacity: Option<String>,

    /// Usage ratio at which the status becomes "caution"
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Usage ratio at which cleanup is required
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: f64,

    /// Usage ratio considered critical
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Age after which temp files are deleted (e.g., "24h")
    #[serde(default = "default_temp_max_age")]
    pub temp_max_age: String,

    /// Age after which cleanup backups are pruned (e.g., "7d")
    #[serde(default = "default_backup_max_age")]
    pub backup_max_age: String,

    /// Age after which an unfinished upload is treated as abandoned
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout: String,

    /// How often the background monitor checks storage health
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: String,

    /// Allowed package file extensions
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            capacity: None,
            warning_threshold: default_warning_threshold(),
            cleanup_threshold: default_cleanup_threshold(),
            critical_threshold: default_critical_threshold(),
            temp_max_age: default_temp_max_age(),
            backup_max_age: default_backup_max_age(),
            upload_timeout: default_upload_timeout(),
            monitor_interval: default_monitor_interval(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/deltaship")
}

fn default_warning_threshold() -> f64 {
    0.70
}

fn default_cleanup_threshold() -> f64 {
    0.75
}

fn default_critical_threshold() -> f64 {
    0.85
}

fn default_temp_max_age() -> String {
    "24h".to_string()
}

fn default_backup_max_age() -> String {
    "7d".to_string()
}

fn default_upload_timeout() -> String {
    "1h".to_string()
}

fn default_monitor_interval() -> String {
    "10m".to_string()
}

/// Extensions accepted by the registry out of the box
pub fn default_allowed_extensions() -> Vec<String> {
    [
        ".zip", ".tar", ".tar.gz", ".tgz", ".exe", ".msi", ".dmg", ".pkg", ".appimage", ".deb",
        ".rpm", ".patch",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Retention configuration section
#[derive(Debug, Deserialize)]
pub struct RetentionSection {
    #[serde(default = "default_max_full")]
    pub max_full: u32,
    #[serde(default = "default_max_patch")]
    pub max_patch: u32,
    #[serde(default = "default_max_hotfix")]
    pub max_hotfix: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            max_full: default_max_full(),
            max_patch: default_max_patch(),
            max_hotfix: default_max_hotfix(),
        }
    }
}

fn default_max_full() -> u32 {
    3
}

fn default_max_patch() -> u32 {
    10
}

fn default_max_hotfix() -> u32 {
    20
}

/// Planner configuration section
#[derive(Debug, Deserialize)]
pub struct PlannerSection {
    /// Files smaller than this are always replaced
    #[serde(default = "default_min_patch_size")]
    pub min_patch_size: String,

    /// Files larger than this are always replaced
    #[serde(default = "default_max_patch_size")]
    pub max_patch_size: String,

    /// Relative size change above which files are considered too dissimilar
    #[serde(default = "default_max_size_ratio")]
    pub max_size_ratio: f64,

    /// Patch is only used when estimated size <= ratio * new size
    #[serde(default = "default_max_patch_ratio")]
    pub max_patch_ratio: f64,

    /// Reference transfer rate used for time estimates (bytes per second)
    #[serde(default = "default_reference_rate")]
    pub reference_rate: String,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            min_patch_size: default_min_patch_size(),
            max_patch_size: default_max_patch_size(),
            max_size_ratio: default_max_size_ratio(),
            max_patch_ratio: default_max_patch_ratio(),
            reference_rate: default_reference_rate(),
        }
    }
}

fn default_min_patch_size() -> String {
    "1KB".to_string()
}

fn default_max_patch_size() -> String {
    "100MB".to_string()
}

fn default_max_size_ratio() -> f64 {
    2.0
}

fn default_max_patch_ratio() -> f64 {
    0.8
}

fn default_reference_rate() -> String {
    "1MB".to_string()
}

/// Transfer configuration section
#[derive(Debug, Deserialize)]
pub struct TransferSection {
    /// Chunk size for streaming
    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,

    /// Retry attempts per chunk request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds (multiplied by the attempt number)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Number of throughput samples in the rolling speed window
    #[serde(default = "default_speed_window")]
    pub speed_window: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            speed_window: default_speed_window(),
        }
    }
}

fn default_chunk_size() -> String {
    "256KB".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_speed_window() -> usize {
    10
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.resolve_api_key()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at a storage directory, everything else default
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.root = root.into();
        config
    }

    /// Pull the API key from the configured environment variable, if any
    fn resolve_api_key(&mut self) -> Result<()> {
        if self.server.api_key.is_none()
            && let Some(var) = &self.server.api_key_env
        {
            let key = std::env::var(var)
                .with_context(|| format!("server.api_key_env names unset variable {}", var))?;
            self.server.api_key = Some(key);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;

        let s = &self.storage;
        for (name, value) in [
            ("warning_threshold", s.warning_threshold),
            ("cleanup_threshold", s.cleanup_threshold),
            ("critical_threshold", s.critical_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("storage.{} must be between 0.0 and 1.0, got {}", name, value);
            }
        }
        if !(s.warning_threshold <= s.cleanup_threshold
            && s.cleanup_threshold <= s.critical_threshold)
        {
            anyhow::bail!(
                "storage thresholds must satisfy warning <= cleanup <= critical ({} / {} / {})",
                s.warning_threshold,
                s.cleanup_threshold,
                s.critical_threshold
            );
        }

        if let Some(capacity) = &s.capacity {
            parse_size(capacity)?;
        }
        parse_duration(&s.temp_max_age)?;
        parse_duration(&s.backup_max_age)?;
        parse_duration(&s.upload_timeout)?;
        parse_duration(&s.monitor_interval)?;

        if !(0.0..=1.0).contains(&self.planner.max_patch_ratio) {
            anyhow::bail!(
                "planner.max_patch_ratio must be between 0.0 and 1.0, got {}",
                self.planner.max_patch_ratio
            );
        }
        if self.planner.max_size_ratio <= 0.0 {
            anyhow::bail!("planner.max_size_ratio must be positive");
        }
        if parse_size(&self.planner.min_patch_size)? > parse_size(&self.planner.max_patch_size)? {
            anyhow::bail!("planner.min_patch_size must be <= planner.max_patch_size");
        }
        if parse_size(&self.planner.reference_rate)? == 0 {
            anyhow::bail!("planner.reference_rate must be non-zero");
        }

        if parse_size(&self.transfer.chunk_size)? == 0 {
            anyhow::bail!("transfer.chunk_size must be non-zero");
        }
        if self.transfer.speed_window == 0 {
            anyhow::bail!("transfer.speed_window must be at least 1");
        }

        Ok(())
    }

    /// Get the storage root directory
    pub fn storage_root(&self) -> &Path {
        &self.storage.root
    }

    /// Registry settings
    pub fn registry_config(&self) -> Result<RegistryConfig> {
        Ok(RegistryConfig {
            root: self.storage.root.clone(),
            allowed_extensions: self.storage.allowed_extensions.clone(),
            upload_timeout: parse_duration(&self.storage.upload_timeout)?,
        })
    }

    /// Storage lifecycle settings
    pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
        let capacity = match &self.storage.capacity {
            Some(size) => Some(parse_size(size)?),
            None => None,
        };

        Ok(LifecycleConfig {
            thresholds: HealthThresholds {
                warning: self.storage.warning_threshold,
                cleanup: self.storage.cleanup_threshold,
                critical: self.storage.critical_threshold,
            },
            default_retention: RetentionPolicy {
                max_full: self.retention.max_full,
                max_patch: self.retention.max_patch,
                max_hotfix: self.retention.max_hotfix,
            },
            temp_max_age: parse_duration(&self.storage.temp_max_age)?,
            backup_max_age: parse_duration(&self.storage.backup_max_age)?,
            capacity,
        })
    }

    /// Update planner settings
    pub fn planner_config(&self) -> Result<PlannerConfig> {
        Ok(PlannerConfig {
            min_patch_size: parse_size(&self.planner.min_patch_size)?,
            max_patch_size: parse_size(&self.planner.max_patch_size)?,
            max_size_ratio: self.planner.max_size_ratio,
            max_patch_ratio: self.planner.max_patch_ratio,
            reference_rate: parse_size(&self.planner.reference_rate)?,
        })
    }

    /// Transfer manager settings
    pub fn transfer_config(&self) -> Result<TransferConfig> {
        Ok(TransferConfig {
            chunk_size: parse_size(&self.transfer.chunk_size)? as usize,
            max_retries: self.transfer.max_retries,
            retry_delay: Duration::from_millis(self.transfer.retry_delay_ms),
            speed_window: self.transfer.speed_window,
        })
    }

    /// Interval of the background health monitor
    pub fn monitor_interval(&self) -> Result<Duration> {
        parse_duration(&self.storage.monitor_interval)
    }

    /// Maximum upload body size in bytes
    pub fn max_upload_size(&self) -> Result<u64> {
        parse_size(&self.server.max_upload_size)
    }
}

/// Parse a human-readable size string (e.g., "700GB", "1TB", "512MB")
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("TB") {
        (n, 1024u64 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        // Assume bytes
        (s.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size number: {}", num_str))?;

    if num < 0.0 {
        anyhow::bail!("Size must not be negative: {}", s);
    }

    Ok((num * multiplier as f64) as u64)
}

/// Parse a human-readable duration string (e.g., "15m", "1h", "30s")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}
