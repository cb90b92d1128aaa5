// src/delta/mod.rs

//! Binary patch engine
//!
//! Produces and applies compact deltas between two versions of the same
//! logical file using zstd dictionary compression.
//!
//! # Architecture
//!
//! - **PatchGenerator**: compresses the new file with the old file as dictionary
//! - **PatchApplier**: decompresses with the old file and verifies the result
//! - **PatchEstimate**: size-only heuristic used by the update planner
//!
//! # Patch Format
//!
//! See [`format`]. The header embeds old/new sizes and hashes, so a patch is
//! self-verifying: applying it to the wrong source or a damaged patch fails
//! with `PatchCorrupt` before any output is written.

mod applier;
pub mod format;
mod generator;
mod metrics;

pub use applier::PatchApplier;
pub use format::{HEADER_LEN, PATCH_MAGIC, PatchHeader};
pub use generator::PatchGenerator;
pub use metrics::{DEFAULT_MAX_PATCH_RATIO, PatchEstimate, PatchMetrics};

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Default zstd compression level (3 = fast, good compression)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Facade over generation, application and estimation
#[derive(Debug, Clone, Copy)]
pub struct PatchEngine {
    level: i32,
    max_patch_ratio: f64,
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_PATCH_RATIO)
    }
}

impl PatchEngine {
    pub fn new(level: i32, max_patch_ratio: f64) -> Self {
        Self {
            level,
            max_patch_ratio,
        }
    }

    /// Estimate from sizes alone
    pub fn estimate_sizes(&self, old_size: u64, new_size: u64) -> PatchEstimate {
        PatchEstimate::from_sizes(old_size, new_size, self.max_patch_ratio)
    }

    /// Estimate from two files on disk (reads metadata only)
    pub fn estimate(&self, old_path: &Path, new_path: &Path) -> Result<PatchEstimate> {
        let old_size = file_len(old_path)?;
        let new_size = file_len(new_path)?;
        Ok(self.estimate_sizes(old_size, new_size))
    }

    pub fn create_patch(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        PatchGenerator::new(self.level).generate(old, new)
    }

    pub fn apply_patch(&self, old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        PatchApplier::new().apply(old, patch)
    }

    pub fn create_patch_file(&self, old: &Path, new: &Path, output: &Path) -> Result<PatchMetrics> {
        PatchGenerator::new(self.level).generate_file(old, new, output)
    }

    pub fn apply_patch_file(&self, old: &Path, patch: &Path, output: &Path) -> Result<String> {
        PatchApplier::new().apply_file(old, patch, output)
    }
}

fn file_len(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::NotFoundError(format!("{}: {}", path.display(), e)))
}
