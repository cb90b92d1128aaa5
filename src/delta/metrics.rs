// src/delta/metrics.rs

//! Patch size metrics and estimates

use super::format::HEADER_LEN;
use serde::Serialize;

/// Default ratio of patch size to new size above which patching is not worth it
pub const DEFAULT_MAX_PATCH_RATIO: f64 = 0.8;

/// Measured result of generating a patch
#[derive(Debug, Clone, Serialize)]
pub struct PatchMetrics {
    pub old_size: u64,
    pub new_size: u64,
    pub patch_size: u64,
    pub compression_ratio: f64,
    pub bandwidth_saved: i64,
}

impl PatchMetrics {
    /// Calculate metrics from sizes
    pub fn new(old_size: u64, new_size: u64, patch_size: u64) -> Self {
        let compression_ratio = if new_size > 0 {
            patch_size as f64 / new_size as f64
        } else {
            1.0
        };

        Self {
            old_size,
            new_size,
            patch_size,
            compression_ratio,
            bandwidth_saved: new_size as i64 - patch_size as i64,
        }
    }

    /// Get percentage of bandwidth saved
    pub fn savings_percentage(&self) -> f64 {
        if self.new_size > 0 {
            (self.bandwidth_saved as f64 / self.new_size as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Cheap size-only guess at a patch's size
///
/// Never a guarantee; only used to decide between patching and replacing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchEstimate {
    pub old_size: u64,
    pub new_size: u64,
    pub estimated_patch_size: u64,
    pub recommended: bool,
}

impl PatchEstimate {
    /// `|new - old| + new / 10 + header`, recommended when within `max_ratio` of new
    pub fn from_sizes(old_size: u64, new_size: u64, max_ratio: f64) -> Self {
        let estimated_patch_size = old_size.abs_diff(new_size) + new_size / 10 + HEADER_LEN as u64;
        let recommended = (estimated_patch_size as f64) <= max_ratio * new_size as f64;
        Self {
            old_size,
            new_size,
            estimated_patch_size,
            recommended,
        }
    }
}
