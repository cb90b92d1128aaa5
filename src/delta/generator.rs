// src/delta/generator.rs

//! Patch generator using zstd dictionary compression
//!
//! The new file is compressed with the old file as a raw-content dictionary,
//! so regions shared with the old file cost only back-references.

use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use super::format::PatchHeader;
use super::PatchMetrics;

/// Patch generator
pub struct PatchGenerator {
    level: i32,
}

impl PatchGenerator {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Produce a self-verifying patch that rebuilds `new` from `old`
    pub fn generate(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        debug!("Old version: {} bytes, New version: {} bytes", old.len(), new.len());

        let header = PatchHeader::describe(old, new);
        let mut patch = header.encode().to_vec();

        let body = if old.is_empty() {
            zstd::encode_all(new, self.level)
                .map_err(|e| Error::DeltaError(format!("Failed to compress: {}", e)))?
        } else {
            self.compress_with_dictionary(new, old)?
        };
        patch.extend_from_slice(&body);
        Ok(patch)
    }

    /// Generate a patch between two files and write it to `output_path`
    pub fn generate_file(
        &self,
        old_path: &Path,
        new_path: &Path,
        output_path: &Path,
    ) -> Result<PatchMetrics> {
        info!(
            "Generating patch {} -> {}",
            old_path.display(),
            new_path.display()
        );

        let old = fs::read(old_path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", old_path.display(), e)))?;
        let new = fs::read(new_path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", new_path.display(), e)))?;

        let patch = self.generate(&old, &new)?;
        write_atomic(output_path, &patch)?;

        let metrics = PatchMetrics::new(old.len() as u64, new.len() as u64, patch.len() as u64);
        info!(
            "Patch generated: {} bytes ({:.1}% of original, {:.1}% saved)",
            metrics.patch_size,
            metrics.compression_ratio * 100.0,
            metrics.savings_percentage()
        );
        Ok(metrics)
    }

    /// Compress data using dictionary compression
    fn compress_with_dictionary(&self, data: &[u8], dictionary: &[u8]) -> Result<Vec<u8>> {
        let encoder_dict = zstd::dict::EncoderDictionary::copy(dictionary, self.level);

        let mut encoder = zstd::Encoder::with_prepared_dictionary(Vec::new(), &encoder_dict)
            .map_err(|e| Error::DeltaError(format!("Failed to create encoder: {}", e)))?;

        // Allow back-references across the whole dictionary
        let window_log = window_log_for(dictionary.len() + data.len());
        encoder
            .window_log(window_log)
            .map_err(|e| Error::DeltaError(format!("Failed to set window: {}", e)))?;

        encoder
            .write_all(data)
            .map_err(|e| Error::DeltaError(format!("Failed to write data: {}", e)))?;

        encoder
            .finish()
            .map_err(|e| Error::DeltaError(format!("Failed to finish compression: {}", e)))
    }
}

/// Smallest window (log2) covering `len` bytes, within zstd's limits
pub(crate) fn window_log_for(len: usize) -> u32 {
    let needed = usize::BITS - len.max(1).leading_zeros();
    needed.clamp(10, 27)
}

/// Write bytes next to the target, then rename into place
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {}", temp_path.display(), e)))?;
    file.write_all(data)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", temp_path.display(), e)))?;
    file.sync_all()?;

    fs::rename(&temp_path, path)
        .map_err(|e| Error::IoError(format!("Failed to rename into {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_log_bounds() {
        assert_eq!(window_log_for(0), 10);
        assert_eq!(window_log_for(1 << 20), 21);
        assert_eq!(window_log_for(usize::MAX), 27);
    }
}
