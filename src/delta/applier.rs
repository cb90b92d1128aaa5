// src/delta/applier.rs

//! Patch applier to reconstruct the new file from the old file + patch
//!
//! Every check runs against in-memory bytes before anything is written, so
//! a corrupt patch can never clobber the original.

use crate::error::{Error, Result};
use crate::hash;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use super::format::{HEADER_LEN, PatchHeader};
use super::generator::write_atomic;

/// Patch applier
#[derive(Default)]
pub struct PatchApplier;

impl PatchApplier {
    pub fn new() -> Self {
        Self
    }

    /// Rebuild the new bytes, verifying sizes and hashes from the header
    pub fn apply(&self, old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        let header = PatchHeader::decode(patch)?;

        if header.old_size != old.len() as u64 {
            return Err(Error::PatchCorrupt(format!(
                "Patch expects a {} byte source, got {} bytes",
                header.old_size,
                old.len()
            )));
        }
        if hash::sha256_raw(old) != header.old_hash {
            return Err(Error::PatchCorrupt(
                "Source file does not match the patch's source hash".to_string(),
            ));
        }

        let body = &patch[HEADER_LEN..];
        let new = if old.is_empty() {
            decode_bounded(zstd::Decoder::new(body), header.new_size)?
        } else {
            let decoder_dict = zstd::dict::DecoderDictionary::copy(old);
            decode_bounded(
                zstd::Decoder::with_prepared_dictionary(body, &decoder_dict),
                header.new_size,
            )?
        };
        debug!("New version reconstructed: {} bytes", new.len());

        if new.len() as u64 != header.new_size {
            return Err(Error::PatchCorrupt(format!(
                "Reconstructed {} bytes, patch declares {}",
                new.len(),
                header.new_size
            )));
        }
        if hash::sha256_raw(&new) != header.new_hash {
            return Err(Error::PatchCorrupt(format!(
                "Reconstructed content hash {} does not match {}",
                hash::sha256(&new),
                header.new_hash_hex()
            )));
        }

        Ok(new)
    }

    /// Apply a patch file to `old_path`, writing the verified result to `output_path`
    ///
    /// `output_path` may equal `old_path`; the original is only replaced after
    /// verification succeeds. Returns the hash of the new file.
    pub fn apply_file(&self, old_path: &Path, patch_path: &Path, output_path: &Path) -> Result<String> {
        info!(
            "Applying patch {} to {}",
            patch_path.display(),
            old_path.display()
        );

        let old = fs::read(old_path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", old_path.display(), e)))?;
        let patch = fs::read(patch_path).map_err(|e| {
            Error::IoError(format!("Failed to read patch {}: {}", patch_path.display(), e))
        })?;

        let new = self.apply(&old, &patch)?;
        write_atomic(output_path, &new)?;

        info!(
            "Patch applied successfully: {} bytes -> {} bytes",
            old.len(),
            new.len()
        );
        Ok(hash::sha256(&new))
    }
}

/// Decompress at most `expected + 1` bytes so a lying header cannot exhaust memory
fn decode_bounded<R: Read>(decoder: std::io::Result<R>, expected: u64) -> Result<Vec<u8>> {
    let decoder =
        decoder.map_err(|e| Error::PatchCorrupt(format!("Failed to create decoder: {}", e)))?;

    let mut out = Vec::with_capacity(expected.min(64 * 1024 * 1024) as usize);
    decoder
        .take(expected.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::PatchCorrupt(format!("Failed to decode patch body: {}", e)))?;
    Ok(out)
}
