// src/delta/format.rs

//! Self-describing patch container
//!
//! ```text
//! offset  size  field
//! 0       8     magic "DSPATCH1"
//! 8       8     old file size (u64, little endian)
//! 16      8     new file size (u64, little endian)
//! 24      32    SHA-256 of the old file
//! 56      32    SHA-256 of the new file
//! 88      ..    zstd frame of the new file, old file as dictionary
//! ```

use crate::error::{Error, Result};
use crate::hash;

/// Patch file magic
pub const PATCH_MAGIC: &[u8; 8] = b"DSPATCH1";

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 8 + 8 + 8 + 32 + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHeader {
    pub old_size: u64,
    pub new_size: u64,
    pub old_hash: [u8; 32],
    pub new_hash: [u8; 32],
}

impl PatchHeader {
    /// Build the header describing an (old, new) pair
    pub fn describe(old: &[u8], new: &[u8]) -> Self {
        Self {
            old_size: old.len() as u64,
            new_size: new.len() as u64,
            old_hash: hash::sha256_raw(old),
            new_hash: hash::sha256_raw(new),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(PATCH_MAGIC);
        out[8..16].copy_from_slice(&self.old_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.new_size.to_le_bytes());
        out[24..56].copy_from_slice(&self.old_hash);
        out[56..88].copy_from_slice(&self.new_hash);
        out
    }

    /// Parse the header at the start of a patch
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::PatchCorrupt(format!(
                "Patch truncated: {} bytes, header needs {}",
                data.len(),
                HEADER_LEN
            )));
        }
        if &data[0..8] != PATCH_MAGIC {
            return Err(Error::PatchCorrupt("Bad patch magic".to_string()));
        }

        let mut old_size = [0u8; 8];
        old_size.copy_from_slice(&data[8..16]);
        let mut new_size = [0u8; 8];
        new_size.copy_from_slice(&data[16..24]);
        let mut old_hash = [0u8; 32];
        old_hash.copy_from_slice(&data[24..56]);
        let mut new_hash = [0u8; 32];
        new_hash.copy_from_slice(&data[56..88]);

        Ok(Self {
            old_size: u64::from_le_bytes(old_size),
            new_size: u64::from_le_bytes(new_size),
            old_hash,
            new_hash,
        })
    }

    pub fn old_hash_hex(&self) -> String {
        hash::to_hex(&self.old_hash)
    }

    pub fn new_hash_hex(&self) -> String {
        hash::to_hex(&self.new_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = PatchHeader::describe(b"old", b"newer");
        let bytes = header.encode();
        assert_eq!(&bytes[..8], PATCH_MAGIC);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 5);
        assert_eq!(PatchHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.new_hash_hex(), hash::sha256(b"newer"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            PatchHeader::decode(b"short"),
            Err(Error::PatchCorrupt(_))
        ));
        let mut bytes = PatchHeader::describe(b"a", b"b").encode();
        bytes[0] = b'X';
        assert!(matches!(
            PatchHeader::decode(&bytes),
            Err(Error::PatchCorrupt(_))
        ));
    }
}
