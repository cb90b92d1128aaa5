// src/hash.rs

//! Content hashing for package and file integrity
//!
//! Every integrity decision in the engine (upload verification, manifest
//! comparison, patch self-verification, download verification) uses
//! SHA-256 rendered as lowercase hex.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

/// Buffer size used when hashing streams
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental SHA-256 hasher
///
/// Used where bytes pass through anyway (upload streaming, chunked
/// transfers) so the content hash comes for free.
#[derive(Default, Clone)]
pub struct Hasher {
    state: Sha256,
    bytes: u64,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data into the hasher
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    #[inline]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the hex digest
    pub fn finalize(self) -> String {
        format!("{:x}", self.state.finalize())
    }

    /// Finalize and return the raw digest
    pub fn finalize_raw(self) -> [u8; 32] {
        self.state.finalize().into()
    }
}

/// Compute the SHA-256 of a byte slice
#[inline]
pub fn sha256(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compute the raw SHA-256 of a byte slice
#[inline]
pub fn sha256_raw(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute the SHA-256 of everything a reader yields
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute the SHA-256 of a file, streaming its contents
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    hash_reader(&mut file)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))
}

/// Check that a string looks like a hex SHA-256 digest
pub fn is_valid_sha256(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Render a raw digest as lowercase hex
pub fn to_hex(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Verify bytes match an expected hash (case-insensitive)
pub fn verify_bytes(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256(data);
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Verify a file matches an expected hash
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
