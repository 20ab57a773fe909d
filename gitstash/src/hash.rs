//! SHA-256 digest helpers.
//!
//! All checksums in the protocol are SHA-256 rendered as lowercase hex.
//! The streaming form lets callers hash bytes as they pass through I/O
//! without buffering the whole payload.

use sha2::{Digest, Sha256};

/// Incrementally hashes a byte stream, tracking the total length.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    length: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next run of bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.length += bytes.len() as u64;
    }

    /// Finalizes the digest, returning the lowercase hex checksum and the
    /// total number of bytes hashed.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.length)
    }
}

/// Hashes a complete in-memory buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
