//! Content digests for outputs and inputs.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// A content digest: blake3 hash plus size in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: u64,
}

impl Digest {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            hash: blake3::hash(data).to_hex().to_string(),
            size_bytes: data.len() as u64,
        }
    }

    /// Streamed digest of a file's contents.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let size_bytes = io::copy(&mut file, &mut hasher)?;
        Ok(Self {
            hash: hasher.finalize().to_hex().to_string(),
            size_bytes,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}
