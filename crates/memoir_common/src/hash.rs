//! Content hashing for cache keys, argument signatures and dependency snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 128-bit content hash computed using XXH3.
///
/// Two values with the same `ContentHash` are assumed to be identical. Used
/// for code hashes, canonical argument signatures, the recorded value of
/// every global read, and file contents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Computes a content hash from a byte slice using XXH3-128.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Hashes several byte slices as one unambiguous sequence.
    ///
    /// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
    /// produce different hashes.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = ContentHasher::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finish()
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Streaming XXH3-128 hasher producing a [`ContentHash`].
pub struct ContentHasher {
    inner: xxhash_rust::xxh3::Xxh3,
}

impl ContentHasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self {
            inner: xxhash_rust::xxh3::Xxh3::new(),
        }
    }

    /// Feeds one length-prefixed part into the hash.
    pub fn update(&mut self, part: &[u8]) {
        self.inner.update(&(part.len() as u64).to_le_bytes());
        self.inner.update(part);
    }

    /// Finishes hashing.
    pub fn finish(&self) -> ContentHash {
        ContentHash(self.inner.digest128().to_le_bytes())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}
