//! File content hashing for file-read dependencies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use memoir_common::ContentHash;

use crate::error::CacheError;

/// Computes content hashes of files a memoized call read.
pub struct FileHasher;

impl FileHasher {
    /// Reads a file and returns its XXH3-128 content hash.
    pub fn hash_file(path: &Path) -> Result<ContentHash, CacheError> {
        let content = std::fs::read(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(ContentHash::from_bytes(&content))
    }

    /// Returns the recorded files whose current content no longer matches.
    ///
    /// Unreadable or deleted files count as changed. The result is sorted.
    pub fn stale_files(recorded: &BTreeMap<PathBuf, ContentHash>) -> Vec<PathBuf> {
        recorded
            .iter()
            .filter(|(path, hash)| Self::hash_file(path).ok().as_ref() != Some(*hash))
            .map(|(path, _)| path.clone())
            .collect()
    }
}
