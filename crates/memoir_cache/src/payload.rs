//! On-disk result payloads.
//!
//! Every committed result lives in `<cache_dir>/results/<digest>.memo`, where
//! `<digest>` is the hex digest of its [`CacheKey`](crate::CacheKey). The file
//! starts with a little-endian `u32` header length and a bincode
//! [`PayloadHeader`], followed by the codec's bytes. The header checksum is
//! verified on every read.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use memoir_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

const RESULTS_DIR: &str = "results";
const EXTENSION: &str = "memo";
const MAGIC: [u8; 4] = *b"MEMO";

/// Layout version of payload files.
pub const PAYLOAD_FORMAT: u32 = 1;

/// Fixed prefix of every payload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadHeader {
    /// Always `b"MEMO"`.
    pub magic: [u8; 4],
    /// [`PAYLOAD_FORMAT`] at the time of writing.
    pub format: u32,
    /// Host runtime that encoded the value.
    pub runtime_version: String,
    /// Hash of the bytes following the header.
    pub checksum: ContentHash,
}

impl PayloadHeader {
    fn for_bytes(bytes: &[u8], runtime_version: &str) -> Self {
        Self {
            magic: MAGIC,
            format: PAYLOAD_FORMAT,
            runtime_version: runtime_version.to_string(),
            checksum: ContentHash::from_bytes(bytes),
        }
    }
}

/// The `results/` directory of one cache.
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    /// A store under `cache_dir`. Nothing is created until the first write.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join(RESULTS_DIR),
        }
    }

    /// Path of the payload for `digest`.
    pub fn path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.{EXTENSION}"))
    }

    /// Writes `bytes` as the payload for `digest`, replacing any previous one.
    pub fn write(&self, digest: &str, bytes: &[u8], runtime_version: &str) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let header = bincode::serde::encode_to_vec(
            PayloadHeader::for_bytes(bytes, runtime_version),
            bincode::config::standard(),
        )
        .map_err(|e| CacheError::Encode {
            what: "payload header",
            reason: e.to_string(),
        })?;

        let mut file = Vec::with_capacity(4 + header.len() + bytes.len());
        file.extend_from_slice(&(header.len() as u32).to_le_bytes());
        file.extend_from_slice(&header);
        file.extend_from_slice(bytes);

        let path = self.path(digest);
        std::fs::write(&path, file).map_err(|source| CacheError::Io { path, source })
    }

    /// Reads the payload for `digest` and checks it against its header.
    pub fn load(&self, digest: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path(digest);
        let raw = std::fs::read(&path).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        let damaged = |reason: String| CacheError::DamagedPayload {
            path: path.clone(),
            reason,
        };

        let (len_prefix, rest) = raw
            .split_first_chunk::<4>()
            .ok_or_else(|| damaged("missing header length".to_string()))?;
        let header_len = u32::from_le_bytes(*len_prefix) as usize;
        if rest.len() < header_len {
            return Err(damaged(format!(
                "header claims {header_len} bytes, file has {}",
                rest.len()
            )));
        }
        let (header_bytes, body) = rest.split_at(header_len);
        let (header, _): (PayloadHeader, usize) =
            bincode::serde::decode_from_slice(header_bytes, bincode::config::standard())
                .map_err(|e| damaged(e.to_string()))?;

        if header.magic != MAGIC {
            return Err(damaged("not a memoir payload".to_string()));
        }
        if header.format != PAYLOAD_FORMAT {
            return Err(CacheError::PayloadFormat {
                path,
                found: header.format,
                supported: PAYLOAD_FORMAT,
            });
        }
        let computed = ContentHash::from_bytes(body);
        if computed != header.checksum {
            return Err(CacheError::PayloadChecksum {
                path,
                recorded: header.checksum.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(body.to_vec())
    }

    /// Like [`PayloadStore::load`], but any failure reads as absent.
    pub fn read(&self, digest: &str) -> Option<Vec<u8>> {
        self.load(digest)
            .inspect_err(|e| tracing::debug!(digest, error = %e, "payload unreadable"))
            .ok()
    }

    /// Deletes the payload for `digest`, if there is one.
    pub fn remove(&self, digest: &str) -> Result<(), CacheError> {
        let path = self.path(digest);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(CacheError::Io { path, source: e })
            }
            _ => Ok(()),
        }
    }

    /// Deletes every payload whose digest is not in `live`.
    ///
    /// Returns the number of files deleted.
    pub fn retain(&self, live: &HashSet<&str>) -> Result<usize, CacheError> {
        let listing = match std::fs::read_dir(&self.dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut deleted = 0;
        for entry in listing {
            let path = entry
                .map_err(|source| CacheError::Io {
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(digest) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !live.contains(digest) {
                std::fs::remove_file(&path).map_err(|source| CacheError::Io {
                    path: path.clone(),
                    source,
                })?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
