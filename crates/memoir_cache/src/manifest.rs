//! Cache manifest: the index of every committed result.
//!
//! Stored as `manifest.json` in the cache directory. It maps each entry's
//! key digest to the full key and dependency snapshot, and carries the
//! persisted code dependency graph (which callables each callable was
//! observed to invoke).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::{CacheKey, DependencySnapshot};

/// Name of the manifest file within the cache directory.
const MANIFEST_FILE: &str = "manifest.json";

/// Scratch file a new manifest is written to before replacing the old one.
const STAGING_FILE: &str = "manifest.json.tmp";

/// Top-level cache index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Runtime version that produced this cache. Invalidate on version change.
    pub runtime_version: String,

    /// Committed entries, keyed by the hex digest of their [`CacheKey`].
    pub entries: HashMap<String, EntryRecord>,

    /// Callable → callables it was observed to invoke, across all runs.
    #[serde(default)]
    pub code_deps: BTreeMap<String, BTreeSet<String>>,
}

/// One committed memoized result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    /// The full key of the memoized call.
    pub key: CacheKey,

    /// Dependencies observed while the call ran.
    pub snapshot: DependencySnapshot,

    /// Size of the stored payload in bytes.
    pub payload_len: u64,
}

impl CacheManifest {
    /// Creates a new, empty manifest for the given runtime version.
    pub fn new(runtime_version: &str) -> Self {
        Self {
            runtime_version: runtime_version.to_string(),
            entries: HashMap::new(),
            code_deps: BTreeMap::new(),
        }
    }

    /// Loads the manifest from the cache directory.
    ///
    /// Returns `Ok(None)` if no manifest exists yet.
    pub fn try_load(cache_dir: &Path) -> Result<Option<Self>, CacheError> {
        let path = cache_dir.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CacheError::Manifest {
                path,
                reason: e.to_string(),
            })
    }

    /// Writes the manifest into `cache_dir`, creating the directory if
    /// needed.
    ///
    /// The file is written beside the manifest and renamed over it, so an
    /// interrupted save leaves the previous manifest intact.
    pub fn save(&self, cache_dir: &Path) -> Result<(), CacheError> {
        std::fs::create_dir_all(cache_dir).map_err(|e| CacheError::Io {
            path: cache_dir.to_path_buf(),
            source: e,
        })?;
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Encode {
            what: "manifest",
            reason: e.to_string(),
        })?;
        let staging = cache_dir.join(STAGING_FILE);
        std::fs::write(&staging, json).map_err(|e| CacheError::Io {
            path: staging.clone(),
            source: e,
        })?;
        let path = cache_dir.join(MANIFEST_FILE);
        std::fs::rename(&staging, &path).map_err(|e| CacheError::Io { path, source: e })
    }

    /// Returns `true` if this manifest was produced by a compatible runtime version.
    pub fn is_compatible(&self, current_version: &str) -> bool {
        self.runtime_version == current_version
    }
}
