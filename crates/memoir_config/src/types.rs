//! Configuration types deserialized from `memoir.toml`.

use serde::Deserialize;
use std::path::PathBuf;

/// The top-level runtime configuration parsed from `memoir.toml`.
///
/// Every table is optional; an absent file yields [`MemoConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoConfig {
    /// Persistent cache location and switches.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Cacheability policy overrides.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Callables that are never memoized.
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

/// Where and whether results are persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache directory, relative to the program's directory unless absolute.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Master switch. When `false`, calls always execute and nothing is stored.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Runtime version stamped into the manifest. A cache written by a
    /// different version is discarded on load.
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            enabled: true,
            runtime_version: default_runtime_version(),
        }
    }
}

/// Overrides for the value-kind cacheability classification.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Exact type names whose instances are never cached.
    #[serde(default = "default_deny_types")]
    pub deny_types: Vec<String>,
    /// Exact type names of opaque foreign objects that round-trip faithfully.
    #[serde(default)]
    pub allow_types: Vec<String>,
    /// Natively-implemented method names that mutate their receiver.
    #[serde(default = "default_native_mutators")]
    pub native_mutators: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            deny_types: default_deny_types(),
            allow_types: Vec::new(),
            native_mutators: default_native_mutators(),
        }
    }
}

/// Callables excluded from memoization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgnoreConfig {
    /// Filename prefixes; code units defined under them are never memoized.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Exact canonical names (`module.qualname`) never memoized.
    #[serde(default)]
    pub names: Vec<String>,
}

impl IgnoreConfig {
    /// Returns `true` if a code unit from `filename` named `canonical_name`
    /// is excluded by this configuration.
    pub fn excludes(&self, filename: &str, canonical_name: &str) -> bool {
        self.paths.iter().any(|p| filename.starts_with(p.as_str()))
            || self.names.iter().any(|n| n == canonical_name)
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".memoir-cache")
}

fn default_true() -> bool {
    true
}

fn default_runtime_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_deny_types() -> Vec<String> {
    vec!["sqlite3.Cursor".to_string()]
}

fn default_native_mutators() -> Vec<String> {
    [
        "append",
        "extend",
        "insert",
        "pop",
        "remove",
        "clear",
        "sort",
        "reverse",
        "update",
        "setdefault",
        "popitem",
        "add",
        "discard",
        "difference_update",
        "intersection_update",
        "symmetric_difference_update",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
