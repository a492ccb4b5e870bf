//! Cache keys and dependency snapshots.
//!
//! A [`CacheKey`] names one memoized call: which callable (by canonical name
//! and code hash) was invoked with which canonical argument signature. A
//! [`DependencySnapshot`] records everything else the result depended on, as
//! content hashes captured while the call ran.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use memoir_common::ContentHash;
use serde::{Deserialize, Serialize};

/// Identity of one memoized call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Canonical, run-stable name of the callable (`module.qualname`).
    pub callable: String,
    /// Content hash of the callable's code when the result was recorded.
    pub code_hash: ContentHash,
    /// Hash of the canonical encoding of the argument tuple.
    pub args: ContentHash,
}

impl CacheKey {
    /// Creates a key from its three components.
    pub fn new(callable: impl Into<String>, code_hash: ContentHash, args: ContentHash) -> Self {
        Self {
            callable: callable.into(),
            code_hash,
            args,
        }
    }

    /// Content-addressed digest of the whole key.
    ///
    /// Used as the manifest key and as the payload file stem.
    pub fn digest(&self) -> ContentHash {
        ContentHash::from_parts(&[
            self.callable.as_bytes(),
            self.code_hash.as_bytes(),
            self.args.as_bytes(),
        ])
    }
}

/// Everything a memoized result was observed to depend on.
///
/// Each map associates a dependency with the content hash it had when it
/// was first read during the call. A result is valid only while every
/// recorded hash still matches the current state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    /// Global bindings read, by name.
    #[serde(default)]
    pub globals: BTreeMap<String, ContentHash>,
    /// Namespace attributes read, by qualified name (`namespace.attr`).
    #[serde(default)]
    pub attributes: BTreeMap<String, ContentHash>,
    /// Files read, by path, with their content hash.
    #[serde(default)]
    pub files: BTreeMap<PathBuf, ContentHash>,
    /// Code hash of every callable transitively invoked.
    #[serde(default)]
    pub code: BTreeMap<String, ContentHash>,
}

impl DependencySnapshot {
    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
            && self.attributes.is_empty()
            && self.files.is_empty()
            && self.code.is_empty()
    }

    /// Records a global read. The first observed hash wins.
    pub fn record_global(&mut self, name: &str, hash: ContentHash) {
        self.globals.entry(name.to_string()).or_insert(hash);
    }

    /// Records a namespace attribute read. The first observed hash wins.
    pub fn record_attribute(&mut self, qualified: &str, hash: ContentHash) {
        self.attributes.entry(qualified.to_string()).or_insert(hash);
    }

    /// Records a file read. The first observed hash wins.
    pub fn record_file(&mut self, path: &Path, hash: ContentHash) {
        self.files.entry(path.to_path_buf()).or_insert(hash);
    }

    /// Records the code hash of an invoked callable.
    pub fn record_code(&mut self, callable: &str, hash: ContentHash) {
        self.code.entry(callable.to_string()).or_insert(hash);
    }

    /// Folds a callee's dependencies into this (caller's) snapshot.
    ///
    /// Existing entries are kept: the caller observed them earlier, so their
    /// hashes describe the state the caller actually depended on.
    pub fn merge(&mut self, other: &DependencySnapshot) {
        for (k, v) in &other.globals {
            self.globals.entry(k.clone()).or_insert(*v);
        }
        for (k, v) in &other.attributes {
            self.attributes.entry(k.clone()).or_insert(*v);
        }
        for (k, v) in &other.files {
            self.files.entry(k.clone()).or_insert(*v);
        }
        for (k, v) in &other.code {
            self.code.entry(k.clone()).or_insert(*v);
        }
    }
}

/// Read access to the current state a snapshot is validated against.
///
/// Each method returns the current content hash of one dependency, or
/// `None` if it no longer exists (or cannot be hashed), which always
/// counts as a mismatch.
pub trait DependencyState {
    /// Current hash of the value bound to a global name.
    fn global_hash(&self, name: &str) -> Option<ContentHash>;
    /// Current hash of a namespace attribute (`namespace.attr`).
    fn attribute_hash(&self, qualified: &str) -> Option<ContentHash>;
    /// Current content hash of a file.
    fn file_hash(&self, path: &Path) -> Option<ContentHash>;
    /// Current code hash of a callable, if it is loaded in this run.
    fn code_hash(&self, callable: &str) -> Option<ContentHash>;
}
