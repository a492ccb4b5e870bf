//! High-level memoization cache.
//!
//! The `Cache` type ties the manifest and payload store together. It
//! validates stored results against the current dependency state, commits
//! new results, and keeps reverse indices from global bindings, attributes,
//! files and code units to the entries that depend on them so that writes
//! and code reloads invalidate without scanning the whole cache.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use memoir_common::ContentHash;

use crate::error::CacheError;
use crate::key::{CacheKey, DependencySnapshot, DependencyState};
use crate::manifest::{CacheManifest, EntryRecord};
use crate::payload::PayloadStore;

/// A validated cache hit.
#[derive(Debug, Clone)]
pub struct CachedResult {
    /// The encoded return value.
    pub payload: Vec<u8>,
    /// Dependencies the stored result was recorded with.
    pub snapshot: DependencySnapshot,
}

/// Why a lookup did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// No entry exists for the key.
    NotFound,
    /// A global binding's current value differs from the recorded one.
    GlobalChanged(String),
    /// A namespace attribute's current value differs from the recorded one.
    AttributeChanged(String),
    /// A file read by the call has changed or disappeared.
    FileChanged(PathBuf),
    /// A transitively invoked callable's code changed or is not loaded.
    CodeChanged(String),
    /// The stored payload is missing or failed validation.
    PayloadUnreadable,
}

/// Outcome of [`Cache::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// The entry exists and every recorded dependency is unchanged.
    Hit(CachedResult),
    /// The caller must execute the call.
    Miss(MissReason),
}

/// Persistent store of memoized results for one program.
pub struct Cache {
    cache_dir: PathBuf,
    manifest: CacheManifest,
    store: PayloadStore,
    runtime_version: String,
    by_global: HashMap<String, HashSet<String>>,
    by_attribute: HashMap<String, HashSet<String>>,
    by_file: HashMap<PathBuf, HashSet<String>>,
    by_code: HashMap<String, HashSet<String>>,
    dirty: bool,
}

impl Cache {
    /// Loads an existing cache or creates a fresh one.
    ///
    /// A missing or version-incompatible manifest yields an empty cache. A
    /// manifest that exists but cannot be read or parsed is an error; the
    /// store is left untouched so it is not overwritten on the next save.
    pub fn load_or_create(cache_dir: &Path, runtime_version: &str) -> Result<Self, CacheError> {
        let manifest = match CacheManifest::try_load(cache_dir)? {
            Some(m) if m.is_compatible(runtime_version) => m,
            Some(m) => {
                tracing::info!(
                    recorded = %m.runtime_version,
                    current = runtime_version,
                    "runtime version changed, starting a fresh cache"
                );
                CacheManifest::new(runtime_version)
            }
            None => CacheManifest::new(runtime_version),
        };

        let mut cache = Self {
            cache_dir: cache_dir.to_path_buf(),
            manifest,
            store: PayloadStore::new(cache_dir),
            runtime_version: runtime_version.to_string(),
            by_global: HashMap::new(),
            by_attribute: HashMap::new(),
            by_file: HashMap::new(),
            by_code: HashMap::new(),
            dirty: false,
        };
        cache.rebuild_index();
        tracing::debug!(
            dir = %cache_dir.display(),
            entries = cache.manifest.entries.len(),
            "cache loaded"
        );
        Ok(cache)
    }

    fn rebuild_index(&mut self) {
        self.by_global.clear();
        self.by_attribute.clear();
        self.by_file.clear();
        self.by_code.clear();
        let digests: Vec<(String, String, DependencySnapshot)> = self
            .manifest
            .entries
            .iter()
            .map(|(d, e)| (d.clone(), e.key.callable.clone(), e.snapshot.clone()))
            .collect();
        for (digest, callable, snapshot) in &digests {
            self.index_entry(digest, callable, snapshot);
        }
    }

    fn index_entry(&mut self, digest: &str, callable: &str, snapshot: &DependencySnapshot) {
        for unit in std::iter::once(callable).chain(snapshot.code.keys().map(String::as_str)) {
            self.by_code
                .entry(unit.to_string())
                .or_default()
                .insert(digest.to_string());
        }
        for name in snapshot.globals.keys() {
            self.by_global
                .entry(name.clone())
                .or_default()
                .insert(digest.to_string());
        }
        for name in snapshot.attributes.keys() {
            self.by_attribute
                .entry(name.clone())
                .or_default()
                .insert(digest.to_string());
        }
        for path in snapshot.files.keys() {
            self.by_file
                .entry(path.clone())
                .or_default()
                .insert(digest.to_string());
        }
    }

    /// Looks up `key` and validates it against the current state.
    ///
    /// Every recorded global, attribute, file and code hash must match;
    /// the first mismatch is reported as the miss reason.
    pub fn lookup(&self, key: &CacheKey, state: &dyn DependencyState) -> Lookup {
        let digest = key.digest().to_string();
        let Some(entry) = self.manifest.entries.get(&digest) else {
            return Lookup::Miss(MissReason::NotFound);
        };
        if entry.key != *key {
            return Lookup::Miss(MissReason::NotFound);
        }
        if let Some(reason) = Self::validate(&entry.snapshot, state) {
            return Lookup::Miss(reason);
        }
        match self.store.read(&digest) {
            Some(payload) => Lookup::Hit(CachedResult {
                payload,
                snapshot: entry.snapshot.clone(),
            }),
            None => Lookup::Miss(MissReason::PayloadUnreadable),
        }
    }

    fn validate(snapshot: &DependencySnapshot, state: &dyn DependencyState) -> Option<MissReason> {
        for (name, hash) in &snapshot.globals {
            if state.global_hash(name) != Some(*hash) {
                return Some(MissReason::GlobalChanged(name.clone()));
            }
        }
        for (name, hash) in &snapshot.attributes {
            if state.attribute_hash(name) != Some(*hash) {
                return Some(MissReason::AttributeChanged(name.clone()));
            }
        }
        for (name, hash) in &snapshot.code {
            if state.code_hash(name) != Some(*hash) {
                return Some(MissReason::CodeChanged(name.clone()));
            }
        }
        for (path, hash) in &snapshot.files {
            if state.file_hash(path) != Some(*hash) {
                return Some(MissReason::FileChanged(path.clone()));
            }
        }
        None
    }

    /// Stores a result for `key`, replacing any previous entry.
    pub fn commit(
        &mut self,
        key: CacheKey,
        payload: &[u8],
        snapshot: DependencySnapshot,
    ) -> Result<(), CacheError> {
        let digest = key.digest().to_string();
        self.store.write(&digest, payload, &self.runtime_version)?;
        self.unindex(&digest);
        self.index_entry(&digest, &key.callable, &snapshot);
        self.manifest.entries.insert(
            digest,
            EntryRecord {
                key,
                snapshot,
                payload_len: payload.len() as u64,
            },
        );
        self.dirty = true;
        Ok(())
    }

    fn unindex(&mut self, digest: &str) {
        let Some(entry) = self.manifest.entries.get(digest) else {
            return;
        };
        for name in entry.snapshot.globals.keys() {
            if let Some(set) = self.by_global.get_mut(name) {
                set.remove(digest);
            }
        }
        for name in entry.snapshot.attributes.keys() {
            if let Some(set) = self.by_attribute.get_mut(name) {
                set.remove(digest);
            }
        }
        for path in entry.snapshot.files.keys() {
            if let Some(set) = self.by_file.get_mut(path) {
                set.remove(digest);
            }
        }
        let units = std::iter::once(&entry.key.callable).chain(entry.snapshot.code.keys());
        for unit in units {
            if let Some(set) = self.by_code.get_mut(unit) {
                set.remove(digest);
            }
        }
    }

    fn remove_entries(&mut self, digests: HashSet<String>) -> usize {
        let mut removed = 0;
        for digest in digests {
            self.unindex(&digest);
            if self.manifest.entries.remove(&digest).is_some() {
                removed += 1;
                if let Err(e) = self.store.remove(&digest) {
                    tracing::debug!(error = %e, "stale payload left for gc");
                }
            }
        }
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Drops every entry that recorded the global binding `name`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_global(&mut self, name: &str) -> usize {
        let digests = self.by_global.remove(name).unwrap_or_default();
        self.remove_entries(digests)
    }

    /// Drops entries that recorded the global `name` with a hash other
    /// than `current`.
    ///
    /// `None` means the binding is gone, which invalidates every dependent.
    /// Entries that recorded exactly `current` remain valid.
    pub fn invalidate_global_changed(&mut self, name: &str, current: Option<ContentHash>) -> usize {
        let digests = self.changed_dependents(&self.by_global, name, current, |s| &s.globals);
        self.remove_entries(digests)
    }

    /// Drops entries that recorded the attribute `qualified` with a hash
    /// other than `current`.
    pub fn invalidate_attribute_changed(
        &mut self,
        qualified: &str,
        current: Option<ContentHash>,
    ) -> usize {
        let digests =
            self.changed_dependents(&self.by_attribute, qualified, current, |s| &s.attributes);
        self.remove_entries(digests)
    }

    fn changed_dependents(
        &self,
        index: &HashMap<String, HashSet<String>>,
        name: &str,
        current: Option<ContentHash>,
        recorded: fn(&DependencySnapshot) -> &BTreeMap<String, ContentHash>,
    ) -> HashSet<String> {
        let Some(dependents) = index.get(name) else {
            return HashSet::new();
        };
        dependents
            .iter()
            .filter(|d| {
                self.manifest
                    .entries
                    .get(d.as_str())
                    .and_then(|e| recorded(&e.snapshot).get(name))
                    .copied()
                    != current
            })
            .cloned()
            .collect()
    }

    /// Drops every entry that recorded the attribute `qualified`.
    pub fn invalidate_attribute(&mut self, qualified: &str) -> usize {
        let digests = self.by_attribute.remove(qualified).unwrap_or_default();
        self.remove_entries(digests)
    }

    /// Drops every entry that recorded any attribute of `namespace`.
    pub fn invalidate_namespace(&mut self, namespace: &str) -> usize {
        let prefix = format!("{namespace}.");
        let names: Vec<String> = self
            .by_attribute
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        let mut digests = HashSet::new();
        for name in names {
            if let Some(set) = self.by_attribute.remove(&name) {
                digests.extend(set);
            }
        }
        self.remove_entries(digests)
    }

    /// Drops every entry that recorded the file at `path`.
    pub fn invalidate_file(&mut self, path: &Path) -> usize {
        let digests = self.by_file.remove(path).unwrap_or_default();
        self.remove_entries(digests)
    }

    /// Drops entries for `callable` recorded under a different code hash,
    /// and entries of other callables that recorded a different hash for
    /// `callable` as one of their invoked units.
    pub fn invalidate_stale_code(
        &mut self,
        callable: &str,
        current: ContentHash,
    ) -> usize {
        let Some(dependents) = self.by_code.get(callable) else {
            return 0;
        };
        let digests: HashSet<String> = dependents
            .iter()
            .filter(|d| {
                self.manifest.entries.get(d.as_str()).is_some_and(|e| {
                    (e.key.callable == callable && e.key.code_hash != current)
                        || e.snapshot.code.get(callable).is_some_and(|h| *h != current)
                })
            })
            .cloned()
            .collect();
        self.remove_entries(digests)
    }

    /// Persisted code dependency graph.
    pub fn code_dependencies(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.manifest.code_deps
    }

    /// Replaces the persisted code dependency graph.
    pub fn set_code_dependencies(&mut self, deps: BTreeMap<String, BTreeSet<String>>) {
        if self.manifest.code_deps != deps {
            self.manifest.code_deps = deps;
            self.dirty = true;
        }
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.manifest.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.manifest.entries.is_empty()
    }

    /// Iterates over committed entries, sorted by callable name then digest.
    pub fn entries(&self) -> Vec<(&str, &EntryRecord)> {
        let mut list: Vec<(&str, &EntryRecord)> = self
            .manifest
            .entries
            .iter()
            .map(|(d, e)| (d.as_str(), e))
            .collect();
        list.sort_by(|a, b| a.1.key.callable.cmp(&b.1.key.callable).then(a.0.cmp(b.0)));
        list
    }

    /// Returns `true` if there are changes not yet written by [`Cache::save`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persists the manifest if anything changed.
    pub fn save(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }
        self.manifest.save(&self.cache_dir)?;
        self.dirty = false;
        Ok(())
    }

    /// Returns a reference to the current manifest.
    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    /// Removes payload files not referenced by the manifest.
    ///
    /// Returns the number of files removed.
    pub fn gc(&self) -> Result<usize, CacheError> {
        let live: HashSet<&str> = self.manifest.entries.keys().map(String::as_str).collect();
        self.store.retain(&live)
    }

    /// Removes every entry and payload.
    ///
    /// Returns the number of entries removed. The code dependency graph is
    /// kept.
    pub fn clear(&mut self) -> Result<usize, CacheError> {
        let removed = self.manifest.entries.len();
        self.manifest.entries.clear();
        self.rebuild_index();
        self.dirty = true;
        self.gc()?;
        Ok(removed)
    }
}
