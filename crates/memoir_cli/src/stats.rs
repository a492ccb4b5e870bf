//! `memoir stats`: summary of a cache directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use memoir_cache::{Cache, FileHasher};

use crate::{open_cache, GlobalArgs, ReportFormat};

/// Aggregate figures for one cache.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Runtime version the cache was written under.
    pub runtime_version: String,
    /// Number of committed entries.
    pub entries: usize,
    /// Total size of stored result payloads in bytes.
    pub payload_bytes: u64,
    /// Entry count per canonical callable name.
    pub callables: BTreeMap<String, usize>,
    /// Number of callers in the persisted invocation graph.
    pub code_deps: usize,
    /// Recorded file dependencies whose contents changed since recording.
    pub stale_files: Vec<PathBuf>,
}

impl CacheStats {
    /// Computes the summary for `cache`, hashing every recorded file.
    pub fn collect(cache: &Cache) -> Self {
        let mut stats = CacheStats {
            runtime_version: cache.manifest().runtime_version.clone(),
            code_deps: cache.code_dependencies().len(),
            ..Default::default()
        };
        let mut files = BTreeMap::new();
        for (_, entry) in cache.entries() {
            stats.entries += 1;
            stats.payload_bytes += entry.payload_len;
            *stats
                .callables
                .entry(entry.key.callable.clone())
                .or_default() += 1;
            for (path, hash) in &entry.snapshot.files {
                files.insert(path.clone(), *hash);
            }
        }
        // A file recorded by two entries with different hashes is stale for
        // at least one of them.
        let conflicting: BTreeSet<PathBuf> = cache
            .entries()
            .into_iter()
            .flat_map(|(_, e)| e.snapshot.files.iter())
            .filter(|(path, hash)| files.get(*path) != Some(*hash))
            .map(|(path, _)| path.clone())
            .collect();
        let mut stale: BTreeSet<PathBuf> = FileHasher::stale_files(&files).into_iter().collect();
        stale.extend(conflicting);
        stats.stale_files = stale.into_iter().collect();
        stats
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "runtime_version": self.runtime_version,
            "entries": self.entries,
            "payload_bytes": self.payload_bytes,
            "callables": self.callables,
            "code_deps": self.code_deps,
            "stale_files": self.stale_files,
        })
    }
}

/// Runs the `memoir stats` command.
pub fn run(format: ReportFormat, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(cache) = open_cache(&global.cache_dir)? else {
        if !global.quiet {
            eprintln!("  No cache at {}", global.cache_dir.display());
        }
        return Ok(0);
    };
    let stats = CacheStats::collect(&cache);
    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&stats.to_json())?),
        ReportFormat::Text => print_text(&stats, global),
    }
    Ok(0)
}

fn print_text(stats: &CacheStats, global: &GlobalArgs) {
    println!("cache:          {}", global.cache_dir.display());
    println!("runtime:        {}", stats.runtime_version);
    println!("entries:        {}", stats.entries);
    println!("payload bytes:  {}", stats.payload_bytes);
    println!("callables:      {}", stats.callables.len());
    println!("code deps:      {}", stats.code_deps);
    for (name, count) in &stats.callables {
        println!("  {count:>6}  {name}");
    }
    if !stats.stale_files.is_empty() {
        println!("stale files:");
        for path in &stats.stale_files {
            println!("  {}", path.display());
        }
    }
}
