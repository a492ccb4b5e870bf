//! `memoir list`: one line per cached entry.

use crate::{open_cache, GlobalArgs, ListArgs, ReportFormat};
use memoir_cache::EntryRecord;

/// Runs the `memoir list` command.
pub fn run(args: &ListArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(cache) = open_cache(&global.cache_dir)? else {
        if !global.quiet {
            eprintln!("  No cache at {}", global.cache_dir.display());
        }
        return Ok(0);
    };
    let entries = cache.entries();
    let shown: Vec<(&str, &EntryRecord)> = entries
        .into_iter()
        .filter(|(_, e)| matches_filter(e, args.filter.as_deref()))
        .collect();

    match args.format {
        ReportFormat::Json => {
            let rows: Vec<serde_json::Value> =
                shown.iter().map(|(d, e)| entry_json(d, e)).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        ReportFormat::Text => {
            for (digest, entry) in &shown {
                println!("{}", entry_line(digest, entry));
            }
            if !global.quiet {
                eprintln!("  {} entries", shown.len());
            }
        }
    }
    Ok(0)
}

fn matches_filter(entry: &EntryRecord, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| entry.key.callable.contains(f))
}

fn dependency_count(entry: &EntryRecord) -> usize {
    let s = &entry.snapshot;
    s.globals.len() + s.attributes.len() + s.files.len() + s.code.len()
}

fn entry_line(digest: &str, entry: &EntryRecord) -> String {
    format!(
        "{}  {}  args={}  deps={}  {}B",
        &digest[..digest.len().min(12)],
        entry.key.callable,
        entry.key.args,
        dependency_count(entry),
        entry.payload_len
    )
}

fn entry_json(digest: &str, entry: &EntryRecord) -> serde_json::Value {
    let s = &entry.snapshot;
    serde_json::json!({
        "digest": digest,
        "callable": entry.key.callable,
        "code_hash": entry.key.code_hash.to_string(),
        "args": entry.key.args.to_string(),
        "payload_len": entry.payload_len,
        "globals": s.globals.keys().collect::<Vec<_>>(),
        "attributes": s.attributes.keys().collect::<Vec<_>>(),
        "files": s.files.keys().collect::<Vec<_>>(),
        "code": s.code.keys().collect::<Vec<_>>(),
    })
}
