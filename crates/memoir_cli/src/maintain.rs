//! `memoir gc` and `memoir clear`.

use crate::{open_cache, GlobalArgs};

/// Runs the `memoir gc` command.
pub fn gc(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(cache) = open_cache(&global.cache_dir)? else {
        return Ok(0);
    };
    let removed = cache.gc()?;
    tracing::debug!(removed, "gc finished");
    if !global.quiet {
        eprintln!("     Removed {removed} unreferenced payloads");
    }
    Ok(0)
}

/// Runs the `memoir clear` command.
pub fn clear(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(mut cache) = open_cache(&global.cache_dir)? else {
        return Ok(0);
    };
    let removed = cache.clear()?;
    cache.save()?;
    if !global.quiet {
        eprintln!("     Cleared {removed} entries");
    }
    Ok(0)
}
