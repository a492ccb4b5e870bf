//! memoir CLI: inspection and maintenance of memoization caches.
//!
//! Provides `memoir stats` for a summary of a cache directory, `memoir list`
//! for its entries, `memoir gc` to delete payloads no entry refers to, and
//! `memoir clear` to drop every entry.

#![warn(missing_docs)]

mod list;
mod maintain;
mod stats;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use memoir_cache::{Cache, CacheManifest};

/// memoir: persistent memoization for managed runtimes.
#[derive(Parser, Debug)]
#[command(name = "memoir", version, about = "memoir cache tool")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Cache directory. Defaults to the one configured in the program's
    /// `memoir.toml`.
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Program directory holding `memoir.toml`.
    #[arg(long, global = true, default_value = ".")]
    pub program: PathBuf,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Summarize the cache.
    Stats {
        /// Output format.
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },
    /// List cached entries.
    List(ListArgs),
    /// Delete result payloads that no entry refers to.
    Gc,
    /// Delete every cached entry.
    Clear,
}

/// Arguments for the `memoir list` subcommand.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only show entries whose callable name contains this substring.
    #[arg(long)]
    pub filter: Option<String>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

/// Report output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable terminal output.
    Text,
    /// Machine-readable JSON output.
    Json,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Resolved cache directory.
    pub cache_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    let result = resolve_cache_dir(&cli).and_then(|cache_dir| {
        let global = GlobalArgs {
            quiet: cli.quiet,
            cache_dir,
        };
        match cli.command {
            Command::Stats { format } => stats::run(format, &global),
            Command::List(ref args) => list::run(args, &global),
            Command::Gc => maintain::gc(&global),
            Command::Clear => maintain::clear(&global),
        }
    });

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

/// Installs a stderr subscriber. `RUST_LOG` applies unless a flag forces
/// a level.
fn init_tracing(quiet: bool, verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

/// Picks the cache directory: `--cache-dir`, else the configured one
/// relative to the program directory.
fn resolve_cache_dir(cli: &Cli) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(dir) = &cli.cache_dir {
        return Ok(dir.clone());
    }
    let config = memoir_config::load_config_or_default(&cli.program)?;
    Ok(if config.cache.dir.is_relative() {
        cli.program.join(&config.cache.dir)
    } else {
        config.cache.dir
    })
}

/// Opens the cache in `dir` under whatever runtime version wrote it.
///
/// Returns `None` if the directory holds no cache.
pub fn open_cache(dir: &Path) -> Result<Option<Cache>, Box<dyn std::error::Error>> {
    let Some(manifest) = CacheManifest::try_load(dir)? else {
        return Ok(None);
    };
    Ok(Some(Cache::load_or_create(dir, &manifest.runtime_version)?))
}
