//! Parsing and validation of `memoir.toml` runtime configuration files.
//!
//! This crate reads the configuration file and produces a strongly-typed
//! [`MemoConfig`] controlling where the cache lives, which value kinds are
//! never cached, and which callables are never memoized.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, load_config_or_default, CONFIG_FILE};
pub use types::*;
