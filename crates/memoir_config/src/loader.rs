//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::MemoConfig;
use std::path::Path;

/// Name of the configuration file looked up in a program directory.
pub const CONFIG_FILE: &str = "memoir.toml";

/// Loads and validates `<program_dir>/memoir.toml`.
pub fn load_config(program_dir: &Path) -> Result<MemoConfig, ConfigError> {
    let content = std::fs::read_to_string(program_dir.join(CONFIG_FILE))?;
    load_config_from_str(&content)
}

/// Like [`load_config`], but an absent file yields the default configuration.
pub fn load_config_or_default(program_dir: &Path) -> Result<MemoConfig, ConfigError> {
    match std::fs::read_to_string(program_dir.join(CONFIG_FILE)) {
        Ok(content) => load_config_from_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MemoConfig::default()),
        Err(e) => Err(e.into()),
    }
}

/// Parses and validates a `memoir.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<MemoConfig, ConfigError> {
    let config: MemoConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &MemoConfig) -> Result<(), ConfigError> {
    if config.cache.dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "cache.dir must not be empty".to_string(),
        ));
    }
    if let Some(name) = config
        .policy
        .deny_types
        .iter()
        .find(|t| config.policy.allow_types.contains(t))
    {
        return Err(ConfigError::ValidationError(format!(
            "type '{name}' is both denied and allowed"
        )));
    }
    Ok(())
}
