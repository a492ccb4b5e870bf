//! `memoir.toml` errors.

/// Why a `memoir.toml` could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read memoir.toml: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid TOML for the expected tables.
    #[error("malformed memoir.toml: {0}")]
    ParseError(String),

    /// The file parsed but holds contradictory or empty settings.
    #[error("invalid memoir.toml: {0}")]
    ValidationError(String),
}
