/// Structured error types for grimalkin-core.
///
/// Uses `thiserror` so the store crate can compose these into its own
/// error taxonomy; the binary crate wraps everything in `anyhow`.
use thiserror::Error;

/// A storage UUID value did not carry exactly 16 bytes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("malformed UUID: expected 16 bytes, got {len}")]
pub struct MalformedUuid {
    pub len: usize,
}

/// Configuration could not be assembled.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required value absent from every source
    #[error("missing configuration value '{key}'")]
    Missing { key: &'static str },

    /// Value present but unusable
    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    /// Config file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
