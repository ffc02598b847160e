//! Linkbond Configuration Management
//!
//! Loads and validates the daemon's TOML configuration: one `[general]`
//! section for the link as a whole and one `[[tunnel]]` table per bonded
//! path.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod settings;

pub use settings::{GeneralSettings, Settings, TunnelSettings};

use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Validation error
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Config file permissions are too loose
    #[error("config file {0} is group/other accessible")]
    InsecurePermissions(String),
}

/// Result type for config operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::SerializationError(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::SerializationError(err.to_string())
    }
}
