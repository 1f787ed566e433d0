//! Error types for configuration and identity derivation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("vpc configuration needs both security groups and subnets (got {security_groups} security groups, {subnets} subnets)")]
    PartialVpc {
        security_groups: usize,
        subnets: usize,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("cannot derive repository prefix from origin {0:?}")]
    InvalidOrigin(String),
}
