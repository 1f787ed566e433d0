//! Error types for the manifest codec.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("required field missing: {0}")]
    RequiredFieldMissing(String),

    #[error("invalid JSON in {origin}: {source}")]
    InvalidJson {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("label {key} is not valid base64: {source}")]
    Base64 {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("label {key} does not decode to UTF-8")]
    InvalidUtf8 { key: String },

    #[error("template error in {origin}: {reason}")]
    Template { origin: String, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error(transparent)]
    Identity(#[from] keel_core::ConfigError),
}

impl ManifestError {
    /// Schema errors are fatal and never retried.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            ManifestError::RequiredFieldMissing(_)
                | ManifestError::InvalidJson { .. }
                | ManifestError::Base64 { .. }
                | ManifestError::InvalidUtf8 { .. }
                | ManifestError::Template { .. }
        )
    }
}
