//! Reconciler error types.

use thiserror::Error;

/// Errors that abort a reconcile step.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("manifest error: {0}")]
    Manifest(#[from] keel_manifest::ManifestError),

    #[error("platform error: {0}")]
    Platform(#[from] keel_platform::PlatformError),

    #[error("configuration error: {0}")]
    Config(#[from] keel_core::ConfigError),

    #[error("unsupported image architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("cannot derive repository from image uri: {0}")]
    InvalidImageUri(String),

    #[error("cannot derive role name from arn: {0}")]
    InvalidRoleArn(String),

    #[error("function {function} still updating after {attempts} checks")]
    NotReady { function: String, attempts: u32 },

    #[error("function update failed: {0}")]
    UpdateFailed(String),

    #[error("gateway api {0} is not managed by keel")]
    GatewayNotManaged(String),

    #[error("no rule expression known for subscription {0}")]
    MissingExpression(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("listing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

impl ReconcileError {
    /// Missing or malformed manifest data. Never worth retrying.
    pub fn is_schema_error(&self) -> bool {
        matches!(self, ReconcileError::Manifest(e) if e.is_schema_error())
    }
}
