//! Error taxonomy shared by every platform service.

use thiserror::Error;

/// Result type alias for platform calls.
pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("{resource} already exists: {id}")]
    Conflict { resource: &'static str, id: String },

    /// Throttling or eventual-consistency lag. The only retryable class.
    #[error("transient platform error: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("platform error: {0}")]
    Other(String),
}

impl PlatformError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(resource: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            resource,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Narrow error tolerance for idempotent steps.
pub trait PlatformResultExt<T> {
    /// A removal that finds nothing to remove succeeded.
    fn tolerate_not_found(self) -> PlatformResult<Option<T>>;

    /// A create that finds the thing already there succeeded.
    fn tolerate_conflict(self) -> PlatformResult<Option<T>>;
}

impl<T> PlatformResultExt<T> for PlatformResult<T> {
    fn tolerate_not_found(self) -> PlatformResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn tolerate_conflict(self) -> PlatformResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerate_not_found_only_swallows_not_found() {
        let gone: PlatformResult<()> = Err(PlatformError::not_found("rule", "r"));
        assert_eq!(gone.tolerate_not_found(), Ok(None));

        let other: PlatformResult<()> = Err(PlatformError::Other("boom".into()));
        assert!(other.tolerate_not_found().is_err());

        let conflict: PlatformResult<()> = Err(PlatformError::conflict("statement", "s"));
        assert!(conflict.clone().tolerate_not_found().is_err());
        assert_eq!(conflict.tolerate_conflict(), Ok(None));
    }

    #[test]
    fn classification() {
        assert!(PlatformError::Transient("throttled".into()).is_transient());
        assert!(!PlatformError::LimitExceeded("versions".into()).is_transient());
        assert_eq!(
            PlatformError::not_found("role", "x").to_string(),
            "role not found: x"
        );
    }
}
