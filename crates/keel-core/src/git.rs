//! Git context supplied at build time and repository prefix parsing.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Source-control facts stamped into a manifest at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitContext {
    pub branch: String,
    pub sha: String,
    pub origin: String,
}

/// Repository path taken from an origin URL, e.g. `org/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryPrefix(String);

impl RepositoryPrefix {
    /// Parse from an origin URL.
    ///
    /// Accepts `https://host/org/repo.git`, `ssh://git@host/org/repo`,
    /// and scp-like `git@host:org/repo.git`.
    pub fn from_origin(origin: &str) -> ConfigResult<Self> {
        let raw = origin.trim();
        let path = match Url::parse(raw) {
            Ok(url) if url.has_host() => url.path().to_string(),
            _ => match raw.split_once(':') {
                Some((_, path)) => path.to_string(),
                None => raw
                    .split_once('/')
                    .map(|(_, path)| path.to_string())
                    .unwrap_or_default(),
            },
        };

        let trimmed = path.trim_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidOrigin(origin.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// Full path including the owner, e.g. `org/repo`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, e.g. `repo`.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RepositoryPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_https_origin() {
        let prefix = RepositoryPrefix::from_origin("https://github.com/org/repo.git").unwrap();
        assert_eq!(prefix.as_str(), "org/repo");
        assert_eq!(prefix.name(), "repo");
    }

    #[test]
    fn parse_scp_origin() {
        let prefix = RepositoryPrefix::from_origin("git@github.com:org/repo.git").unwrap();
        assert_eq!(prefix.as_str(), "org/repo");
    }

    #[test]
    fn parse_ssh_origin_with_subgroups() {
        let prefix =
            RepositoryPrefix::from_origin("ssh://git@gitlab.com/group/sub/repo").unwrap();
        assert_eq!(prefix.as_str(), "group/sub/repo");
        assert_eq!(prefix.name(), "repo");
    }

    #[test]
    fn parse_bare_host_path() {
        let prefix = RepositoryPrefix::from_origin("github.com/org/repo").unwrap();
        assert_eq!(prefix.as_str(), "org/repo");
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(RepositoryPrefix::from_origin("https://github.com/").is_err());
        assert!(RepositoryPrefix::from_origin("").is_err());
    }
}
