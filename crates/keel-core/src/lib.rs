//! keel-core — configuration, git context, and the pure identity derivations
//! every reconciler agrees on.

pub mod config;
pub mod error;
pub mod git;
pub mod identity;

pub use config::{KeelConfig, TemplateData, VpcConfig};
pub use error::{ConfigError, ConfigResult};
pub use git::{GitContext, RepositoryPrefix};
pub use identity::{Identity, Tags};
