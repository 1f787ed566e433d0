//! Computed identity.
//!
//! Every name a reconciler touches is derived here from the repository
//! prefix, the namespace, and the function name. The derivations are pure so
//! repeated runs land on the same resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::git::RepositoryPrefix;

pub type Tags = BTreeMap<String, String>;

pub const TAG_FUNCTION: &str = "Function";
pub const TAG_ORIGIN: &str = "Origin";
pub const TAG_BRANCH: &str = "Branch";
pub const TAG_SHA: &str = "Sha";
pub const TAG_NAMESPACE: &str = "NameSpace";

/// Replace `/` with `-` and trim stray hyphens at either end.
pub fn deslash(s: &str) -> String {
    s.replace('/', "-").trim_matches('-').to_string()
}

pub fn role_arn(account_id: &str, name: &str) -> String {
    format!("arn:aws:iam::{account_id}:role/{name}")
}

pub fn policy_arn(account_id: &str, name: &str) -> String {
    format!("arn:aws:iam::{account_id}:policy/{name}")
}

/// Role name from a role ARN, e.g. `arn:aws:iam::1:role/x` → `x`.
pub fn role_name_from_arn(arn: &str) -> Option<&str> {
    arn.split_once(":role/")
        .map(|(_, name)| name.rsplit('/').next().unwrap_or(name))
        .filter(|name| !name.is_empty())
}

/// Default HTTP route key for a function.
///
/// `org/repo`, `feature-x`, `svc` → `ANY /repo/feature-x/svc/{proxy+}`, or
/// `ANY /org/repo/feature-x/svc/{proxy+}` with the owner segment enabled.
pub fn route_key(
    prefix: &RepositoryPrefix,
    branch: &str,
    function: &str,
    owner_prefix: bool,
) -> String {
    let repo = if owner_prefix {
        prefix.as_str()
    } else {
        prefix.name()
    };
    format!("ANY /{repo}/{branch}/{function}/{{proxy+}}")
}

/// Standard tag set applied to roles and policies.
pub fn standard_tags(function: &str, origin: &str, branch: &str, sha: &str) -> Tags {
    Tags::from([
        (TAG_FUNCTION.to_string(), function.to_string()),
        (TAG_ORIGIN.to_string(), origin.to_string()),
        (TAG_BRANCH.to_string(), branch.to_string()),
        (TAG_SHA.to_string(), sha.to_string()),
    ])
}

/// Where a deployment lives: repository, namespace, function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub prefix: RepositoryPrefix,
    pub namespace: String,
    pub function: String,
}

impl Identity {
    pub fn new(
        prefix: RepositoryPrefix,
        namespace: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            prefix,
            namespace: namespace.into(),
            function: function.into(),
        }
    }

    /// Prefix shared by every resource of this repository.
    pub fn resource_prefix(prefix: &RepositoryPrefix) -> String {
        deslash(prefix.as_str())
    }

    /// Shared name of the function, its role, and its policy.
    pub fn resource_name(&self) -> String {
        format!(
            "{}-{}-{}",
            Self::resource_prefix(&self.prefix),
            deslash(&self.namespace),
            self.function
        )
    }

    pub fn role_arn(&self, account_id: &str) -> String {
        role_arn(account_id, &self.resource_name())
    }

    pub fn policy_arn(&self, account_id: &str) -> String {
        policy_arn(account_id, &self.resource_name())
    }

    /// Registry repository holding this function's images.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.prefix, self.function)
    }
}
