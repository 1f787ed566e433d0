use std::path::Path;

use keel_core::identity::route_key;
use keel_core::{Identity, KeelConfig, RepositoryPrefix};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Derived {
    repository_prefix: String,
    resource_name: String,
    role_arn: String,
    policy_arn: String,
    repository: String,
    route_key: String,
}

pub fn identity(
    origin: &str,
    namespace: &str,
    function: &str,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    let config = KeelConfig::load(config)?;
    let derived = derive(&config, origin, namespace, function)?;
    println!("{}", serde_json::to_string_pretty(&derived)?);
    Ok(())
}

fn derive(
    config: &KeelConfig,
    origin: &str,
    namespace: &str,
    function: &str,
) -> anyhow::Result<Derived> {
    let prefix = RepositoryPrefix::from_origin(origin)?;
    let identity = Identity::new(prefix.clone(), namespace, function);
    Ok(Derived {
        repository_prefix: prefix.to_string(),
        resource_name: identity.resource_name(),
        role_arn: identity.role_arn(&config.account.id),
        policy_arn: identity.policy_arn(&config.account.id),
        repository: identity.repository(),
        route_key: route_key(&prefix, namespace, function, config.routes.owner_prefix),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_names_from_origin() {
        let mut config = KeelConfig::default();
        config.account.id = "123456789012".into();

        let derived = derive(&config, "git@github.com:org/repo.git", "feature-x", "svc").unwrap();
        assert_eq!(derived.resource_name, "org-repo-feature-x-svc");
        assert_eq!(derived.role_arn, "arn:aws:iam::123456789012:role/org-repo-feature-x-svc");
        assert_eq!(derived.repository, "org/repo/svc");
        assert_eq!(derived.route_key, "ANY /repo/feature-x/svc/{proxy+}");

        config.routes.owner_prefix = true;
        let derived = derive(&config, "https://github.com/org/repo", "feature-x", "svc").unwrap();
        assert_eq!(derived.route_key, "ANY /org/repo/feature-x/svc/{proxy+}");
    }
}
