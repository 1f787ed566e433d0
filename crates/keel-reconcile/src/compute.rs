//! Compute reconciler: execution role, permission policy, and function.
//!
//! Every step reads live state first and only mutates on a difference, so a
//! deploy that stopped partway is finished by running it again.

use std::sync::Arc;

use keel_core::identity::{TAG_NAMESPACE, role_name_from_arn, standard_tags};
use keel_core::{Identity, KeelConfig, RepositoryPrefix, Tags};
use keel_manifest::TemplatedManifest;
use keel_manifest::canonical::compact_json;
use keel_manifest::schema::LAMBDA_TRUST_POLICY;
use keel_platform::{
    Architecture, Artifact, CreateFunction, Deployment, FunctionCode, FunctionSettings,
    Platform, PlatformError, PlatformResultExt,
};
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::retry::{wait_until_settled, with_backoff};
use crate::vpc::{VpcRollout, VpcStep};

/// Managed policy granting network interface management to the cleanup role.
pub const VPC_ACCESS_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaVPCAccessExecutionRole";

const PROVIDER_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

#[derive(Clone)]
pub struct ComputeReconciler {
    config: Arc<KeelConfig>,
    platform: Platform,
}

impl ComputeReconciler {
    #[must_use]
    pub fn new(config: Arc<KeelConfig>, platform: Platform) -> Self {
        Self { config, platform }
    }

    /// Identity of the function a manifest declares, deployed into `namespace`.
    pub fn identity(manifest: &TemplatedManifest, namespace: &str) -> ReconcileResult<Identity> {
        Ok(Identity::new(
            manifest.repository_prefix()?,
            namespace,
            manifest.name(),
        ))
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Converge role, policy, attachment, and function onto `manifest`, then
    /// return the function as it now stands.
    pub async fn deploy(
        &self,
        manifest: &TemplatedManifest,
        artifact: &Artifact,
        namespace: &str,
    ) -> ReconcileResult<Deployment> {
        let identity = Self::identity(manifest, namespace)?;
        let name = identity.resource_name();
        let account = &self.config.account.id;
        let tags = standard_tags(
            manifest.name(),
            manifest.origin(),
            manifest.branch(),
            manifest.sha(),
        );
        info!(function = %name, namespace, digest = %artifact.digest, "deploying");

        let role_arn = self.upsert_role(&name, manifest.role(), &tags).await?;
        let policy_arn = identity.policy_arn(account);
        self.upsert_policy(&name, &policy_arn, manifest.policy(), &tags)
            .await?;
        self.attach(&name, &policy_arn).await?;

        let resources = manifest.resources(self.config.routes.owner_prefix)?;
        let architecture = Architecture::from_image(&artifact.architecture)
            .ok_or_else(|| ReconcileError::UnsupportedArchitecture(artifact.architecture.clone()))?;
        let settings = FunctionSettings {
            role_arn,
            memory_mb: resources.memory_size,
            timeout_secs: resources.timeout,
            ephemeral_storage_mb: resources.ephemeral_storage,
            vpc: self.config.vpc_attachment().cloned(),
        };
        let code = FunctionCode {
            image_uri: artifact.uri.clone(),
            architecture,
        };
        let mut function_tags = tags;
        function_tags.insert(TAG_NAMESPACE.to_string(), namespace.to_string());

        self.converge_function(&name, settings, code, &function_tags)
            .await?;

        let deployment = wait_until_settled(
            self.platform.compute.as_ref(),
            &self.config.readiness,
            &name,
        )
        .await?;
        info!(function = %name, arn = %deployment.arn, "deployed");
        Ok(deployment)
    }

    /// Create the role or bring its trust document and tags in line.
    async fn upsert_role(&self, name: &str, trust: &str, tags: &Tags) -> ReconcileResult<String> {
        let identity = &self.platform.identity;
        let role = match identity.get_role(name).await? {
            Some(role) => role,
            None => match identity.create_role(name, trust, tags).await.tolerate_conflict()? {
                Some(role) => {
                    info!(role = name, "created role");
                    return Ok(role.arn);
                }
                None => identity
                    .get_role(name)
                    .await?
                    .ok_or_else(|| PlatformError::not_found("role", name))?,
            },
        };

        if role.trust_document != trust {
            identity.update_trust_document(name, trust).await?;
            info!(role = name, "updated trust document");
        }
        let (set, stale) = tag_delta(&role.tags, tags);
        if !stale.is_empty() {
            identity.untag_role(name, &stale).await?;
        }
        if !set.is_empty() {
            identity.tag_role(name, &set).await?;
        }
        Ok(role.arn)
    }

    /// Create the policy or publish a new default version when the document
    /// changed. Non-default versions are removed first so the version slots
    /// never run out.
    async fn upsert_policy(
        &self,
        name: &str,
        arn: &str,
        document: &str,
        tags: &Tags,
    ) -> ReconcileResult<()> {
        let identity = &self.platform.identity;
        let policy = match identity.get_policy(arn).await? {
            Some(policy) => policy,
            None => match identity
                .create_policy(name, document, tags)
                .await
                .tolerate_conflict()?
            {
                Some(_) => {
                    info!(policy = arn, "created policy");
                    return Ok(());
                }
                None => identity
                    .get_policy(arn)
                    .await?
                    .ok_or_else(|| PlatformError::not_found("policy", arn))?,
            },
        };

        let versions = identity.list_policy_versions(arn).await?;
        let current = versions
            .iter()
            .find(|v| v.is_default)
            .map(|v| v.document.as_str());
        if current != Some(document) {
            for version in versions.iter().filter(|v| !v.is_default) {
                identity
                    .delete_policy_version(arn, &version.version_id)
                    .await
                    .tolerate_not_found()?;
            }
            let version = identity.create_policy_version(arn, document, true).await?;
            info!(policy = arn, version = %version.version_id, "published policy version");
        }

        let (set, stale) = tag_delta(&policy.tags, tags);
        if !stale.is_empty() {
            identity.untag_policy(arn, &stale).await?;
        }
        if !set.is_empty() {
            identity.tag_policy(arn, &set).await?;
        }
        Ok(())
    }

    async fn attach(&self, role: &str, policy_arn: &str) -> ReconcileResult<()> {
        let identity = &self.platform.identity;
        let attached = identity.list_attached_policies(role).await?;
        if !attached.iter().any(|a| a == policy_arn) {
            identity.attach_policy(role, policy_arn).await?;
            debug!(role, policy = policy_arn, "attached policy");
        }
        Ok(())
    }

    async fn converge_function(
        &self,
        name: &str,
        settings: FunctionSettings,
        code: FunctionCode,
        tags: &Tags,
    ) -> ReconcileResult<()> {
        let compute = &self.platform.compute;
        let mut live = compute.get_function(name).await?;

        if settings.vpc.is_some() {
            let cleanup_role = self.config.cleanup_role_arn();
            let mut rollout = VpcRollout::observe(name, &cleanup_role, live.as_ref());
            while !rollout.is_done() {
                match rollout.next_step() {
                    VpcStep::CreateWithCleanupRole => {
                        let initial = FunctionSettings {
                            role_arn: cleanup_role.clone(),
                            ..settings.clone()
                        };
                        if !self
                            .create_function(name, initial, code.clone(), tags)
                            .await?
                        {
                            let current = compute.get_function(name).await?;
                            rollout = VpcRollout::observe(name, &cleanup_role, current.as_ref());
                            continue;
                        }
                    }
                    VpcStep::PatchToOwnRole => {
                        self.update_configuration(name, &settings).await?;
                    }
                    VpcStep::Done => break,
                }
                rollout.advance();
            }
            live = compute.get_function(name).await?;
        }

        if live.is_none() {
            self.create_function(name, settings.clone(), code.clone(), tags)
                .await?;
        }

        let live = self.settle(name).await?;
        if live.settings != settings {
            self.update_configuration(name, &settings).await?;
        }
        if live.code != code {
            self.settle(name).await?;
            with_backoff(&self.config.retry, "update_function_code", || {
                compute.update_function_code(name, &code)
            })
            .await?;
            info!(function = name, image = %code.image_uri, "updated function code");
        }

        let reserved = self.config.compute.reserved_concurrency;
        if live.reserved_concurrency != Some(reserved) {
            compute.put_function_concurrency(name, reserved).await?;
            debug!(function = name, reserved, "set reserved concurrency");
        }

        let (set, stale) = tag_delta(&live.tags, tags);
        if !stale.is_empty() || !set.is_empty() {
            let live = self.settle(name).await?;
            if !stale.is_empty() {
                compute.untag_function(&live.arn, &stale).await?;
            }
            if !set.is_empty() {
                compute.tag_function(&live.arn, &set).await?;
            }
        }
        Ok(())
    }

    async fn create_function(
        &self,
        name: &str,
        settings: FunctionSettings,
        code: FunctionCode,
        tags: &Tags,
    ) -> ReconcileResult<bool> {
        let input = CreateFunction {
            name: name.to_string(),
            settings,
            code,
            tags: tags.clone(),
        };
        let compute = &self.platform.compute;
        let create = || {
            with_backoff(&self.config.retry, "create_function", || {
                compute.create_function(&input)
            })
        };

        // Conflict: another deploy created it first.
        if create().await.tolerate_conflict()?.is_none() {
            if compute.get_function(name).await?.is_some() {
                info!(function = name, "function already exists");
                return Ok(false);
            }
            warn!(function = name, "create conflicted but function is absent, retrying");
            create().await?;
        }
        info!(function = name, role = %input.settings.role_arn, "created function");
        Ok(true)
    }

    async fn update_configuration(
        &self,
        name: &str,
        settings: &FunctionSettings,
    ) -> ReconcileResult<()> {
        self.settle(name).await?;
        let compute = &self.platform.compute;
        with_backoff(&self.config.retry, "update_function_configuration", || {
            compute.update_function_configuration(name, settings)
        })
        .await?;
        info!(function = name, role = %settings.role_arn, "updated function configuration");
        Ok(())
    }

    async fn settle(&self, name: &str) -> ReconcileResult<Deployment> {
        wait_until_settled(
            self.platform.compute.as_ref(),
            &self.config.readiness,
            name,
        )
        .await
    }

    // ── Destroy ────────────────────────────────────────────────────

    /// Remove role, policies, and function. The shared cleanup role is never
    /// removed. The first failure aborts the remaining steps.
    pub async fn destroy(&self, deployment: &Deployment) -> ReconcileResult<()> {
        let identity = &self.platform.identity;
        let role = role_name_from_arn(deployment.role_arn())
            .ok_or_else(|| ReconcileError::InvalidRoleArn(deployment.role_arn().to_string()))?;

        if role == self.config.compute.cleanup_role {
            info!(function = %deployment.name, role, "function runs as the shared cleanup role, keeping it");
        } else {
            let attached = identity
                .list_attached_policies(role)
                .await
                .tolerate_not_found()?
                .unwrap_or_default();
            for policy in attached {
                identity
                    .detach_policy(role, &policy)
                    .await
                    .tolerate_not_found()?;
                if policy.starts_with(PROVIDER_POLICY_PREFIX) {
                    continue;
                }
                self.delete_policy(&policy).await?;
            }
            identity.delete_role(role).await.tolerate_not_found()?;
            info!(role, "deleted role");
        }

        self.platform
            .compute
            .delete_function(&deployment.name)
            .await
            .tolerate_not_found()?;
        info!(function = %deployment.name, "deleted function");
        Ok(())
    }

    /// Delete a policy after clearing its non-default versions.
    async fn delete_policy(&self, arn: &str) -> ReconcileResult<()> {
        let identity = &self.platform.identity;
        let versions = identity
            .list_policy_versions(arn)
            .await
            .tolerate_not_found()?
            .unwrap_or_default();
        for version in versions.iter().filter(|v| !v.is_default) {
            identity
                .delete_policy_version(arn, &version.version_id)
                .await
                .tolerate_not_found()?;
        }
        identity.delete_policy(arn).await.tolerate_not_found()?;
        debug!(policy = arn, "deleted policy");
        Ok(())
    }

    // ── Shared cleanup role ────────────────────────────────────────

    /// Make sure the shared cleanup role exists with network interface
    /// permissions. Leaves an existing role's document and tags alone.
    pub async fn ensure_cleanup_role(&self) -> ReconcileResult<String> {
        let identity = &self.platform.identity;
        let name = self.config.compute.cleanup_role.as_str();
        let arn = match identity.get_role(name).await? {
            Some(role) => role.arn,
            None => {
                let trust = compact_json("role.json.tmpl", LAMBDA_TRUST_POLICY)?;
                match identity
                    .create_role(name, &trust, &Tags::new())
                    .await
                    .tolerate_conflict()?
                {
                    Some(role) => {
                        info!(role = name, "created shared cleanup role");
                        role.arn
                    }
                    None => self.config.cleanup_role_arn(),
                }
            }
        };
        self.attach(name, VPC_ACCESS_POLICY_ARN).await?;
        Ok(arn)
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub async fn find(&self, identity: &Identity) -> ReconcileResult<Option<Deployment>> {
        Ok(self
            .platform
            .compute
            .get_function(&identity.resource_name())
            .await?)
    }

    /// Every deployment of a repository, across namespaces.
    pub async fn list(&self, prefix: &RepositoryPrefix) -> ReconcileResult<Vec<Deployment>> {
        let name_prefix = format!("{}-", Identity::resource_prefix(prefix));
        let functions = self.platform.compute.list_functions().await?;
        Ok(functions
            .into_iter()
            .filter(|f| f.name.starts_with(&name_prefix) && f.function().is_some())
            .collect())
    }

    pub async fn list_namespace(
        &self,
        prefix: &RepositoryPrefix,
        namespace: &str,
    ) -> ReconcileResult<Vec<Deployment>> {
        let mut deployments = self.list(prefix).await?;
        deployments.retain(|d| d.namespace() == Some(namespace));
        Ok(deployments)
    }
}

/// Tags to set (new or changed values) and keys to remove.
fn tag_delta(current: &Tags, desired: &Tags) -> (Tags, Vec<String>) {
    let set = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let stale = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .cloned()
        .collect();
    (set, stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use keel_platform::{IdentityService, PlatformError};

    #[test]
    fn tag_delta_splits_set_and_stale() {
        let current = Tags::from([
            ("Branch".to_string(), "main".to_string()),
            ("Sha".to_string(), "a".to_string()),
            ("Old".to_string(), "x".to_string()),
        ]);
        let desired = Tags::from([
            ("Branch".to_string(), "main".to_string()),
            ("Sha".to_string(), "b".to_string()),
        ]);
        let (set, stale) = tag_delta(&current, &desired);
        assert_eq!(set, Tags::from([("Sha".to_string(), "b".to_string())]));
        assert_eq!(stale, vec!["Old".to_string()]);
    }

    #[tokio::test]
    async fn deploy_creates_role_policy_and_function() {
        let env = fixtures::Env::new(fixtures::config());
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;

        let deployment = env
            .compute()
            .deploy(&manifest, &artifact, "main")
            .await
            .unwrap();

        assert_eq!(deployment.name, "org-repo-main-svc");
        assert_eq!(deployment.code_digest, artifact.digest);
        assert_eq!(deployment.reserved_concurrency, Some(5));
        assert_eq!(deployment.namespace(), Some("main"));
        assert_eq!(deployment.function(), Some("svc"));
        assert!(env.platform.role_exists("org-repo-main-svc"));
        assert_eq!(env.platform.calls("create_function").len(), 1);
        assert_eq!(env.platform.calls("attach_policy").len(), 1);
    }

    #[tokio::test]
    async fn create_conflict_still_converges() {
        let env = fixtures::Env::new(fixtures::config());
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        env.platform
            .fail_next("create_function", PlatformError::conflict("function", "svc"))
            .unwrap();

        let deployment = env
            .compute()
            .deploy(&manifest, &artifact, "main")
            .await
            .unwrap();
        assert_eq!(deployment.code_digest, artifact.digest);
        assert_eq!(env.platform.calls("create_function").len(), 1);
    }

    #[tokio::test]
    async fn vpc_create_conflict_resumes_rollout() {
        let env = fixtures::Env::new(fixtures::vpc_config());
        let compute = env.compute();
        compute.ensure_cleanup_role().await.unwrap();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        env.platform
            .fail_next("create_function", PlatformError::conflict("function", "svc"))
            .unwrap();

        let deployment = compute.deploy(&manifest, &artifact, "main").await.unwrap();
        assert_eq!(
            deployment.role_arn(),
            "arn:aws:iam::123456789012:role/org-repo-main-svc"
        );
        let creates = env.platform.calls("create_function");
        assert_eq!(creates.len(), 1);
        assert!(creates[0].target.ends_with(&env.config.cleanup_role_arn()));
    }

    #[tokio::test]
    async fn changed_policy_garbage_collects_old_versions() {
        let env = fixtures::Env::new(fixtures::config());
        let compute = env.compute();
        let policy_arn = "arn:aws:iam::123456789012:policy/org-repo-main-svc";

        for (i, sha) in fixtures::SHAS.iter().enumerate() {
            let policy = format!(
                r#"{{"Version":"2012-10-17","Statement":[{{"Sid":"s{i}","Effect":"Allow","Action":"sqs:*","Resource":"*"}}]}}"#
            );
            let (manifest, artifact) = env
                .publish_with("svc", "main", sha, &policy, None, &[])
                .await;
            compute.deploy(&manifest, &artifact, "main").await.unwrap();
            assert!(env.platform.policy_version_count(policy_arn) <= 2);
        }
        assert_eq!(
            env.platform.calls("create_policy_version").len(),
            fixtures::SHAS.len() - 1
        );
    }

    #[tokio::test]
    async fn unsupported_architecture_is_rejected() {
        let env = fixtures::Env::new(fixtures::config());
        let (manifest, mut artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        artifact.architecture = "s390x".into();

        let err = env
            .compute()
            .deploy(&manifest, &artifact, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnsupportedArchitecture(a) if a == "s390x"));
        assert_eq!(env.platform.calls("create_function").len(), 0);
    }

    #[tokio::test]
    async fn stale_role_tags_are_removed() {
        let env = fixtures::Env::new(fixtures::config());
        let compute = env.compute();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        compute.deploy(&manifest, &artifact, "main").await.unwrap();

        env.platform
            .tag_role(
                "org-repo-main-svc",
                &Tags::from([("Stray".to_string(), "1".to_string())]),
            )
            .await
            .unwrap();
        env.platform.clear_mutations();

        compute.deploy(&manifest, &artifact, "main").await.unwrap();
        let untagged = env.platform.calls("untag_role");
        assert_eq!(untagged.len(), 1);
        let role = env
            .platform
            .get_role("org-repo-main-svc")
            .await
            .unwrap()
            .unwrap();
        assert!(!role.tags.contains_key("Stray"));
    }

    #[tokio::test]
    async fn readiness_exhaustion_is_reported() {
        let mut config = fixtures::config();
        config.readiness.max_attempts = 2;
        let env = fixtures::Env::new(config);
        env.platform.set_update_lag(10).unwrap();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;

        let err = env
            .compute()
            .deploy(&manifest, &artifact, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotReady { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn short_update_lag_is_waited_out() {
        let env = fixtures::Env::new(fixtures::config());
        env.platform.set_update_lag(2).unwrap();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;

        let deployment = env
            .compute()
            .deploy(&manifest, &artifact, "main")
            .await
            .unwrap();
        assert!(deployment.is_settled());
    }

    #[tokio::test]
    async fn destroy_removes_everything_it_owns() {
        let env = fixtures::Env::new(fixtures::config());
        let compute = env.compute();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let deployment = compute.deploy(&manifest, &artifact, "main").await.unwrap();

        compute.destroy(&deployment).await.unwrap();
        assert!(!env.platform.role_exists("org-repo-main-svc"));
        assert_eq!(env.platform.calls("delete_policy").len(), 1);
        assert_eq!(env.platform.calls("delete_function").len(), 1);

        // Nothing left to remove.
        env.platform.clear_mutations();
        compute.destroy(&deployment).await.unwrap();
        assert_eq!(env.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn destroy_keeps_shared_cleanup_role() {
        let env = fixtures::Env::new(fixtures::vpc_config());
        let compute = env.compute();
        compute.ensure_cleanup_role().await.unwrap();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let mut deployment = compute.deploy(&manifest, &artifact, "main").await.unwrap();
        deployment.settings.role_arn = env.config.cleanup_role_arn();

        compute.destroy(&deployment).await.unwrap();
        assert!(env.platform.role_exists("AWSLambdaVPCAccessExecutionRole"));
        assert!(env.platform.calls("delete_role").is_empty());
        assert_eq!(env.platform.calls("delete_function").len(), 1);
    }

    #[tokio::test]
    async fn destroy_aborts_on_failure() {
        let env = fixtures::Env::new(fixtures::config());
        let compute = env.compute();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let deployment = compute.deploy(&manifest, &artifact, "main").await.unwrap();

        env.platform
            .fail_next("delete_role", PlatformError::Other("denied".into()))
            .unwrap();
        assert!(compute.destroy(&deployment).await.is_err());
        assert!(env.platform.calls("delete_function").is_empty());
    }

    #[tokio::test]
    async fn ensure_cleanup_role_is_idempotent() {
        let env = fixtures::Env::new(fixtures::vpc_config());
        let compute = env.compute();
        let arn = compute.ensure_cleanup_role().await.unwrap();
        assert_eq!(arn, env.config.cleanup_role_arn());
        assert_eq!(env.platform.calls("attach_policy").len(), 1);

        env.platform.clear_mutations();
        compute.ensure_cleanup_role().await.unwrap();
        assert_eq!(env.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn list_filters_by_repository_and_namespace() {
        let env = fixtures::Env::new(fixtures::config());
        let compute = env.compute();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        compute.deploy(&manifest, &artifact, "main").await.unwrap();
        compute.deploy(&manifest, &artifact, "feature/x").await.unwrap();

        let prefix = RepositoryPrefix::new("org/repo");
        assert_eq!(compute.list(&prefix).await.unwrap().len(), 2);
        let scoped = compute.list_namespace(&prefix, "feature/x").await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "org-repo-feature-x-svc");

        let other = RepositoryPrefix::new("org/other");
        assert!(compute.list(&other).await.unwrap().is_empty());

        let found = compute
            .find(&Identity::new(prefix, "main", "svc"))
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
