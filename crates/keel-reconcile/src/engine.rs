//! Engine: runs the reconcilers in dependency order.
//!
//! Deploy goes compute → subscriptions → routes; teardown runs the reverse.
//! Within one deployment every step is sequential. Only listings across
//! many deployments fan out.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{Identity, KeelConfig, RepositoryPrefix};
use keel_platform::{Deployment, ImageDetail, ImageRef, Platform};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::artifact::resolve;
use crate::compute::ComputeReconciler;
use crate::error::{ReconcileError, ReconcileResult};
use crate::retention::{Plan, plan_deployments, plan_images};
use crate::route::{MountedRoute, RouteReconciler};
use crate::subscription::{Subscription, SubscriptionReconciler};

/// One deployment with its subscriptions and mounted routes.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub deployment: Deployment,
    pub subscriptions: Vec<Subscription>,
    pub routes: Vec<MountedRoute>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<KeelConfig>,
    platform: Platform,
    compute: ComputeReconciler,
    subscriptions: SubscriptionReconciler,
    routes: RouteReconciler,
}

impl Engine {
    #[must_use]
    pub fn new(config: Arc<KeelConfig>, platform: Platform) -> Self {
        Self {
            compute: ComputeReconciler::new(config.clone(), platform.clone()),
            subscriptions: SubscriptionReconciler::new(config.clone(), platform.clone()),
            routes: RouteReconciler::new(config.clone(), platform.clone()),
            config,
            platform,
        }
    }

    pub fn compute(&self) -> &ComputeReconciler {
        &self.compute
    }

    pub fn subscriptions(&self) -> &SubscriptionReconciler {
        &self.subscriptions
    }

    pub fn routes(&self) -> &RouteReconciler {
        &self.routes
    }

    /// Deploy the image at `repository` + `reference` into `namespace`.
    pub async fn deploy(
        &self,
        repository: &str,
        reference: &ImageRef,
        namespace: &str,
    ) -> ReconcileResult<Deployment> {
        let (artifact, manifest) =
            resolve(&self.platform, &self.config, repository, reference).await?;
        if self.config.vpc_attachment().is_some() {
            self.compute.ensure_cleanup_role().await?;
        }
        let deployment = self.compute.deploy(&manifest, &artifact, namespace).await?;
        self.subscriptions.converge(&deployment).await?;
        self.routes.converge(&deployment).await?;
        Ok(deployment)
    }

    /// Tear down a deployment. A deployment that does not exist is already
    /// destroyed.
    pub async fn destroy(&self, identity: &Identity) -> ReconcileResult<()> {
        match self.compute.find(identity).await? {
            Some(deployment) => self.teardown(&deployment).await,
            None => {
                info!(function = %identity.resource_name(), "nothing to destroy");
                Ok(())
            }
        }
    }

    async fn teardown(&self, deployment: &Deployment) -> ReconcileResult<()> {
        self.subscriptions.disable_all(deployment).await?;
        self.routes.unmount(deployment).await?;
        self.compute.destroy(deployment).await?;
        info!(function = %deployment.name, "destroyed");
        Ok(())
    }

    pub async fn enable(&self, identity: &Identity) -> ReconcileResult<()> {
        let deployment = self.require(identity).await?;
        self.subscriptions.enable_all(&deployment).await
    }

    pub async fn disable(&self, identity: &Identity) -> ReconcileResult<()> {
        let deployment = self.require(identity).await?;
        self.subscriptions.disable_all(&deployment).await
    }

    async fn require(&self, identity: &Identity) -> ReconcileResult<Deployment> {
        self.compute
            .find(identity)
            .await?
            .ok_or_else(|| ReconcileError::DeploymentNotFound(identity.resource_name()))
    }

    /// Status of every deployment in a namespace, one task per deployment.
    /// The first failure aborts the rest. Order is unspecified.
    pub async fn statuses(
        &self,
        prefix: &RepositoryPrefix,
        namespace: &str,
    ) -> ReconcileResult<Vec<DeploymentStatus>> {
        let deployments = self.compute.list_namespace(prefix, namespace).await?;
        let collected = Arc::new(Mutex::new(Vec::with_capacity(deployments.len())));

        let mut tasks = JoinSet::new();
        for deployment in deployments {
            let engine = self.clone();
            let collected = collected.clone();
            tasks.spawn(async move {
                let subscriptions = engine.subscriptions.list(&deployment).await?;
                let routes = engine.routes.routes_for(&deployment).await?;
                collected.lock().await.push(DeploymentStatus {
                    deployment,
                    subscriptions,
                    routes,
                });
                Ok::<_, ReconcileError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined.map_err(ReconcileError::from).and_then(|r| r) {
                warn!(error = %e, "status listing failed, aborting");
                tasks.abort_all();
                return Err(e);
            }
        }

        let statuses = std::mem::take(&mut *collected.lock().await);
        Ok(statuses)
    }

    // ── Retention ──────────────────────────────────────────────────

    pub async fn plan_release_gc(
        &self,
        repository: &str,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Plan<ImageDetail>> {
        let images = self.platform.registry.list_images(repository).await?;
        Ok(plan_images(images, now))
    }

    /// Delete the images the release plan marks and return the plan.
    pub async fn apply_release_gc(
        &self,
        repository: &str,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Plan<ImageDetail>> {
        let plan = self.plan_release_gc(repository, now).await?;
        if !plan.delete.is_empty() {
            let digests: Vec<String> = plan.delete.iter().map(|i| i.digest.clone()).collect();
            self.platform
                .registry
                .delete_images(repository, &digests)
                .await?;
            info!(repository, deleted = digests.len(), "deleted images");
        }
        Ok(plan)
    }

    pub async fn plan_deployment_gc(
        &self,
        prefix: &RepositoryPrefix,
        namespace: &str,
        defined: &BTreeSet<String>,
    ) -> ReconcileResult<Plan<Deployment>> {
        let deployments = self.compute.list_namespace(prefix, namespace).await?;
        Ok(plan_deployments(deployments, namespace, defined))
    }

    /// Tear down the deployments the plan marks and return the plan.
    pub async fn apply_deployment_gc(
        &self,
        prefix: &RepositoryPrefix,
        namespace: &str,
        defined: &BTreeSet<String>,
    ) -> ReconcileResult<Plan<Deployment>> {
        let plan = self.plan_deployment_gc(prefix, namespace, defined).await?;
        for deployment in &plan.delete {
            self.teardown(deployment).await?;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use keel_platform::PlatformError;

    #[tokio::test]
    async fn destroy_of_missing_deployment_is_a_no_op() {
        let env = fixtures::Env::new(fixtures::config());
        let identity = Identity::new(RepositoryPrefix::new("org/repo"), "main", "svc");
        env.engine().destroy(&identity).await.unwrap();
        assert_eq!(env.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn enable_requires_a_deployment() {
        let env = fixtures::Env::new(fixtures::config());
        let identity = Identity::new(RepositoryPrefix::new("org/repo"), "main", "svc");
        let err = env.engine().enable(&identity).await.unwrap_err();
        assert!(matches!(err, ReconcileError::DeploymentNotFound(name) if name == "org-repo-main-svc"));
    }

    #[tokio::test]
    async fn statuses_cover_every_deployment_in_namespace() {
        let env = fixtures::Env::new(fixtures::config());
        let engine = env.engine();
        for function in ["api", "worker"] {
            let (_, artifact) = env.publish(function, "main", fixtures::SHA_A).await;
            engine
                .deploy(&artifact.repository, &ImageRef::Digest(artifact.digest), "main")
                .await
                .unwrap();
        }

        let prefix = RepositoryPrefix::new("org/repo");
        let mut statuses = engine.statuses(&prefix, "main").await.unwrap();
        statuses.sort_by(|a, b| a.deployment.name.cmp(&b.deployment.name));
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].deployment.name, "org-repo-main-api");
        assert_eq!(statuses[0].routes.len(), 1);
        assert!(engine.statuses(&prefix, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn statuses_fail_on_first_error() {
        let env = fixtures::Env::new(fixtures::config());
        let engine = env.engine();
        let (_, artifact) = env.publish("api", "main", fixtures::SHA_A).await;
        engine
            .deploy(&artifact.repository, &ImageRef::Digest(artifact.digest), "main")
            .await
            .unwrap();

        env.platform
            .fail_next("list_buses", PlatformError::Other("denied".into()))
            .unwrap();
        let prefix = RepositoryPrefix::new("org/repo");
        assert!(engine.statuses(&prefix, "main").await.is_err());
    }

    #[tokio::test]
    async fn release_gc_deletes_only_planned_images() {
        let env = fixtures::Env::new(fixtures::config());
        let engine = env.engine();
        let now = Utc::now();
        let repo = "org/repo/svc";
        env.platform
            .push_image(repo, &[], "arm64", Default::default(), now)
            .unwrap();
        let kept = env
            .platform
            .push_image(repo, &["main"], "arm64", Default::default(), now)
            .unwrap();

        let plan = engine.apply_release_gc(repo, now).await.unwrap();
        assert_eq!(plan.delete.len(), 1);
        let remaining = engine.plan_release_gc(repo, now).await.unwrap();
        assert!(remaining.delete.is_empty());
        assert_eq!(remaining.retain[0].digest, kept);
    }

    #[tokio::test]
    async fn deployment_gc_tears_down_undeclared_functions() {
        let env = fixtures::Env::new(fixtures::config());
        let engine = env.engine();
        for function in ["api", "legacy"] {
            let (_, artifact) = env.publish(function, "main", fixtures::SHA_A).await;
            engine
                .deploy(&artifact.repository, &ImageRef::Digest(artifact.digest), "main")
                .await
                .unwrap();
        }

        let prefix = RepositoryPrefix::new("org/repo");
        let defined = BTreeSet::from(["api".to_string()]);
        let plan = engine
            .apply_deployment_gc(&prefix, "main", &defined)
            .await
            .unwrap();
        assert_eq!(plan.delete.len(), 1);
        assert!(!env.platform.role_exists("org-repo-main-legacy"));
        assert!(env.platform.role_exists("org-repo-main-api"));
        assert_eq!(env.platform.routes(fixtures::API).len(), 1);
    }
}
