//! Shared test environment: an in-memory platform plus a scratch directory
//! for building function images.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use keel_core::identity::deslash;
use keel_core::{GitContext, KeelConfig, Tags};
use keel_manifest::TemplatedManifest;
use keel_manifest::encode::encode_function;
use keel_platform::{Artifact, ImageRef, InMemoryPlatform, Platform};
use tempfile::TempDir;

use crate::artifact::resolve;
use crate::compute::ComputeReconciler;
use crate::engine::Engine;
use crate::route::{MANAGED_TAG, RouteReconciler};
use crate::subscription::SubscriptionReconciler;

pub const ACCOUNT: &str = "123456789012";
pub const REGION: &str = "us-east-1";
pub const API: &str = "api-1";
pub const ORIGIN: &str = "https://github.com/org/repo.git";

pub const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const SHAS: [&str; 6] = [
    SHA_A,
    "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
    "cccccccccccccccccccccccccccccccccccccccc",
    "dddddddddddddddddddddddddddddddddddddddd",
    "eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee",
    "ffffffffffffffffffffffffffffffffffffffff",
];

pub const POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {"Effect": "Allow", "Action": "sqs:SendMessage", "Resource": "arn:aws:sqs:{{.Region}}:{{.AccountId}}:jobs"}
  ]
}"#;

pub fn config() -> KeelConfig {
    let mut config = KeelConfig::default();
    config.account.id = ACCOUNT.into();
    config.account.region = REGION.into();
    config.gateway.api_ids = vec![API.into()];
    config.retry.base_delay_ms = 0;
    config.readiness.interval_ms = 0;
    config
}

pub fn vpc_config() -> KeelConfig {
    let mut config = config();
    config.vpc.security_group_ids = vec!["sg-1".into()];
    config.vpc.subnet_ids = vec!["subnet-1".into(), "subnet-2".into()];
    config
}

pub struct Env {
    pub config: Arc<KeelConfig>,
    pub platform: Arc<InMemoryPlatform>,
    dir: TempDir,
}

impl Env {
    pub fn new(config: KeelConfig) -> Self {
        let platform = Arc::new(InMemoryPlatform::new(ACCOUNT, REGION));
        let managed = Tags::from([(MANAGED_TAG.to_string(), "true".to_string())]);
        for id in &config.gateway.api_ids {
            platform.add_api(id, managed.clone()).unwrap();
        }
        Self {
            config: Arc::new(config),
            platform,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn handle(&self) -> Platform {
        Platform::in_memory(self.platform.clone())
    }

    pub fn compute(&self) -> ComputeReconciler {
        ComputeReconciler::new(self.config.clone(), self.handle())
    }

    pub fn subscriptions(&self) -> SubscriptionReconciler {
        SubscriptionReconciler::new(self.config.clone(), self.handle())
    }

    pub fn routes(&self) -> RouteReconciler {
        RouteReconciler::new(self.config.clone(), self.handle())
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.config.clone(), self.handle())
    }

    /// Build and push an image with the default policy and no extras.
    pub async fn publish(
        &self,
        function: &str,
        branch: &str,
        sha: &str,
    ) -> (TemplatedManifest, Artifact) {
        self.publish_with(function, branch, sha, POLICY, None, &[])
            .await
    }

    /// Build and push an image. `rules` are paths under `bus/` with content.
    pub async fn publish_with(
        &self,
        function: &str,
        branch: &str,
        sha: &str,
        policy: &str,
        resources: Option<&str>,
        rules: &[(&str, &str)],
    ) -> (TemplatedManifest, Artifact) {
        let dir = self.dir.path().join(sha).join(function);
        write_function(&dir, policy, resources, rules);

        let git = GitContext {
            branch: branch.into(),
            sha: sha.into(),
            origin: ORIGIN.into(),
        };
        let encoded = encode_function(&dir, function, &git).unwrap();
        let repository = format!("org/repo/{function}");
        let branch_tag = deslash(branch);
        let digest = self
            .platform
            .push_image(
                &repository,
                &[sha, branch_tag.as_str()],
                "arm64",
                encoded.labels,
                Utc::now(),
            )
            .unwrap();

        let (artifact, manifest) = resolve(
            &self.handle(),
            &self.config,
            &repository,
            &ImageRef::Digest(digest),
        )
        .await
        .unwrap();
        (manifest, artifact)
    }
}

fn write_function(dir: &Path, policy: &str, resources: Option<&str>, rules: &[(&str, &str)]) {
    if dir.exists() {
        fs::remove_dir_all(dir).unwrap();
    }
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("policy.json.tmpl"), policy).unwrap();
    if let Some(resources) = resources {
        fs::write(dir.join("resources.json.tmpl"), resources).unwrap();
    }
    for (path, content) in rules {
        let file = dir.join("bus").join(path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(file, content).unwrap();
    }
}
