//! Platform service traits.
//!
//! Calls map one-to-one onto cloud API operations. Idempotence decisions
//! (what counts as already done) belong to the reconcilers, not here.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::Tags;

use crate::error::PlatformResult;
use crate::memory::InMemoryPlatform;
use crate::types::*;

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn get_role(&self, name: &str) -> PlatformResult<Option<Role>>;

    /// Fails with `Conflict` if the role exists.
    async fn create_role(&self, name: &str, trust_document: &str, tags: &Tags)
    -> PlatformResult<Role>;

    async fn update_trust_document(&self, name: &str, trust_document: &str) -> PlatformResult<()>;

    async fn tag_role(&self, name: &str, tags: &Tags) -> PlatformResult<()>;

    async fn untag_role(&self, name: &str, keys: &[String]) -> PlatformResult<()>;

    async fn delete_role(&self, name: &str) -> PlatformResult<()>;

    async fn list_attached_policies(&self, role: &str) -> PlatformResult<Vec<String>>;

    async fn attach_policy(&self, role: &str, policy_arn: &str) -> PlatformResult<()>;

    async fn detach_policy(&self, role: &str, policy_arn: &str) -> PlatformResult<()>;

    async fn get_policy(&self, arn: &str) -> PlatformResult<Option<Policy>>;

    /// Fails with `Conflict` if the policy exists.
    async fn create_policy(&self, name: &str, document: &str, tags: &Tags)
    -> PlatformResult<Policy>;

    async fn list_policy_versions(&self, arn: &str) -> PlatformResult<Vec<PolicyVersion>>;

    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_default: bool,
    ) -> PlatformResult<PolicyVersion>;

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> PlatformResult<()>;

    async fn tag_policy(&self, arn: &str, tags: &Tags) -> PlatformResult<()>;

    async fn untag_policy(&self, arn: &str, keys: &[String]) -> PlatformResult<()>;

    async fn delete_policy(&self, arn: &str) -> PlatformResult<()>;
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn get_function(&self, name: &str) -> PlatformResult<Option<Deployment>>;

    async fn list_functions(&self) -> PlatformResult<Vec<Deployment>>;

    /// Fails with `Conflict` if the function exists.
    async fn create_function(&self, input: &CreateFunction) -> PlatformResult<Deployment>;

    async fn update_function_configuration(
        &self,
        name: &str,
        settings: &FunctionSettings,
    ) -> PlatformResult<Deployment>;

    async fn update_function_code(&self, name: &str, code: &FunctionCode)
    -> PlatformResult<Deployment>;

    async fn put_function_concurrency(&self, name: &str, reserved: i32) -> PlatformResult<()>;

    async fn tag_function(&self, arn: &str, tags: &Tags) -> PlatformResult<()>;

    async fn untag_function(&self, arn: &str, keys: &[String]) -> PlatformResult<()>;

    async fn delete_function(&self, name: &str) -> PlatformResult<()>;

    async fn list_permissions(&self, function: &str) -> PlatformResult<Vec<Permission>>;

    /// Fails with `Conflict` if the statement id is taken.
    async fn add_permission(&self, function: &str, permission: &Permission) -> PlatformResult<()>;

    async fn remove_permission(&self, function: &str, statement_id: &str) -> PlatformResult<()>;
}

#[async_trait]
pub trait EventService: Send + Sync {
    async fn list_buses(&self) -> PlatformResult<Vec<String>>;

    async fn list_rules(&self, bus: &str) -> PlatformResult<Vec<Rule>>;

    async fn describe_rule(&self, bus: &str, name: &str) -> PlatformResult<Option<Rule>>;

    async fn list_targets(&self, bus: &str, rule: &str) -> PlatformResult<Vec<Target>>;

    /// Create or replace a rule; the result is enabled.
    async fn put_rule(
        &self,
        bus: &str,
        name: &str,
        expression: &RuleExpression,
        description: &str,
    ) -> PlatformResult<Rule>;

    async fn put_target(&self, bus: &str, rule: &str, target: &Target) -> PlatformResult<()>;

    async fn remove_target(&self, bus: &str, rule: &str, target_id: &str) -> PlatformResult<()>;

    async fn delete_rule(&self, bus: &str, name: &str) -> PlatformResult<()>;
}

#[async_trait]
pub trait GatewayService: Send + Sync {
    async fn get_api(&self, api_id: &str) -> PlatformResult<Api>;

    async fn list_integrations(&self, api_id: &str) -> PlatformResult<Vec<Integration>>;

    async fn create_integration(
        &self,
        api_id: &str,
        spec: &IntegrationSpec,
    ) -> PlatformResult<Integration>;

    async fn update_integration(
        &self,
        api_id: &str,
        integration_id: &str,
        spec: &IntegrationSpec,
    ) -> PlatformResult<Integration>;

    async fn delete_integration(&self, api_id: &str, integration_id: &str) -> PlatformResult<()>;

    async fn list_routes(&self, api_id: &str) -> PlatformResult<Vec<Route>>;

    async fn create_route(&self, api_id: &str, spec: &RouteSpec) -> PlatformResult<Route>;

    async fn update_route(&self, api_id: &str, route_id: &str, spec: &RouteSpec)
    -> PlatformResult<Route>;

    async fn delete_route(&self, api_id: &str, route_id: &str) -> PlatformResult<()>;
}

#[async_trait]
pub trait RegistryService: Send + Sync {
    async fn inspect(&self, repository: &str, reference: &ImageRef) -> PlatformResult<Artifact>;

    async fn list_images(&self, repository: &str) -> PlatformResult<Vec<ImageDetail>>;

    async fn delete_images(&self, repository: &str, digests: &[String]) -> PlatformResult<()>;
}

/// Handles to every service, shared by the reconcilers.
#[derive(Clone)]
pub struct Platform {
    pub identity: Arc<dyn IdentityService>,
    pub compute: Arc<dyn ComputeService>,
    pub events: Arc<dyn EventService>,
    pub gateway: Arc<dyn GatewayService>,
    pub registry: Arc<dyn RegistryService>,
}

impl Platform {
    /// Route every service to one in-memory platform.
    pub fn in_memory(platform: Arc<InMemoryPlatform>) -> Self {
        Self {
            identity: platform.clone(),
            compute: platform.clone(),
            events: platform.clone(),
            gateway: platform.clone(),
            registry: platform,
        }
    }
}
