//! HTTP route reconciler: gateway integration, route, and invoke permission.
//!
//! Mounting only ever touches the first configured gateway. Unmounting scans
//! every configured gateway for routes whose integration invokes the
//! function, so routes left behind by an earlier route key are removed too.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::KeelConfig;
use keel_core::identity::deslash;
use keel_manifest::Resources;
use keel_platform::{
    Authorization, Deployment, IntegrationSpec, Permission, Platform, PlatformResultExt, Route,
    RouteSpec,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::artifact::manifest_for;
use crate::error::{ReconcileError, ReconcileResult};

/// Tag a gateway API must carry before routes are mounted on it.
pub const MANAGED_TAG: &str = "KeelManaged";

pub const GATEWAY_PRINCIPAL: &str = "apigateway.amazonaws.com";

const INTEGRATION_TYPE: &str = "AWS_PROXY";
const PAYLOAD_FORMAT_VERSION: &str = "2.0";
const PROXY_SEGMENT: &str = "/{proxy+}";

/// A live route that invokes a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedRoute {
    pub api_id: String,
    pub integration_id: String,
    pub route: Route,
}

#[derive(Clone)]
pub struct RouteReconciler {
    config: Arc<KeelConfig>,
    platform: Platform,
}

impl RouteReconciler {
    #[must_use]
    pub fn new(config: Arc<KeelConfig>, platform: Platform) -> Self {
        Self { config, platform }
    }

    /// Mount when a gateway is configured and the manifest exposes HTTP,
    /// otherwise unmount.
    pub async fn converge(&self, deployment: &Deployment) -> ReconcileResult<()> {
        if self.config.gateway.api_ids.is_empty() {
            return self.unmount(deployment).await;
        }
        let manifest = manifest_for(&self.platform, &self.config, deployment).await?;
        let resources = manifest.resources(self.config.routes.owner_prefix)?;
        if resources.http {
            self.mount(deployment, &resources).await
        } else {
            self.unmount(deployment).await
        }
    }

    pub async fn mount(&self, deployment: &Deployment, resources: &Resources) -> ReconcileResult<()> {
        let Some(api_id) = self.config.primary_gateway() else {
            return Ok(());
        };
        let gateway = &self.platform.gateway;
        let api = gateway.get_api(api_id).await?;
        if !api.tags.contains_key(MANAGED_TAG) {
            return Err(ReconcileError::GatewayNotManaged(api_id.to_string()));
        }

        let key = resources.route_key.as_str();
        let integration_spec = IntegrationSpec {
            uri: deployment.arn.clone(),
            integration_type: INTEGRATION_TYPE.to_string(),
            payload_format_version: PAYLOAD_FORMAT_VERSION.to_string(),
            request_parameters: BTreeMap::from([
                (
                    "overwrite:path".to_string(),
                    "/$request.path.proxy".to_string(),
                ),
                (
                    "overwrite:header.X-Forwarded-Prefix".to_string(),
                    base_path(path_of(key)).to_string(),
                ),
            ]),
        };
        let integrations = gateway.list_integrations(api_id).await?;
        let integration_id = match integrations
            .into_iter()
            .find(|i| i.spec.uri == deployment.arn)
        {
            Some(i) if i.spec == integration_spec => i.id,
            Some(i) => {
                let updated = gateway
                    .update_integration(api_id, &i.id, &integration_spec)
                    .await?;
                debug!(api = api_id, integration = %updated.id, "updated integration");
                updated.id
            }
            None => {
                let created = gateway
                    .create_integration(api_id, &integration_spec)
                    .await?;
                debug!(api = api_id, integration = %created.id, "created integration");
                created.id
            }
        };

        let route_spec = RouteSpec {
            key: key.to_string(),
            target: format!("integrations/{integration_id}"),
            authorization: if resources.public {
                Authorization::None
            } else {
                Authorization::AwsIam
            },
        };
        let routes = gateway.list_routes(api_id).await?;
        match routes.into_iter().find(|r| r.spec.key == key) {
            Some(r) if r.spec == route_spec => {}
            Some(r) => {
                gateway.update_route(api_id, &r.id, &route_spec).await?;
                info!(api = api_id, route = key, "updated route");
            }
            None => {
                gateway.create_route(api_id, &route_spec).await?;
                info!(api = api_id, route = key, "mounted route");
            }
        }

        let statement_id = statement_id(key);
        let compute = &self.platform.compute;
        let permissions = compute.list_permissions(&deployment.name).await?;
        if !permissions.iter().any(|p| p.statement_id == statement_id) {
            let permission = Permission {
                statement_id,
                principal: GATEWAY_PRINCIPAL.to_string(),
                source_arn: self.source_arn(api_id, key),
            };
            compute
                .add_permission(&deployment.name, &permission)
                .await
                .tolerate_conflict()?;
        }
        Ok(())
    }

    /// Remove every route, permission, and integration that invokes the
    /// deployment on any configured gateway.
    pub async fn unmount(&self, deployment: &Deployment) -> ReconcileResult<()> {
        let gateway = &self.platform.gateway;
        let compute = &self.platform.compute;
        for api_id in &self.config.gateway.api_ids {
            let Some(integrations) = gateway
                .list_integrations(api_id)
                .await
                .tolerate_not_found()?
            else {
                debug!(api = %api_id, "gateway not found, skipping");
                continue;
            };
            let owned: Vec<String> = integrations
                .into_iter()
                .filter(|i| i.spec.uri == deployment.arn)
                .map(|i| i.id)
                .collect();
            if owned.is_empty() {
                continue;
            }

            for route in gateway.list_routes(api_id).await? {
                let Some(integration) = route.integration_id() else {
                    continue;
                };
                if !owned.iter().any(|id| id == integration) {
                    continue;
                }
                gateway
                    .delete_route(api_id, &route.id)
                    .await
                    .tolerate_not_found()?;
                compute
                    .remove_permission(&deployment.name, &statement_id(&route.spec.key))
                    .await
                    .tolerate_not_found()?;
                info!(api = %api_id, route = %route.spec.key, "unmounted route");
            }
            for integration in &owned {
                gateway
                    .delete_integration(api_id, integration)
                    .await
                    .tolerate_not_found()?;
            }
        }
        Ok(())
    }

    /// Live routes invoking the deployment across every configured gateway.
    pub async fn routes_for(&self, deployment: &Deployment) -> ReconcileResult<Vec<MountedRoute>> {
        let gateway = &self.platform.gateway;
        let mut mounted = Vec::new();
        for api_id in &self.config.gateway.api_ids {
            let Some(integrations) = gateway
                .list_integrations(api_id)
                .await
                .tolerate_not_found()?
            else {
                continue;
            };
            let owned: Vec<String> = integrations
                .into_iter()
                .filter(|i| i.spec.uri == deployment.arn)
                .map(|i| i.id)
                .collect();
            for route in gateway.list_routes(api_id).await? {
                if let Some(integration) = route
                    .integration_id()
                    .filter(|id| owned.iter().any(|o| o == id))
                {
                    mounted.push(MountedRoute {
                        api_id: api_id.clone(),
                        integration_id: integration.to_string(),
                        route: route.clone(),
                    });
                }
            }
        }
        Ok(mounted)
    }

    fn source_arn(&self, api_id: &str, route_key: &str) -> String {
        format!(
            "arn:aws:execute-api:{}:{}:{api_id}/*/*{}",
            self.config.account.region,
            self.config.account.id,
            path_of(route_key).replace("{proxy+}", "*")
        )
    }
}

/// Path part of a route key, `ANY /a/b` → `/a/b`.
fn path_of(route_key: &str) -> &str {
    route_key
        .split_once(' ')
        .map_or(route_key, |(_, path)| path)
}

fn base_path(path: &str) -> &str {
    path.strip_suffix(PROXY_SEGMENT).unwrap_or(path)
}

/// Permission statement id for a route key, e.g. `repo-main-svc-api-gw`.
pub fn statement_id(route_key: &str) -> String {
    let base = base_path(path_of(route_key)).replace(['{', '}'], "");
    format!("{}-api-gw", deslash(&base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use keel_core::Tags;
    use keel_platform::ComputeService;

    #[test]
    fn statement_id_from_route_key() {
        assert_eq!(
            statement_id("ANY /repo/feature-x/svc/{proxy+}"),
            "repo-feature-x-svc-api-gw"
        );
        assert_eq!(statement_id("GET /items/{id}"), "items-id-api-gw");
    }

    #[tokio::test]
    async fn mount_binds_route_and_grants_invoke() {
        let env = fixtures::Env::new(fixtures::config());
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let deployment = env.compute().deploy(&manifest, &artifact, "main").await.unwrap();
        let routes = env.routes();

        routes.converge(&deployment).await.unwrap();

        let live = env.platform.routes(fixtures::API);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].spec.key, "ANY /repo/main/svc/{proxy+}");
        assert_eq!(live[0].spec.authorization, Authorization::AwsIam);

        let integrations = env.platform.integrations(fixtures::API);
        assert_eq!(integrations.len(), 1);
        assert_eq!(integrations[0].spec.uri, deployment.arn);
        assert_eq!(
            integrations[0].spec.request_parameters["overwrite:header.X-Forwarded-Prefix"],
            "/repo/main/svc"
        );

        let permissions = env.platform.list_permissions(&deployment.name).await.unwrap();
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].statement_id, "repo-main-svc-api-gw");
        assert_eq!(permissions[0].principal, GATEWAY_PRINCIPAL);
        assert_eq!(
            permissions[0].source_arn,
            "arn:aws:execute-api:us-east-1:123456789012:api-1/*/*/repo/main/svc/*"
        );

        env.platform.clear_mutations();
        routes.converge(&deployment).await.unwrap();
        assert_eq!(env.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn public_route_has_no_authorization() {
        let env = fixtures::Env::new(fixtures::config());
        let (manifest, artifact) = env
            .publish_with(
                "svc",
                "main",
                fixtures::SHA_A,
                fixtures::POLICY,
                Some(r#"{"public": true, "routeKey": "GET /hooks/{proxy+}"}"#),
                &[],
            )
            .await;
        let deployment = env.compute().deploy(&manifest, &artifact, "main").await.unwrap();
        env.routes().converge(&deployment).await.unwrap();

        let live = env.platform.routes(fixtures::API);
        assert_eq!(live[0].spec.key, "GET /hooks/{proxy+}");
        assert_eq!(live[0].spec.authorization, Authorization::None);
    }

    #[tokio::test]
    async fn http_disabled_unmounts() {
        let env = fixtures::Env::new(fixtures::config());
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let deployment = env.compute().deploy(&manifest, &artifact, "main").await.unwrap();
        let routes = env.routes();
        routes.converge(&deployment).await.unwrap();
        assert_eq!(routes.routes_for(&deployment).await.unwrap().len(), 1);

        let (manifest, artifact) = env
            .publish_with(
                "svc",
                "main",
                fixtures::SHAS[1],
                fixtures::POLICY,
                Some(r#"{"http": false}"#),
                &[],
            )
            .await;
        let deployment = env.compute().deploy(&manifest, &artifact, "main").await.unwrap();
        routes.converge(&deployment).await.unwrap();

        assert!(routes.routes_for(&deployment).await.unwrap().is_empty());
        assert!(env.platform.integrations(fixtures::API).is_empty());
        assert!(env
            .platform
            .list_permissions(&deployment.name)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unmanaged_gateway_is_refused() {
        let env = fixtures::Env::new(fixtures::config());
        env.platform.add_api(fixtures::API, Tags::new()).unwrap();
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let deployment = env.compute().deploy(&manifest, &artifact, "main").await.unwrap();

        let err = env.routes().converge(&deployment).await.unwrap_err();
        assert!(matches!(err, ReconcileError::GatewayNotManaged(id) if id == fixtures::API));
        assert!(env.platform.routes(fixtures::API).is_empty());
    }

    #[tokio::test]
    async fn no_gateway_configured_is_a_no_op() {
        let mut config = fixtures::config();
        config.gateway.api_ids.clear();
        let env = fixtures::Env::new(config);
        let (manifest, artifact) = env.publish("svc", "main", fixtures::SHA_A).await;
        let deployment = env.compute().deploy(&manifest, &artifact, "main").await.unwrap();

        env.platform.clear_mutations();
        env.routes().converge(&deployment).await.unwrap();
        assert_eq!(env.platform.mutation_count(), 0);
    }
}
