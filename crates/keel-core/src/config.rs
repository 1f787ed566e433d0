//! keel.toml and environment configuration.
//!
//! A [`KeelConfig`] is assembled once at startup (defaults, then an optional
//! TOML file, then environment variables), validated, and shared read-only
//! with every reconciler.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

pub const ENV_ACCOUNT_ID: &str = "AWS_ACCOUNT_ID";
pub const ENV_REGION: &str = "AWS_REGION";
pub const ENV_REGISTRY_ID: &str = "AWS_ECR_REGISTRY_ID";
pub const ENV_REGISTRY_REGION: &str = "AWS_ECR_REGION";
pub const ENV_GATEWAY_IDS: &str = "AWS_API_GATEWAY_ID";
pub const ENV_SECURITY_GROUP_IDS: &str = "AWS_SECURITY_GROUP_IDS";
pub const ENV_SUBNET_IDS: &str = "AWS_SUBNET_IDS";
pub const ENV_OWNER_PREFIX_ROUTES: &str = "KEEL_OWNER_PREFIX_ROUTES";

/// Name of the shared role used to create VPC-attached functions.
pub const DEFAULT_CLEANUP_ROLE: &str = "AWSLambdaVPCAccessExecutionRole";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub account: AccountConfig,
    pub registry: RegistryConfig,
    pub gateway: GatewayConfig,
    pub vpc: VpcConfig,
    pub routes: RoutesConfig,
    pub compute: ComputeConfig,
    pub retry: RetryConfig,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub id: String,
    pub region: String,
}

/// Registry coordinates. Unset fields fall back to the deploy account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub account_id: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway APIs under management. Routes are mounted on the first one;
    /// unmounting scans all of them.
    pub api_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpcConfig {
    pub security_group_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Include the repository owner segment in derived route keys.
    pub owner_prefix: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub reserved_concurrency: i32,
    pub cleanup_role: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            reserved_concurrency: 5,
            cleanup_role: DEFAULT_CLEANUP_ROLE.to_string(),
        }
    }
}

/// Bounded retry for transient platform errors around function create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// How long to wait for a function update to settle before the next mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 2_000,
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Deploy-time values substituted into manifest templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateData {
    pub account_id: String,
    pub region: String,
    pub registry_account_id: String,
    pub registry_region: String,
}

impl TemplateData {
    /// Look up a template variable by its `{{.Name}}` spelling.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "AccountId" => Some(&self.account_id),
            "Region" => Some(&self.region),
            "RegistryAccountId" => Some(&self.registry_account_id),
            "RegistryRegion" => Some(&self.registry_region),
            _ => None,
        }
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Load from an optional file, overlay the process environment, validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(id) = get(ENV_ACCOUNT_ID) {
            self.account.id = id;
        }
        if let Some(region) = get(ENV_REGION) {
            self.account.region = region;
        }
        if let Some(id) = get(ENV_REGISTRY_ID) {
            self.registry.account_id = Some(id);
        }
        if let Some(region) = get(ENV_REGISTRY_REGION) {
            self.registry.region = Some(region);
        }
        if let Some(ids) = get(ENV_GATEWAY_IDS) {
            self.gateway.api_ids = split_list(&ids);
        }
        if let Some(ids) = get(ENV_SECURITY_GROUP_IDS) {
            self.vpc.security_group_ids = split_list(&ids);
        }
        if let Some(ids) = get(ENV_SUBNET_IDS) {
            self.vpc.subnet_ids = split_list(&ids);
        }
        if let Some(flag) = get(ENV_OWNER_PREFIX_ROUTES) {
            self.routes.owner_prefix = match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_OWNER_PREFIX_ROUTES.to_string(),
                        value: flag,
                    });
                }
            };
        }

        debug!(
            account = %self.account.id,
            region = %self.account.region,
            gateways = self.gateway.api_ids.len(),
            "configuration loaded"
        );
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let groups = self.vpc.security_group_ids.len();
        let subnets = self.vpc.subnet_ids.len();
        if (groups == 0) != (subnets == 0) {
            return Err(ConfigError::PartialVpc {
                security_groups: groups,
                subnets,
            });
        }
        if self.compute.cleanup_role.is_empty() {
            return Err(ConfigError::Missing("compute.cleanup_role"));
        }
        Ok(())
    }

    pub fn registry_account_id(&self) -> &str {
        self.registry.account_id.as_deref().unwrap_or(&self.account.id)
    }

    pub fn registry_region(&self) -> &str {
        self.registry.region.as_deref().unwrap_or(&self.account.region)
    }

    /// Registry host, e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com`.
    pub fn registry_host(&self) -> String {
        format!(
            "{}.dkr.ecr.{}.amazonaws.com",
            self.registry_account_id(),
            self.registry_region()
        )
    }

    /// VPC attachment, only when both halves are configured.
    pub fn vpc_attachment(&self) -> Option<&VpcConfig> {
        if self.vpc.security_group_ids.is_empty() || self.vpc.subnet_ids.is_empty() {
            None
        } else {
            Some(&self.vpc)
        }
    }

    /// Gateway API new routes are mounted on.
    pub fn primary_gateway(&self) -> Option<&str> {
        self.gateway.api_ids.first().map(String::as_str)
    }

    pub fn cleanup_role_arn(&self) -> String {
        crate::identity::role_arn(&self.account.id, &self.compute.cleanup_role)
    }

    pub fn template_data(&self) -> TemplateData {
        TemplateData {
            account_id: self.account.id.clone(),
            region: self.account.region.clone(),
            registry_account_id: self.registry_account_id().to_string(),
            registry_region: self.registry_region().to_string(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
