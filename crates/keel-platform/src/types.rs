//! Wire models exchanged with platform services.
//!
//! These mirror the shapes the cloud APIs return, trimmed to the fields the
//! reconcilers read or write.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use keel_core::identity::{TAG_FUNCTION, TAG_NAMESPACE};
use keel_core::{Tags, VpcConfig};
use serde::{Deserialize, Serialize};

/// Image label map.
pub type Labels = BTreeMap<String, String>;

// ── Identity ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub arn: String,
    pub trust_document: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub arn: String,
    pub default_version_id: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyVersion {
    pub version_id: String,
    pub document: String,
    pub is_default: bool,
}

// ── Compute ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Architecture {
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Architecture {
    /// Map an image platform architecture onto a function architecture.
    pub fn from_image(arch: &str) -> Option<Self> {
        match arch {
            "arm64" => Some(Self::Arm64),
            "amd64" | "x86_64" => Some(Self::X86_64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arm64 => f.write_str("arm64"),
            Self::X86_64 => f.write_str("x86_64"),
        }
    }
}

/// Mutable function configuration, replaced wholesale on update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionSettings {
    pub role_arn: String,
    pub memory_mb: i32,
    pub timeout_secs: i32,
    pub ephemeral_storage_mb: i32,
    pub vpc: Option<VpcConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCode {
    pub image_uri: String,
    pub architecture: Architecture,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateFunction {
    pub name: String,
    pub settings: FunctionSettings,
    pub code: FunctionCode,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    InProgress,
    Successful,
    Failed,
}

/// Live snapshot of a deployed function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub arn: String,
    pub settings: FunctionSettings,
    pub code: FunctionCode,
    /// Digest of the image the function runs, e.g. `sha256:…`.
    pub code_digest: String,
    pub reserved_concurrency: Option<i32>,
    pub tags: Tags,
    pub last_modified: DateTime<Utc>,
    pub update_status: UpdateStatus,
}

impl Deployment {
    pub fn role_arn(&self) -> &str {
        &self.settings.role_arn
    }

    pub fn namespace(&self) -> Option<&str> {
        self.tags.get(TAG_NAMESPACE).map(String::as_str)
    }

    pub fn function(&self) -> Option<&str> {
        self.tags.get(TAG_FUNCTION).map(String::as_str)
    }

    pub fn is_settled(&self) -> bool {
        self.update_status != UpdateStatus::InProgress
    }

    /// Registry repository the image came from, e.g. `org/repo/svc`.
    pub fn repository(&self) -> Option<&str> {
        let (_, path) = self.code.image_uri.split_once('/')?;
        let path = path.split_once('@').map_or(path, |(repo, _)| repo);
        match path.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => Some(repo),
            _ => Some(path),
        }
    }
}

/// A resource policy statement granting invoke access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permission {
    pub statement_id: String,
    pub principal: String,
    pub source_arn: String,
}

// ── Event bus ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleExpression {
    Schedule(String),
    Pattern(String),
}

impl RuleExpression {
    /// `cron(...)` and `rate(...)` are schedules; anything else is a pattern.
    pub fn parse(content: &str) -> Self {
        let trimmed = content.trim();
        if trimmed.starts_with("cron(") || trimmed.starts_with("rate(") {
            Self::Schedule(trimmed.to_string())
        } else {
            Self::Pattern(content.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Schedule(s) | Self::Pattern(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub bus: String,
    pub name: String,
    pub arn: String,
    pub expression: RuleExpression,
    pub state: RuleState,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub arn: String,
}

/// A rule joined with one of its targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinedRule {
    pub rule: Rule,
    pub target: Target,
}

// ── Gateway ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub id: String,
    pub name: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationSpec {
    /// Function ARN the integration invokes.
    pub uri: String,
    pub integration_type: String,
    pub payload_format_version: String,
    pub request_parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Integration {
    pub id: String,
    #[serde(flatten)]
    pub spec: IntegrationSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Authorization {
    #[serde(rename = "AWS_IAM")]
    AwsIam,
    #[serde(rename = "NONE")]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSpec {
    pub key: String,
    /// `integrations/{id}`.
    pub target: String,
    pub authorization: Authorization,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    #[serde(flatten)]
    pub spec: RouteSpec,
}

impl Route {
    pub fn integration_id(&self) -> Option<&str> {
        self.spec.target.strip_prefix("integrations/")
    }
}

// ── Registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageRef {
    Tag(String),
    Digest(String),
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, ":{tag}"),
            Self::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

/// Listing entry for one stored image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDetail {
    pub digest: String,
    pub tags: Vec<String>,
    pub pushed_at: DateTime<Utc>,
}

/// A resolved image with its configuration labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub repository: String,
    pub digest: String,
    /// Pullable reference pinned by digest.
    pub uri: String,
    /// Image platform architecture, e.g. `arm64` or `amd64`.
    pub architecture: String,
    pub labels: Labels,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_mapping() {
        assert_eq!(Architecture::from_image("arm64"), Some(Architecture::Arm64));
        assert_eq!(Architecture::from_image("amd64"), Some(Architecture::X86_64));
        assert_eq!(Architecture::from_image("x86_64"), Some(Architecture::X86_64));
        assert_eq!(Architecture::from_image("riscv64"), None);
    }

    #[test]
    fn rule_expression_kind() {
        assert_eq!(
            RuleExpression::parse(" rate(5 minutes)"),
            RuleExpression::Schedule("rate(5 minutes)".into())
        );
        assert!(matches!(
            RuleExpression::parse("cron(0 3 * * ? *)"),
            RuleExpression::Schedule(_)
        ));
        assert!(matches!(
            RuleExpression::parse(r#"{"source":["shop"]}"#),
            RuleExpression::Pattern(_)
        ));
    }

    #[test]
    fn repository_from_image_uri() {
        let mut deployment = Deployment {
            name: "f".into(),
            arn: "arn".into(),
            settings: FunctionSettings {
                role_arn: "r".into(),
                memory_mb: 128,
                timeout_secs: 3,
                ephemeral_storage_mb: 512,
                vpc: None,
            },
            code: FunctionCode {
                image_uri: "1.dkr.ecr.us-east-1.amazonaws.com/org/repo/svc@sha256:ab".into(),
                architecture: Architecture::Arm64,
            },
            code_digest: "sha256:ab".into(),
            reserved_concurrency: None,
            tags: Tags::new(),
            last_modified: Utc::now(),
            update_status: UpdateStatus::Successful,
        };
        assert_eq!(deployment.repository(), Some("org/repo/svc"));

        deployment.code.image_uri = "localhost:5000/org/repo/svc:main".into();
        assert_eq!(deployment.repository(), Some("org/repo/svc"));
    }

    #[test]
    fn route_integration_id() {
        let route = Route {
            id: "r1".into(),
            spec: RouteSpec {
                key: "ANY /x".into(),
                target: "integrations/abc".into(),
                authorization: Authorization::AwsIam,
            },
        };
        assert_eq!(route.integration_id(), Some("abc"));
    }
}
