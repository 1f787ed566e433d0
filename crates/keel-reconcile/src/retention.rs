//! Retention planning for registry images and namespace deployments.
//!
//! Planning is pure: callers pass in the listing and the clock, and get back
//! what to keep and what to delete. Applying a plan lives in the engine.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use keel_platform::{Deployment, ImageDetail};
use serde::Serialize;

/// Weeks after which a commit-only image is deleted.
pub const MAX_COMMIT_IMAGE_WEEKS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan<T> {
    pub retain: Vec<T>,
    pub delete: Vec<T>,
}

impl<T> Default for Plan<T> {
    fn default() -> Self {
        Self {
            retain: Vec::new(),
            delete: Vec::new(),
        }
    }
}

/// A full 40-character lowercase hex commit id.
pub fn is_commit_tag(tag: &str) -> bool {
    tag.len() == 40 && tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Sort images by tag state and age.
///
/// - no tags at all: delete
/// - only commit tags, pushed more than four weeks before `now`: delete
/// - any branch tag: retain
pub fn plan_images(images: Vec<ImageDetail>, now: DateTime<Utc>) -> Plan<ImageDetail> {
    let mut plan = Plan::default();
    for image in images {
        let has_branch = image.tags.iter().any(|t| !is_commit_tag(t));
        let keep = if image.tags.is_empty() {
            false
        } else if has_branch {
            true
        } else {
            now - image.pushed_at <= TimeDelta::weeks(MAX_COMMIT_IMAGE_WEEKS)
        };
        if keep {
            plan.retain.push(image);
        } else {
            plan.delete.push(image);
        }
    }
    plan
}

/// Sort one namespace's deployments by whether their function is still
/// declared. Deployments from other namespaces are left out of the plan.
pub fn plan_deployments(
    deployments: Vec<Deployment>,
    namespace: &str,
    defined: &BTreeSet<String>,
) -> Plan<Deployment> {
    let mut plan = Plan::default();
    for deployment in deployments
        .into_iter()
        .filter(|d| d.namespace() == Some(namespace))
    {
        let declared = deployment.function().is_some_and(|f| defined.contains(f));
        if declared {
            plan.retain.push(deployment);
        } else {
            plan.delete.push(deployment);
        }
    }
    plan
}
