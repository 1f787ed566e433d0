//! Subscription reconciler: event bus rules that invoke a deployment.
//!
//! Declared rules come from the manifest of the image the deployment runs.
//! Live rules are found by scanning every bus for targets pointing at the
//! function. The two sets are joined on bus and short rule name, and each
//! subscription gets a [`Verdict`].

use std::sync::Arc;

use keel_core::KeelConfig;
use keel_platform::{
    Deployment, JoinedRule, Permission, Platform, PlatformResultExt, Rule, RuleExpression,
    RuleState, Target,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::artifact::manifest_for;
use crate::error::{ReconcileError, ReconcileResult};

/// Description stamped on every rule keel creates.
pub const RULE_DESCRIPTION: &str = "managed by keel";

/// Principal allowed to invoke the function for rule deliveries.
pub const EVENTS_PRINCIPAL: &str = "events.amazonaws.com";

const REASON_UPDATE: &str = "Enabled and Defined";
const REASON_DESTROY: &str = "Enabled and Not Defined";
const REASON_NOOP: &str = "Defined and Not Enabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// Live and declared: bring the live rule in line.
    Update,
    /// Live but no longer declared: remove.
    Destroy,
    /// Declared but never enabled: leave alone.
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub verdict: Verdict,
    pub reason: &'static str,
    /// Expression to put when enabling. Declared expression for `Update` and
    /// `Noop`, the live one for `Destroy`.
    pub expression: Option<RuleExpression>,
}

impl Meta {
    pub fn update(&self) -> bool {
        self.verdict == Verdict::Update
    }

    pub fn destroy(&self) -> bool {
        self.verdict == Verdict::Destroy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub bus: String,
    /// Full rule name, `{function resource name}-{short name}`.
    pub rule: String,
    pub short_name: String,
    pub live: Option<Rule>,
    pub target: Option<Target>,
    pub meta: Meta,
}

struct Declared {
    bus: String,
    short_name: String,
    expression: RuleExpression,
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    config: Arc<KeelConfig>,
    platform: Platform,
}

impl SubscriptionReconciler {
    #[must_use]
    pub fn new(config: Arc<KeelConfig>, platform: Platform) -> Self {
        Self { config, platform }
    }

    /// Classify declared and live rules. Order: every `Update`, then every
    /// `Destroy` (both in live order), then every `Noop` (declared order).
    pub async fn list(&self, deployment: &Deployment) -> ReconcileResult<Vec<Subscription>> {
        let manifest = manifest_for(&self.platform, &self.config, deployment).await?;
        let declared: Vec<Declared> = manifest
            .bus_rules()
            .into_iter()
            .map(|r| Declared {
                bus: r.bus,
                short_name: r.rule,
                expression: RuleExpression::parse(&r.content),
            })
            .collect();
        let active = self.active(deployment).await?;

        let mut updates = Vec::new();
        let mut destroys = Vec::new();
        for joined in &active {
            let short = short_name(deployment, &joined.rule.name);
            let defined = declared
                .iter()
                .find(|d| d.bus == joined.rule.bus && d.short_name == short);
            let meta = match defined {
                Some(d) => Meta {
                    verdict: Verdict::Update,
                    reason: REASON_UPDATE,
                    expression: Some(d.expression.clone()),
                },
                None => Meta {
                    verdict: Verdict::Destroy,
                    reason: REASON_DESTROY,
                    expression: Some(joined.rule.expression.clone()),
                },
            };
            let subscription = Subscription {
                bus: joined.rule.bus.clone(),
                rule: joined.rule.name.clone(),
                short_name: short.to_string(),
                live: Some(joined.rule.clone()),
                target: Some(joined.target.clone()),
                meta,
            };
            if subscription.meta.update() {
                updates.push(subscription);
            } else {
                destroys.push(subscription);
            }
        }

        let noops = declared
            .into_iter()
            .filter(|d| {
                !active.iter().any(|j| {
                    j.rule.bus == d.bus && short_name(deployment, &j.rule.name) == d.short_name
                })
            })
            .map(|d| Subscription {
                rule: rule_name(deployment, &d.short_name),
                bus: d.bus,
                short_name: d.short_name,
                live: None,
                target: None,
                meta: Meta {
                    verdict: Verdict::Noop,
                    reason: REASON_NOOP,
                    expression: Some(d.expression),
                },
            });

        let mut subscriptions = updates;
        subscriptions.append(&mut destroys);
        subscriptions.extend(noops);
        debug!(function = %deployment.name, count = subscriptions.len(), "listed subscriptions");
        Ok(subscriptions)
    }

    pub async fn find(
        &self,
        deployment: &Deployment,
        bus: &str,
        rule: &str,
    ) -> ReconcileResult<Option<Subscription>> {
        Ok(self
            .list(deployment)
            .await?
            .into_iter()
            .find(|s| s.bus == bus && (s.short_name == rule || s.rule == rule)))
    }

    /// Update live rules that are still declared, remove the rest. Declared
    /// rules that were never enabled stay disabled.
    pub async fn converge(&self, deployment: &Deployment) -> ReconcileResult<()> {
        for subscription in self.list(deployment).await? {
            match subscription.meta.verdict {
                Verdict::Update => self.enable(deployment, &subscription).await?,
                Verdict::Destroy => self.disable(deployment, &subscription).await?,
                Verdict::Noop => {}
            }
        }
        Ok(())
    }

    pub async fn enable_all(&self, deployment: &Deployment) -> ReconcileResult<()> {
        for subscription in self.list(deployment).await? {
            self.enable(deployment, &subscription).await?;
        }
        Ok(())
    }

    pub async fn disable_all(&self, deployment: &Deployment) -> ReconcileResult<()> {
        for subscription in self.list(deployment).await? {
            self.disable(deployment, &subscription).await?;
        }
        Ok(())
    }

    /// Put the rule, its target, and the invoke permission, skipping any
    /// that already match.
    pub async fn enable(
        &self,
        deployment: &Deployment,
        subscription: &Subscription,
    ) -> ReconcileResult<()> {
        let events = &self.platform.events;
        let (bus, name) = (subscription.bus.as_str(), subscription.rule.as_str());
        let expression = subscription
            .meta
            .expression
            .as_ref()
            .ok_or_else(|| ReconcileError::MissingExpression(name.to_string()))?;

        let rule = match events.describe_rule(bus, name).await? {
            Some(rule)
                if &rule.expression == expression
                    && rule.state == RuleState::Enabled
                    && rule.description == RULE_DESCRIPTION =>
            {
                rule
            }
            _ => {
                let rule = events
                    .put_rule(bus, name, expression, RULE_DESCRIPTION)
                    .await?;
                info!(bus, rule = name, "put rule");
                rule
            }
        };

        let target = Target {
            id: deployment.name.clone(),
            arn: deployment.arn.clone(),
        };
        let targets = events.list_targets(bus, name).await?;
        if !targets.contains(&target) {
            events.put_target(bus, name, &target).await?;
            debug!(bus, rule = name, "put target");
        }

        let compute = &self.platform.compute;
        let permissions = compute.list_permissions(&deployment.name).await?;
        if !permissions.iter().any(|p| p.statement_id == name) {
            let permission = Permission {
                statement_id: name.to_string(),
                principal: EVENTS_PRINCIPAL.to_string(),
                source_arn: rule.arn.clone(),
            };
            compute
                .add_permission(&deployment.name, &permission)
                .await
                .tolerate_conflict()?;
        }
        Ok(())
    }

    /// Remove target, rule, and permission. Anything already gone is fine.
    pub async fn disable(
        &self,
        deployment: &Deployment,
        subscription: &Subscription,
    ) -> ReconcileResult<()> {
        let events = &self.platform.events;
        let (bus, name) = (subscription.bus.as_str(), subscription.rule.as_str());
        let target_id = subscription
            .target
            .as_ref()
            .map_or(deployment.name.as_str(), |t| t.id.as_str());

        events
            .remove_target(bus, name, target_id)
            .await
            .tolerate_not_found()?;
        events.delete_rule(bus, name).await.tolerate_not_found()?;
        self.platform
            .compute
            .remove_permission(&deployment.name, name)
            .await
            .tolerate_not_found()?;
        info!(bus, rule = name, "disabled subscription");
        Ok(())
    }

    /// Every live rule on any bus with a target pointing at the function.
    async fn active(&self, deployment: &Deployment) -> ReconcileResult<Vec<JoinedRule>> {
        let events = &self.platform.events;
        let mut active = Vec::new();
        for bus in events.list_buses().await? {
            for rule in events.list_rules(&bus).await? {
                let targets = events
                    .list_targets(&bus, &rule.name)
                    .await
                    .tolerate_not_found()?
                    .unwrap_or_default();
                if let Some(target) = targets.into_iter().find(|t| t.arn == deployment.arn) {
                    active.push(JoinedRule {
                        rule: rule.clone(),
                        target,
                    });
                }
            }
        }
        Ok(active)
    }
}

fn rule_name(deployment: &Deployment, short: &str) -> String {
    format!("{}-{short}", deployment.name)
}

fn short_name<'a>(deployment: &Deployment, rule: &'a str) -> &'a str {
    rule.strip_prefix(deployment.name.as_str())
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(rule)
}
