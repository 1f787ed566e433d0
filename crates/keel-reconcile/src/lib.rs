//! keel-reconcile — converges live cloud resources onto a deployment manifest.
//!
//! Each reconciler owns one resource domain and is safe to re-run:
//! [`compute::ComputeReconciler`] (role, policy, function),
//! [`subscription::SubscriptionReconciler`] (event bus rules), and
//! [`route::RouteReconciler`] (gateway routes). [`engine::Engine`] runs them
//! in order for deploy and in reverse for destroy.

pub mod artifact;
pub mod compute;
pub mod engine;
pub mod error;
pub mod retention;
pub mod retry;
pub mod route;
pub mod subscription;
pub mod vpc;

#[cfg(test)]
pub(crate) mod fixtures;

pub use compute::ComputeReconciler;
pub use engine::{DeploymentStatus, Engine};
pub use error::{ReconcileError, ReconcileResult};
pub use retention::{Plan, plan_deployments, plan_images};
pub use route::RouteReconciler;
pub use subscription::{Meta, Subscription, SubscriptionReconciler, Verdict};
pub use vpc::{VpcPhase, VpcRollout};
