//! Two-phase creation of VPC-attached functions.
//!
//! A VPC-attached function is created with the shared cleanup role and only
//! then patched onto its own role. The platform releases network interfaces
//! with the creation-time role, so that role has to outlive the function.
//!
//! The phase is observed from live state on every run, so a deploy that
//! stopped between the two steps resumes with the patch.

use keel_platform::Deployment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Where a VPC-attached function is in its creation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpcPhase {
    /// No function exists yet.
    NoFunction,
    /// Created, still running as the shared cleanup role.
    CreatedWithCleanupRole,
    /// Running as its own role.
    PatchedToOwnRole,
}

/// Next call the reconciler has to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpcStep {
    /// Create the function with the cleanup role.
    CreateWithCleanupRole,
    /// Patch the configuration onto the function's own role.
    PatchToOwnRole,
    /// Nothing left for the two-phase sequence.
    Done,
}

#[derive(Debug, Clone)]
pub struct VpcRollout {
    pub function: String,
    pub cleanup_role_arn: String,
    pub phase: VpcPhase,
}

impl VpcRollout {
    /// Derive the phase from the live function, if any.
    pub fn observe(function: &str, cleanup_role_arn: &str, live: Option<&Deployment>) -> Self {
        let phase = match live {
            None => VpcPhase::NoFunction,
            Some(d) if d.role_arn() == cleanup_role_arn => VpcPhase::CreatedWithCleanupRole,
            Some(_) => VpcPhase::PatchedToOwnRole,
        };
        debug!(function, ?phase, "observed vpc phase");
        Self {
            function: function.to_string(),
            cleanup_role_arn: cleanup_role_arn.to_string(),
            phase,
        }
    }

    pub fn next_step(&self) -> VpcStep {
        match self.phase {
            VpcPhase::NoFunction => VpcStep::CreateWithCleanupRole,
            VpcPhase::CreatedWithCleanupRole => VpcStep::PatchToOwnRole,
            VpcPhase::PatchedToOwnRole => VpcStep::Done,
        }
    }

    /// Record that the current step succeeded.
    pub fn advance(&mut self) {
        let next = match self.phase {
            VpcPhase::NoFunction => VpcPhase::CreatedWithCleanupRole,
            VpcPhase::CreatedWithCleanupRole => VpcPhase::PatchedToOwnRole,
            VpcPhase::PatchedToOwnRole => return,
        };
        info!(function = %self.function, from = ?self.phase, to = ?next, "vpc phase advanced");
        self.phase = next;
    }

    pub fn is_done(&self) -> bool {
        self.phase == VpcPhase::PatchedToOwnRole
    }
}
