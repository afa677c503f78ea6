//! Container ownership and persisted container metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{PlanId, StepKind};

/// Who a container belongs to. At most one container exists per owner
/// per worker, enforced by a storage uniqueness constraint on the
/// owner's canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerOwner {
    /// A step of a running build.
    BuildStep {
        build_id: i64,
        plan_id: PlanId,
        team_id: i64,
    },
    /// A periodic resource check; expires so abandoned check containers
    /// can be reaped.
    ResourceConfigCheck {
        scope_id: i64,
        expires_at: DateTime<Utc>,
    },
    /// A base resource type image import.
    ResourceType { worker_base_resource_type_id: i64 },
}

impl ContainerOwner {
    /// Canonical key used for the at-most-one-container constraint.
    /// Expiry is deliberately not part of check-owner identity.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::BuildStep {
                build_id,
                plan_id,
                team_id,
            } => format!("build-step/{build_id}/{plan_id}/{team_id}"),
            Self::ResourceConfigCheck { scope_id, .. } => {
                format!("resource-config-check/{scope_id}")
            }
            Self::ResourceType {
                worker_base_resource_type_id,
            } => format!("resource-type/{worker_base_resource_type_id}"),
        }
    }
}

/// Descriptive metadata persisted with a container row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_kind: Option<StepKind>,
    #[serde(default)]
    pub step_name: String,
    /// Dotted attempt path (e.g. `"2.1"`) when inside retries.
    #[serde(default)]
    pub attempt: String,
    #[serde(default)]
    pub pipeline_id: i64,
    #[serde(default)]
    pub job_id: i64,
    #[serde(default)]
    pub build_id: i64,
    #[serde(default)]
    pub pipeline_name: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub build_name: String,
}
