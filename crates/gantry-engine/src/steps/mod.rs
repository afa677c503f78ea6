//! Leaf step implementations.

mod artifact_io;
mod check;
mod get;
mod pipeline_ops;
mod put;
mod task;

pub use artifact_io::{ArtifactInputStep, ArtifactOutputStep};
pub use check::CheckStep;
pub use get::GetStep;
pub use pipeline_ops::{LoadVarStep, SetPipelineStep};
pub use put::PutStep;
pub use task::TaskStep;

use std::sync::Arc;

use bytes::Bytes;

use gantry_types::{Build, ContainerMetadata, ContainerOwner, PlanId, StepKind};
use gantry_worker::WorkerSpec;

use crate::delegate::StepDelegate;
use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::Outcome;
use crate::vars::VarScope;
use crate::Services;

/// Everything a leaf gets handed at compile time.
pub(crate) struct LeafCtx {
    pub plan_id: PlanId,
    /// Dotted attempt path (e.g. `"2.1"`) inside retries.
    pub attempt: String,
    pub build: Arc<Build>,
    pub scope: Arc<VarScope>,
    pub services: Arc<Services>,
}

impl LeafCtx {
    pub fn delegate(&self) -> StepDelegate {
        self.services.delegates.delegate(&self.plan_id)
    }

    pub fn owner(&self) -> ContainerOwner {
        ContainerOwner::BuildStep {
            build_id: self.build.id,
            plan_id: self.plan_id.clone(),
            team_id: self.build.team_id,
        }
    }

    pub fn metadata(&self, kind: StepKind, step_name: &str) -> ContainerMetadata {
        ContainerMetadata {
            step_kind: Some(kind),
            step_name: step_name.to_string(),
            attempt: self.attempt.clone(),
            pipeline_id: self.build.pipeline_id,
            job_id: self.build.job_id,
            build_id: self.build.id,
            pipeline_name: self.build.pipeline_name.clone(),
            job_name: self.build.job_name.clone(),
            build_name: self.build.name.clone(),
        }
    }

    pub fn worker_spec(&self, tags: &[String], resource_type: Option<String>) -> WorkerSpec {
        WorkerSpec {
            platform: String::new(),
            tags: tags.to_vec(),
            team_id: Some(self.build.team_id),
            resource_type,
        }
    }
}

/// Emit an `Error` event for errors that are not plain cancellation,
/// then pass the result through.
pub(crate) fn surface_error(
    delegate: &StepDelegate,
    result: Result<Outcome, StepError>,
) -> Result<Outcome, StepError> {
    if let Err(err) = &result {
        if !matches!(err, StepError::Aborted) {
            delegate.errored(&err.to_string());
        }
    }
    result
}

/// Resolve an `artifact/path` file reference against the run's
/// repository and read the file from the owning worker.
pub(crate) async fn read_artifact_file(
    state: &RunState,
    services: &Services,
    reference: &str,
) -> Result<Bytes, StepError> {
    let (artifact_name, file_path) = reference.split_once('/').ok_or_else(|| {
        StepError::user_config(format!(
            "invalid file reference '{reference}' (expected artifact/path)"
        ))
    })?;
    let artifact = state.artifacts().get(artifact_name).ok_or_else(|| {
        StepError::user_config(format!("unknown artifact '{artifact_name}'"))
    })?;
    services
        .streamer
        .stream_file(&artifact, file_path)
        .await
        .map_err(StepError::from)
}
