//! Bridging build-provided artifact slots and the run's repository.

use gantry_types::plan::{ArtifactInputPlan, ArtifactOutputPlan};
use gantry_worker::Artifact;

use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::{Outcome, RunContext};
use crate::steps::LeafCtx;

/// Materialize a persisted build artifact into the repository under a
/// name the rest of the plan can consume.
pub struct ArtifactInputStep {
    ctx: LeafCtx,
    plan: ArtifactInputPlan,
}

impl ArtifactInputStep {
    pub(crate) fn new(ctx: LeafCtx, plan: ArtifactInputPlan) -> Self {
        Self { ctx, plan }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub(crate) async fn run(
        self,
        _run_ctx: RunContext,
        state: RunState,
    ) -> Result<Outcome, StepError> {
        let row = self
            .ctx
            .services
            .state
            .build_artifact(self.plan.artifact_id)?
            .ok_or_else(|| {
                StepError::NotFound(format!("build artifact {}", self.plan.artifact_id))
            })?;

        let artifact = Artifact::new(row.worker, row.volume_handle);
        // The volume must still exist on its authoritative worker.
        self.ctx
            .services
            .registry
            .volume_for_artifact(&artifact)
            .await?;

        state.artifacts().register(&self.plan.name, artifact)?;
        state.record_result(&self.ctx.plan_id, true);
        Ok(Outcome::Succeeded)
    }
}

/// Persist a registered artifact so later builds can reference it.
pub struct ArtifactOutputStep {
    ctx: LeafCtx,
    plan: ArtifactOutputPlan,
}

impl ArtifactOutputStep {
    pub(crate) fn new(ctx: LeafCtx, plan: ArtifactOutputPlan) -> Self {
        Self { ctx, plan }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub(crate) async fn run(
        self,
        _run_ctx: RunContext,
        state: RunState,
    ) -> Result<Outcome, StepError> {
        let artifact = state.artifacts().get(&self.plan.name).ok_or_else(|| {
            StepError::NotFound(format!("artifact '{}'", self.plan.name))
        })?;

        let id = self.ctx.services.state.create_build_artifact(
            self.ctx.build.id,
            &self.plan.name,
            &artifact.worker,
            &artifact.volume,
        )?;
        tracing::debug!(
            artifact = self.plan.name,
            id,
            "exported build artifact"
        );

        state.record_result(&self.ctx.plan_id, true);
        Ok(Outcome::Succeeded)
    }
}
