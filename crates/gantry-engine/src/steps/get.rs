//! The get step: fetch a version of a resource and register it as an
//! artifact.

use gantry_state::ResourceCacheDescriptor;
use gantry_types::plan::GetPlan;
use gantry_types::StepKind;
use gantry_worker::{ImageSpec, ProcessIo};

use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::{Outcome, RunContext};
use crate::steps::{surface_error, LeafCtx};
use crate::vars::interpolate;

pub struct GetStep {
    ctx: LeafCtx,
    plan: GetPlan,
}

impl GetStep {
    pub(crate) fn new(ctx: LeafCtx, plan: GetPlan) -> Self {
        Self { ctx, plan }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub(crate) async fn run(
        self,
        run_ctx: RunContext,
        state: RunState,
    ) -> Result<Outcome, StepError> {
        let delegate = self.ctx.delegate();
        let result = self.execute(&run_ctx, &state).await;
        surface_error(&delegate, result)
    }

    async fn execute(
        self,
        run_ctx: &RunContext,
        state: &RunState,
    ) -> Result<Outcome, StepError> {
        let delegate = self.ctx.delegate();
        delegate.initializing(StepKind::Get);

        let source = interpolate(&self.plan.source, &self.ctx.scope);
        let params = interpolate(&self.plan.params, &self.ctx.scope);

        let descriptor = ResourceCacheDescriptor {
            resource_type: self.plan.resource_type.clone(),
            version: self.plan.version.clone(),
            source: source.clone(),
            params: params.clone(),
            resource_types: self.plan.versioned_resource_types.clone(),
        };
        let cache = self
            .ctx
            .services
            .state
            .find_or_create_resource_cache(self.ctx.build.id, &descriptor)?;

        let request = serde_json::json!({
            "source": source,
            "params": params,
            "version": self.plan.version,
        });
        let worker_spec = self
            .ctx
            .worker_spec(&self.plan.tags, Some(self.plan.resource_type.clone()));
        let metadata = self.ctx.metadata(StepKind::Get, &self.plan.name);
        let io = ProcessIo {
            stdout: delegate.stdout(),
            stderr: delegate.stderr(),
        };

        let events = delegate.clone();
        let run = self
            .ctx
            .services
            .client
            .run_get_step(
                &run_ctx.cancel,
                &self.ctx.owner(),
                &metadata,
                &worker_spec,
                ImageSpec::ResourceType(self.plan.resource_type.clone()),
                &cache.key,
                &request,
                self.plan.version.as_ref(),
                self.ctx.build.team_id,
                self.ctx.build.env(),
                io,
                &mut |worker| {
                    events.selected_worker(worker);
                    events.starting(StepKind::Get);
                },
            )
            .await?;

        if run.exit_status == 0 {
            if let Some(artifact) = &run.artifact {
                state.artifacts().register(&self.plan.name, artifact.clone())?;
            }
            // Anonymous fetches (resource == "") don't move the
            // pipeline's latest-version pointer.
            if !self.plan.resource.is_empty() {
                if let Some(result) = &run.version_result {
                    self.ctx.services.state.update_resource_version(
                        self.ctx.build.pipeline_id,
                        &self.plan.resource,
                        &result.version,
                    )?;
                }
            }
        }

        state.record_result(&self.ctx.plan_id, run.exit_status == 0);
        delegate.finished(StepKind::Get, run.exit_status, run.version_result);
        Ok(Outcome::of_exit(run.exit_status))
    }
}
