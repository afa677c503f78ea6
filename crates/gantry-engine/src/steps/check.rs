//! The check step: discover new resource versions under a config
//! scope, coordinating with other nodes through the interval gate and
//! the scope's advisory lock.

use gantry_state::{cache_key, CheckableKind};
use gantry_types::plan::CheckPlan;
use gantry_types::{ContainerOwner, StepKind, VersionResult};
use gantry_worker::{ImageSpec, ProcessIo};

use crate::check::wait_to_run;
use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::{Outcome, RunContext};
use crate::steps::{surface_error, LeafCtx};
use crate::vars::interpolate;

pub struct CheckStep {
    ctx: LeafCtx,
    plan: CheckPlan,
}

impl CheckStep {
    pub(crate) fn new(ctx: LeafCtx, plan: CheckPlan) -> Self {
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
        delegate.initializing(StepKind::Check);

        let source = interpolate(&self.plan.source, &self.ctx.scope);
        let config_key = cache_key::resource_config_key(
            &self.plan.image_type,
            &source,
            &self.plan.versioned_resource_types,
        );
        let resource = (!self.plan.resource.is_empty()).then_some(self.plan.resource.as_str());
        let scope_id = self
            .ctx
            .services
            .state
            .find_or_create_scope(&config_key, resource)?;

        let (lock, should_run) = wait_to_run(
            &self.plan,
            &self.ctx.build,
            scope_id,
            &self.ctx.services.state,
            &self.ctx.services.clock,
            &self.ctx.services.limiter,
            &run_ctx.cancel,
        )
        .await?;

        if !should_run {
            tracing::debug!(scope = scope_id, name = self.plan.name, "reusing check result");
            let latest = self.ctx.services.state.latest_version(scope_id)?;
            state.record_result(&self.ctx.plan_id, true);
            delegate.finished(
                StepKind::Check,
                0,
                latest.map(|version| VersionResult {
                    version,
                    metadata: vec![],
                }),
            );
            return Ok(Outcome::Succeeded);
        }

        let result = self
            .perform_check(run_ctx, state, scope_id, &source, &delegate)
            .await;

        // Released immediately after the check, on every path.
        if let Some(lock) = lock {
            let released = lock.release();
            if result.is_ok() {
                released?;
            }
        }
        result
    }

    async fn perform_check(
        &self,
        run_ctx: &RunContext,
        state: &RunState,
        scope_id: i64,
        source: &serde_json::Value,
        delegate: &crate::delegate::StepDelegate,
    ) -> Result<Outcome, StepError> {
        let services = &self.ctx.services;
        let start = services.clock.now();

        let from_version = match &self.plan.from_version {
            Some(version) => Some(version.clone()),
            None => services.state.latest_version(scope_id)?,
        };
        let request = serde_json::json!({"source": source, "version": from_version});
        let owner = ContainerOwner::ResourceConfigCheck {
            scope_id,
            expires_at: start
                + chrono::Duration::from_std(services.check_container_expiry)
                    .unwrap_or_else(|_| chrono::Duration::hours(1)),
        };
        let metadata = self.ctx.metadata(StepKind::Check, &self.plan.name);
        let worker_spec = self
            .ctx
            .worker_spec(&self.plan.tags, Some(self.plan.image_type.clone()));
        let io = ProcessIo {
            stdout: delegate.stdout(),
            stderr: delegate.stderr(),
        };

        let events = delegate.clone();
        let (_, exit_status, versions) = services
            .client
            .run_check_step(
                &run_ctx.cancel,
                &owner,
                &metadata,
                &worker_spec,
                ImageSpec::ResourceType(self.plan.image_type.clone()),
                &request,
                self.ctx.build.team_id,
                io,
                &mut |worker| {
                    events.selected_worker(worker);
                    events.starting(StepKind::Check);
                },
            )
            .await?;
        let end = services.clock.now();

        services
            .state
            .update_last_check(scope_id, exit_status == 0, start, end)?;

        if exit_status == 0 {
            services.state.save_versions(scope_id, &versions)?;
            self.point_to_checked_config(scope_id)?;
        }

        let latest = versions.last().cloned().map(|version| VersionResult {
            version,
            metadata: vec![],
        });
        state.record_result(&self.ctx.plan_id, exit_status == 0);
        delegate.finished(StepKind::Check, exit_status, latest);
        Ok(Outcome::of_exit(exit_status))
    }

    /// Bind the checked object to the scope its versions now live
    /// under, so later get steps resolve versions from it.
    fn point_to_checked_config(&self, scope_id: i64) -> Result<(), StepError> {
        let pipeline_id = self.ctx.build.pipeline_id;
        let state = &self.ctx.services.state;
        if !self.plan.resource.is_empty() {
            state.set_checkable_scope(
                pipeline_id,
                CheckableKind::Resource,
                &self.plan.resource,
                scope_id,
            )?;
        }
        if !self.plan.resource_type.is_empty() {
            state.set_checkable_scope(
                pipeline_id,
                CheckableKind::ResourceType,
                &self.plan.resource_type,
                scope_id,
            )?;
        }
        if !self.plan.prototype.is_empty() {
            state.set_checkable_scope(
                pipeline_id,
                CheckableKind::Prototype,
                &self.plan.prototype,
                scope_id,
            )?;
        }
        Ok(())
    }
}
