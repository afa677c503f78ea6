//! Non-worker leaves: set_pipeline and load_var evaluate against the
//! run state and mutate external state (a pipeline definition, the
//! build's variable scope).

use gantry_types::plan::{LoadVarPlan, SetPipelinePlan};
use gantry_types::StepKind;

use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::{Outcome, RunContext};
use crate::steps::{read_artifact_file, surface_error, LeafCtx};

pub struct SetPipelineStep {
    ctx: LeafCtx,
    plan: SetPipelinePlan,
}

impl SetPipelineStep {
    pub(crate) fn new(ctx: LeafCtx, plan: SetPipelinePlan) -> Self {
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
        let delegate = self.ctx.delegate();
        let result = self.execute(&state).await;
        surface_error(&delegate, result)
    }

    async fn execute(self, state: &RunState) -> Result<Outcome, StepError> {
        let delegate = self.ctx.delegate();
        delegate.initializing(StepKind::SetPipeline);
        delegate.starting(StepKind::SetPipeline);

        let raw = read_artifact_file(state, &self.ctx.services, &self.plan.file).await?;
        let config: serde_json::Value = serde_json::from_slice(&raw).map_err(|err| {
            StepError::user_config(format!(
                "pipeline config '{}': {err}",
                self.plan.file
            ))
        })?;

        let team = if self.plan.team.is_empty() {
            self.ctx.build.team_name.clone()
        } else {
            self.plan.team.clone()
        };
        self.ctx
            .services
            .state
            .save_pipeline(&team, &self.plan.name, &config)?;
        tracing::info!(team, pipeline = self.plan.name, "pipeline configured");

        state.record_result(&self.ctx.plan_id, true);
        delegate.finished(StepKind::SetPipeline, 0, None);
        Ok(Outcome::Succeeded)
    }
}

pub struct LoadVarStep {
    ctx: LeafCtx,
    plan: LoadVarPlan,
}

impl LoadVarStep {
    pub(crate) fn new(ctx: LeafCtx, plan: LoadVarPlan) -> Self {
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
        let delegate = self.ctx.delegate();
        let result = self.execute(&state).await;
        surface_error(&delegate, result)
    }

    async fn execute(self, state: &RunState) -> Result<Outcome, StepError> {
        let delegate = self.ctx.delegate();
        delegate.initializing(StepKind::LoadVar);
        delegate.starting(StepKind::LoadVar);

        let raw = read_artifact_file(state, &self.ctx.services, &self.plan.file).await?;
        let value = parse_var(&raw, self.effective_format())?;

        // Loaded values are redacted from logs unless explicitly
        // revealed.
        state
            .vars()
            .add_local(&self.plan.name, value, !self.plan.reveal);

        state.record_result(&self.ctx.plan_id, true);
        delegate.finished(StepKind::LoadVar, 0, None);
        Ok(Outcome::Succeeded)
    }

    fn effective_format(&self) -> &str {
        if let Some(format) = &self.plan.format {
            return format;
        }
        if self.plan.file.ends_with(".json") {
            "json"
        } else {
            "trim"
        }
    }
}

fn parse_var(raw: &[u8], format: &str) -> Result<serde_json::Value, StepError> {
    let text = || String::from_utf8_lossy(raw).into_owned();
    match format {
        "json" => serde_json::from_slice(raw)
            .map_err(|err| StepError::user_config(format!("var file is not json: {err}"))),
        "raw" => Ok(serde_json::Value::String(text())),
        "trim" => Ok(serde_json::Value::String(text().trim().to_string())),
        other => Err(StepError::user_config(format!(
            "unknown var format '{other}'"
        ))),
    }
}
