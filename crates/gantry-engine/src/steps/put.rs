//! The put step: push a new version of a resource, with inputs mounted
//! from the build's artifact repository.

use std::collections::HashSet;

use gantry_types::plan::{PutInputs, PutPlan};
use gantry_types::StepKind;
use gantry_worker::client::PUT_ARTIFACT_DIR;
use gantry_worker::{Artifact, ContainerSpec, ImageSpec, InputMount, ProcessIo};

use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::{Outcome, RunContext};
use crate::steps::{surface_error, LeafCtx};
use crate::vars::interpolate;

pub struct PutStep {
    ctx: LeafCtx,
    plan: PutPlan,
}

impl PutStep {
    pub(crate) fn new(ctx: LeafCtx, plan: PutPlan) -> Self {
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
        delegate.initializing(StepKind::Put);

        let source = interpolate(&self.plan.source, &self.ctx.scope);
        let params = interpolate(&self.plan.params, &self.ctx.scope);

        let inputs = select_inputs(&self.plan.inputs, &params, state)?;
        let spec = ContainerSpec {
            image: ImageSpec::ResourceType(self.plan.resource_type.clone()),
            inputs,
            outputs: vec![],
            env: self.ctx.build.env(),
            team_id: self.ctx.build.team_id,
            user: None,
        };
        let request = serde_json::json!({"source": source, "params": params});
        let worker_spec = self
            .ctx
            .worker_spec(&self.plan.tags, Some(self.plan.resource_type.clone()));
        let metadata = self.ctx.metadata(StepKind::Put, &self.plan.name);
        let io = ProcessIo {
            stdout: delegate.stdout(),
            stderr: delegate.stderr(),
        };

        let events = delegate.clone();
        let (_, exit_status, version_result) = self
            .ctx
            .services
            .client
            .run_put_step(
                &run_ctx.cancel,
                &self.ctx.owner(),
                &metadata,
                &worker_spec,
                spec,
                &request,
                io,
                &mut |worker| {
                    events.selected_worker(worker);
                    events.starting(StepKind::Put);
                },
            )
            .await?;

        if exit_status == 0 && !self.plan.resource.is_empty() {
            if let Some(result) = &version_result {
                self.ctx.services.state.update_resource_version(
                    self.ctx.build.pipeline_id,
                    &self.plan.resource,
                    &result.version,
                )?;
            }
        }

        state.record_result(&self.ctx.plan_id, exit_status == 0);
        delegate.finished(StepKind::Put, exit_status, version_result);
        Ok(Outcome::of_exit(exit_status))
    }
}

/// Resolve the put's input selection against the repository.
fn select_inputs(
    inputs: &PutInputs,
    params: &serde_json::Value,
    state: &RunState,
) -> Result<Vec<InputMount>, StepError> {
    let registered = state.artifacts().snapshot();
    let selected: Vec<(String, Artifact)> = match inputs {
        PutInputs::All => registered,
        PutInputs::Detect => {
            let roots = param_path_roots(params);
            registered
                .into_iter()
                .filter(|(name, _)| roots.contains(name))
                .collect()
        }
        PutInputs::Named(names) => names
            .iter()
            .map(|name| {
                state
                    .artifacts()
                    .get(name)
                    .map(|artifact| (name.clone(), artifact))
                    .ok_or_else(|| {
                        StepError::user_config(format!("unknown put input '{name}'"))
                    })
            })
            .collect::<Result<_, _>>()?,
    };

    Ok(selected
        .into_iter()
        .map(|(name, artifact)| InputMount {
            artifact,
            dest: format!("{PUT_ARTIFACT_DIR}/{name}"),
        })
        .collect())
}

/// First path segments of every string value in the params document;
/// `detect` mounts artifacts whose names appear here.
fn param_path_roots(params: &serde_json::Value) -> HashSet<String> {
    let mut roots = HashSet::new();
    collect_roots(params, &mut roots);
    roots
}

fn collect_roots(value: &serde_json::Value, roots: &mut HashSet<String>) {
    match value {
        serde_json::Value::String(s) => {
            let root = s.split('/').next().unwrap_or(s);
            if !root.is_empty() {
                roots.insert(root.to_string());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_roots(item, roots);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_roots(item, roots);
            }
        }
        _ => {}
    }
}
