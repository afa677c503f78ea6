//! The task step: run a user-configured process with named input and
//! output mounts.

use gantry_types::plan::TaskPlan;
use gantry_types::task::TaskConfig;
use gantry_types::StepKind;
use gantry_worker::client::TASK_WORK_DIR;
use gantry_worker::runtime::ProcessSpec;
use gantry_worker::{ContainerSpec, ImageSpec, InputMount, OutputSpec, ProcessIo};

use crate::error::StepError;
use crate::run_state::RunState;
use crate::step::{Outcome, RunContext};
use crate::steps::{read_artifact_file, surface_error, LeafCtx};
use crate::vars::interpolate;

pub struct TaskStep {
    ctx: LeafCtx,
    plan: TaskPlan,
}

impl TaskStep {
    pub(crate) fn new(ctx: LeafCtx, plan: TaskPlan) -> Self {
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
        delegate.initializing(StepKind::Task);

        let config = self.load_config(state).await?;
        let image = task_image(&config, state)?;

        let mut inputs = Vec::new();
        for input in &config.inputs {
            match state.artifacts().get(&input.name) {
                Some(artifact) => inputs.push(InputMount {
                    artifact,
                    dest: format!("{TASK_WORK_DIR}/{}", input.effective_path()),
                }),
                None if input.optional => {
                    tracing::debug!(input = input.name, "skipping optional task input");
                }
                None => {
                    return Err(StepError::user_config(format!(
                        "missing task input '{}'",
                        input.name
                    )));
                }
            }
        }

        let outputs: Vec<OutputSpec> = config
            .outputs
            .iter()
            .map(|output| OutputSpec {
                name: output.name.clone(),
                path: format!("{TASK_WORK_DIR}/{}", output.effective_path()),
            })
            .collect();

        let mut env = self.ctx.build.env();
        for (key, value) in &config.env {
            let value = interpolate(&serde_json::Value::String(value.clone()), &self.ctx.scope);
            env.push((
                key.clone(),
                match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
            ));
        }

        let spec = ContainerSpec {
            image,
            inputs,
            outputs,
            env: env.clone(),
            team_id: self.ctx.build.team_id,
            user: config.run.user.clone(),
        };
        let process = ProcessSpec {
            path: config.run.path.clone(),
            args: config.run.args.clone(),
            dir: Some(
                config
                    .run
                    .dir
                    .as_ref()
                    .map_or_else(|| TASK_WORK_DIR.to_string(), |dir| {
                        format!("{TASK_WORK_DIR}/{dir}")
                    }),
            ),
            user: config.run.user.clone(),
            env,
            stdin: None,
            capture_stdout: false,
        };

        let worker_spec = {
            let mut spec = self.ctx.worker_spec(&self.plan.tags, None);
            spec.platform = config.platform.clone();
            spec
        };
        let metadata = self.ctx.metadata(StepKind::Task, &self.plan.name);
        let io = ProcessIo {
            stdout: delegate.stdout(),
            stderr: delegate.stderr(),
        };

        let events = delegate.clone();
        let run = self
            .ctx
            .services
            .client
            .run_step(
                &run_ctx.cancel,
                &self.ctx.owner(),
                &metadata,
                &worker_spec,
                spec,
                process,
                io,
                &mut |worker| {
                    events.selected_worker(worker);
                    events.starting(StepKind::Task);
                },
            )
            .await?;

        if run.exit.status == 0 {
            for (name, artifact) in &run.outputs {
                state.artifacts().register(name, artifact.clone())?;
            }
        }

        state.record_result(&self.ctx.plan_id, run.exit.status == 0);
        delegate.finished(StepKind::Task, run.exit.status, None);
        Ok(Outcome::of_exit(run.exit.status))
    }

    /// Inline config, or a config file from an artifact produced by an
    /// earlier step.
    async fn load_config(&self, state: &RunState) -> Result<TaskConfig, StepError> {
        if let Some(config) = &self.plan.config {
            return Ok(config.clone());
        }
        let Some(reference) = &self.plan.config_from else {
            return Err(StepError::user_config(format!(
                "task '{}' has neither config nor config_from",
                self.plan.name
            )));
        };
        let raw = read_artifact_file(state, &self.ctx.services, reference).await?;
        serde_json::from_slice(&raw).map_err(|err| {
            StepError::user_config(format!("task config '{reference}': {err}"))
        })
    }
}

fn task_image(config: &TaskConfig, state: &RunState) -> Result<ImageSpec, StepError> {
    if let Some(image_resource) = &config.image_resource {
        return Ok(ImageSpec::ResourceType(image_resource.resource_type.clone()));
    }
    if let Some(uri) = &config.rootfs_uri {
        // A rootfs URI naming a registered artifact uses that image.
        if let Some(artifact) = state.artifacts().get(uri) {
            return Ok(ImageSpec::Artifact {
                artifact,
                privileged: false,
            });
        }
        return Ok(ImageSpec::Url(uri.clone()));
    }
    Err(StepError::user_config(
        "task config needs image_resource or rootfs_uri",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::task::{ImageResource, TaskRunConfig};
    use gantry_worker::Artifact;

    fn minimal_config() -> TaskConfig {
        TaskConfig {
            platform: "linux".into(),
            image_resource: None,
            rootfs_uri: Some("docker:///busybox".into()),
            run: TaskRunConfig {
                path: "sh".into(),
                args: vec![],
                dir: None,
                user: None,
            },
            inputs: vec![],
            outputs: vec![],
            env: Default::default(),
        }
    }

    #[test]
    fn image_prefers_image_resource() {
        let mut config = minimal_config();
        config.image_resource = Some(ImageResource {
            resource_type: "registry-image".into(),
            source: serde_json::json!({}),
            version: None,
        });
        let image = task_image(&config, &RunState::new()).unwrap();
        assert!(matches!(image, ImageSpec::ResourceType(name) if name == "registry-image"));
    }

    #[test]
    fn rootfs_uri_naming_an_artifact_uses_it() {
        let state = RunState::new();
        state
            .artifacts()
            .register("built-image", Artifact::new("w1", "vol-img"))
            .unwrap();

        let mut config = minimal_config();
        config.rootfs_uri = Some("built-image".into());
        let image = task_image(&config, &state).unwrap();
        assert!(matches!(image, ImageSpec::Artifact { .. }));

        let mut config = minimal_config();
        config.rootfs_uri = Some("docker:///busybox".into());
        assert!(matches!(
            task_image(&config, &state).unwrap(),
            ImageSpec::Url(_)
        ));
    }

    #[test]
    fn missing_image_is_user_config() {
        let mut config = minimal_config();
        config.rootfs_uri = None;
        let err = task_image(&config, &RunState::new()).unwrap_err();
        assert!(matches!(err, StepError::UserConfig(_)));
    }
}
