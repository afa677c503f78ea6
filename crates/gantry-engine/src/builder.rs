//! Compiling a build plan into an executable step tree.

use std::sync::Arc;

use gantry_types::build::SUPPORTED_SCHEMA;
use gantry_types::plan::{AcrossPlan, Plan, PlanConfig, PlanId};
use gantry_types::Build;

use crate::error::StepError;
use crate::step::Step;
use crate::steps::{
    ArtifactInputStep, ArtifactOutputStep, CheckStep, GetStep, LeafCtx, LoadVarStep, PutStep,
    SetPipelineStep, TaskStep,
};
use crate::vars::VarScope;
use crate::Services;

pub struct StepBuilder {
    services: Arc<Services>,
}

impl StepBuilder {
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Compile a build's plan. Compilation is deterministic: the same
    /// plan yields the same tree.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::UserConfig`] for unsupported schemas.
    pub fn build(
        &self,
        build: &Arc<Build>,
        plan: &Plan,
        scope: &Arc<VarScope>,
    ) -> Result<Step, StepError> {
        if build.schema != SUPPORTED_SCHEMA {
            return Err(StepError::user_config("schema not supported"));
        }
        self.build_step(build, plan, &plan.attempts, scope)
    }

    fn build_step(
        &self,
        build: &Arc<Build>,
        plan: &Plan,
        attempts: &[u32],
        scope: &Arc<VarScope>,
    ) -> Result<Step, StepError> {
        match &plan.config {
            // A sequence is sugar for a chain of on_success hooks.
            PlanConfig::Do(steps) => {
                let mut step = Step::Identity;
                for inner in steps.iter().rev() {
                    step = Step::OnSuccess {
                        step: Box::new(self.build_step(build, inner, attempts, scope)?),
                        next: Box::new(step),
                    };
                }
                Ok(step)
            }

            PlanConfig::InParallel(parallel) => Ok(Step::InParallel {
                steps: parallel
                    .steps
                    .iter()
                    .map(|inner| self.build_step(build, inner, attempts, scope))
                    .collect::<Result<_, _>>()?,
                limit: parallel.limit,
                fail_fast: parallel.fail_fast,
            }),

            PlanConfig::Aggregate(steps) => Ok(Step::InParallel {
                steps: steps
                    .iter()
                    .map(|inner| self.build_step(build, inner, attempts, scope))
                    .collect::<Result<_, _>>()?,
                limit: 0,
                fail_fast: false,
            }),

            PlanConfig::Across(across) => {
                self.build_across(build, across, attempts, scope, 0, &mut Vec::new())
            }

            PlanConfig::Retry(plans) => {
                let mut steps = Vec::with_capacity(plans.len());
                for (index, inner) in plans.iter().enumerate() {
                    let mut attempt_path = attempts.to_vec();
                    attempt_path.push(index as u32 + 1);
                    steps.push(self.build_step(build, inner, &attempt_path, scope)?);
                }
                Ok(Step::Retry(steps))
            }

            PlanConfig::Timeout(timeout) => Ok(Step::Timeout {
                step: Box::new(self.build_step(build, &timeout.step, attempts, scope)?),
                timeout: timeout.duration(),
            }),

            PlanConfig::Try(inner) => Ok(Step::Try(Box::new(
                self.build_step(build, inner, attempts, scope)?,
            ))),

            PlanConfig::OnSuccess(hook) => Ok(Step::OnSuccess {
                step: Box::new(self.build_step(build, &hook.step, attempts, scope)?),
                next: Box::new(self.build_step(build, &hook.next, attempts, scope)?),
            }),
            PlanConfig::OnFailure(hook) => Ok(Step::OnFailure {
                step: Box::new(self.build_step(build, &hook.step, attempts, scope)?),
                next: Box::new(self.build_step(build, &hook.next, attempts, scope)?),
            }),
            PlanConfig::OnAbort(hook) => Ok(Step::OnAbort {
                step: Box::new(self.build_step(build, &hook.step, attempts, scope)?),
                next: Box::new(self.build_step(build, &hook.next, attempts, scope)?),
            }),
            PlanConfig::OnError(hook) => Ok(Step::OnError {
                step: Box::new(self.build_step(build, &hook.step, attempts, scope)?),
                next: Box::new(self.build_step(build, &hook.next, attempts, scope)?),
            }),
            PlanConfig::Ensure(hook) => Ok(Step::Ensure {
                step: Box::new(self.build_step(build, &hook.step, attempts, scope)?),
                next: Box::new(self.build_step(build, &hook.next, attempts, scope)?),
            }),

            PlanConfig::Get(get) => Ok(Step::Get(GetStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                get.clone(),
            ))),
            PlanConfig::Put(put) => Ok(Step::Put(PutStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                put.clone(),
            ))),
            PlanConfig::Task(task) => Ok(Step::Task(TaskStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                task.clone(),
            ))),
            PlanConfig::Check(check) => Ok(Step::Check(CheckStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                check.clone(),
            ))),
            PlanConfig::SetPipeline(set_pipeline) => Ok(Step::SetPipeline(SetPipelineStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                set_pipeline.clone(),
            ))),
            PlanConfig::LoadVar(load_var) => Ok(Step::LoadVar(LoadVarStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                load_var.clone(),
            ))),
            PlanConfig::ArtifactInput(input) => Ok(Step::ArtifactInput(ArtifactInputStep::new(
                self.leaf_ctx(build, &plan.id, attempts, scope),
                input.clone(),
            ))),
            PlanConfig::ArtifactOutput(output) => {
                Ok(Step::ArtifactOutput(ArtifactOutputStep::new(
                    self.leaf_ctx(build, &plan.id, attempts, scope),
                    output.clone(),
                )))
            }
        }
    }

    /// Expand the Cartesian product of the across vars into nested
    /// in_parallel shells; each axis contributes one nesting level with
    /// its own max_in_flight.
    fn build_across(
        &self,
        build: &Arc<Build>,
        across: &AcrossPlan,
        attempts: &[u32],
        scope: &Arc<VarScope>,
        level: usize,
        combo: &mut Vec<usize>,
    ) -> Result<Step, StepError> {
        if level == across.vars.len() {
            let child_scope = scope.child();
            for (axis, var) in across.vars.iter().enumerate() {
                // Not redacted: across values are identifiers embedded
                // in the plan, not secrets.
                child_scope.add_local(&var.var, var.values[combo[axis]].clone(), false);
            }
            let suffix = combo
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join("/");
            let scoped = scope_plan_ids(&across.step, &suffix);
            return self.build_step(build, &scoped, attempts, &child_scope);
        }

        let var = &across.vars[level];
        let mut steps = Vec::with_capacity(var.values.len());
        for index in 0..var.values.len() {
            combo.push(index);
            steps.push(self.build_across(build, across, attempts, scope, level + 1, combo)?);
            combo.pop();
        }
        Ok(Step::InParallel {
            steps,
            limit: var.max_in_flight,
            fail_fast: across.fail_fast,
        })
    }

    fn leaf_ctx(
        &self,
        build: &Arc<Build>,
        plan_id: &PlanId,
        attempts: &[u32],
        scope: &Arc<VarScope>,
    ) -> LeafCtx {
        let attempt = attempts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        LeafCtx {
            plan_id: plan_id.clone(),
            attempt,
            build: build.clone(),
            scope: scope.clone(),
            services: self.services.clone(),
        }
    }
}

/// Clone a plan template with every node's id suffixed, keeping ids
/// unique when one template expands into many concrete sub-trees.
fn scope_plan_ids(plan: &Plan, suffix: &str) -> Plan {
    let mut plan = plan.clone();
    rewrite_ids(&mut plan, suffix);
    plan
}

fn rewrite_ids(plan: &mut Plan, suffix: &str) {
    plan.id = plan.id.scoped(suffix);
    match &mut plan.config {
        PlanConfig::Do(steps) | PlanConfig::Aggregate(steps) | PlanConfig::Retry(steps) => {
            for step in steps {
                rewrite_ids(step, suffix);
            }
        }
        PlanConfig::InParallel(parallel) => {
            for step in &mut parallel.steps {
                rewrite_ids(step, suffix);
            }
        }
        PlanConfig::Across(across) => rewrite_ids(&mut across.step, suffix),
        PlanConfig::Timeout(timeout) => rewrite_ids(&mut timeout.step, suffix),
        PlanConfig::Try(step) => rewrite_ids(step, suffix),
        PlanConfig::OnSuccess(hook)
        | PlanConfig::OnFailure(hook)
        | PlanConfig::OnAbort(hook)
        | PlanConfig::OnError(hook)
        | PlanConfig::Ensure(hook) => {
            rewrite_ids(&mut hook.step, suffix);
            rewrite_ids(&mut hook.next, suffix);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::describe_tree;
    use crate::testing::test_services;
    use chrono::Utc;
    use gantry_types::plan::{AcrossVar, InParallelPlan, TaskPlan};

    fn test_build() -> Arc<Build> {
        Arc::new(Build {
            id: 1,
            name: "1".into(),
            team_id: 1,
            team_name: "main".into(),
            pipeline_id: 1,
            pipeline_name: "p".into(),
            job_id: 1,
            job_name: "j".into(),
            create_time: Utc::now(),
            start_time: Utc::now(),
            schema: SUPPORTED_SCHEMA.into(),
        })
    }

    fn task_plan(id: &str, name: &str) -> Plan {
        Plan::new(
            id,
            PlanConfig::Task(TaskPlan {
                name: name.into(),
                config: None,
                config_from: Some("cfg/task.json".into()),
                privileged: false,
                tags: vec![],
                versioned_resource_types: vec![],
            }),
        )
    }

    #[test]
    fn rejects_unsupported_schema() {
        let services = test_services();
        let mut build = (*test_build()).clone();
        build.schema = "exec.v0".into();

        let err = StepBuilder::new(services)
            .build(&Arc::new(build), &task_plan("1", "t"), &VarScope::root())
            .unwrap_err();
        assert_eq!(err.to_string(), "schema not supported");
    }

    #[test]
    fn do_compiles_to_on_success_chain() {
        let services = test_services();
        let plan = Plan::new(
            "0",
            PlanConfig::Do(vec![task_plan("1", "a"), task_plan("2", "b")]),
        );
        let step = StepBuilder::new(services)
            .build(&test_build(), &plan, &VarScope::root())
            .unwrap();
        let tree = describe_tree(&step);
        assert!(tree.starts_with("on_success"), "{tree}");
        assert!(tree.contains("task 'a'"));
        assert!(tree.contains("task 'b'"));
        assert!(tree.contains("identity"));
    }

    #[test]
    fn compilation_is_deterministic() {
        let services = test_services();
        let plan = Plan::new(
            "0",
            PlanConfig::InParallel(InParallelPlan {
                steps: vec![
                    task_plan("1", "a"),
                    Plan::new("2", PlanConfig::Retry(vec![task_plan("2/1", "b"); 3])),
                ],
                limit: 2,
                fail_fast: true,
            }),
        );
        let builder = StepBuilder::new(services);
        let first = builder
            .build(&test_build(), &plan, &VarScope::root())
            .unwrap();
        let second = builder
            .build(&test_build(), &plan, &VarScope::root())
            .unwrap();
        assert_eq!(describe_tree(&first), describe_tree(&second));
        assert!(describe_tree(&first).contains("retry (3 attempts)"));
    }

    #[test]
    fn across_expands_cartesian_product() {
        let services = test_services();
        let plan = Plan::new(
            "0",
            PlanConfig::Across(AcrossPlan {
                vars: vec![
                    AcrossVar {
                        var: "os".into(),
                        values: vec![serde_json::json!("linux"), serde_json::json!("darwin")],
                        max_in_flight: 1,
                    },
                    AcrossVar {
                        var: "arch".into(),
                        values: vec![
                            serde_json::json!("amd64"),
                            serde_json::json!("arm64"),
                            serde_json::json!("s390x"),
                        ],
                        max_in_flight: 2,
                    },
                ],
                step: Box::new(task_plan("7", "matrix")),
                fail_fast: true,
            }),
        );

        let step = StepBuilder::new(services)
            .build(&test_build(), &plan, &VarScope::root())
            .unwrap();
        // Outer level: one shell per "os" value.
        let Step::InParallel { steps, limit, fail_fast } = &step else {
            panic!("expected in_parallel shell");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(*limit, 1);
        assert!(fail_fast);
        // Inner level: one task per "arch" value.
        for inner in steps {
            let Step::InParallel { steps, limit, .. } = inner else {
                panic!("expected nested in_parallel");
            };
            assert_eq!(steps.len(), 3);
            assert_eq!(*limit, 2);
        }
    }

    #[test]
    fn across_with_empty_values_has_zero_substeps() {
        let services = test_services();
        let plan = Plan::new(
            "0",
            PlanConfig::Across(AcrossPlan {
                vars: vec![AcrossVar {
                    var: "v".into(),
                    values: vec![],
                    max_in_flight: 0,
                }],
                step: Box::new(task_plan("1", "t")),
                fail_fast: false,
            }),
        );
        let step = StepBuilder::new(services)
            .build(&test_build(), &plan, &VarScope::root())
            .unwrap();
        let Step::InParallel { steps, .. } = &step else {
            panic!("expected in_parallel shell");
        };
        assert!(steps.is_empty());
    }

    #[test]
    fn scoped_ids_stay_unique_per_expansion() {
        let template = Plan::new(
            "5",
            PlanConfig::Try(Box::new(task_plan("5/inner", "t"))),
        );
        let a = scope_plan_ids(&template, "0");
        let b = scope_plan_ids(&template, "1");
        assert_eq!(a.id.as_str(), "5/0");
        assert_eq!(b.id.as_str(), "5/1");
        let PlanConfig::Try(inner_a) = &a.config else {
            panic!()
        };
        assert_eq!(inner_a.id.as_str(), "5/inner/0");
    }
}
