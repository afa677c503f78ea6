//! The compiled step tree and its execution semantics.
//!
//! A step is a tagged sum: combinators carry child steps, leaves carry
//! their plan payload and collaborators. One `run` function dispatches
//! by tag so every combinator's semantics are auditable in one place.
//!
//! `run` returning `Ok` means the step ran to completion; the
//! [`Outcome`] says whether the work succeeded. `Err` means the step
//! errored (infrastructure failure or cancellation).

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::run_state::RunState;
use crate::steps::{
    ArtifactInputStep, ArtifactOutputStep, CheckStep, GetStep, LoadVarStep, PutStep,
    SetPipelineStep, TaskStep,
};

/// Cancellation context threaded through the tree.
#[derive(Clone, Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
}

impl RunContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// A context whose cancellation is tied to this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
        }
    }

    /// A fresh context that ignores the build's cancellation; cleanup
    /// hooks run under this so they can finish after an abort.
    #[must_use]
    pub fn uncancellable(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }
}

/// Whether a completed step's work succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    #[must_use]
    pub fn succeeded(self) -> bool {
        matches!(self, Self::Succeeded)
    }

    #[must_use]
    pub fn of_exit(status: i32) -> Self {
        if status == 0 {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

/// A node of the compiled execution tree.
pub enum Step {
    /// Succeeds without doing anything (sequence chain terminator).
    Identity,
    InParallel {
        steps: Vec<Step>,
        /// 0 means unlimited.
        limit: usize,
        fail_fast: bool,
    },
    Retry(Vec<Step>),
    Timeout {
        step: Box<Step>,
        timeout: Duration,
    },
    Try(Box<Step>),
    OnSuccess {
        step: Box<Step>,
        next: Box<Step>,
    },
    OnFailure {
        step: Box<Step>,
        next: Box<Step>,
    },
    OnAbort {
        step: Box<Step>,
        next: Box<Step>,
    },
    OnError {
        step: Box<Step>,
        next: Box<Step>,
    },
    Ensure {
        step: Box<Step>,
        next: Box<Step>,
    },
    Get(GetStep),
    Put(PutStep),
    Task(TaskStep),
    Check(CheckStep),
    SetPipeline(SetPipelineStep),
    LoadVar(LoadVarStep),
    ArtifactInput(ArtifactInputStep),
    ArtifactOutput(ArtifactOutputStep),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Step::Identity => "Identity",
            Step::InParallel { .. } => "InParallel",
            Step::Retry(_) => "Retry",
            Step::Timeout { .. } => "Timeout",
            Step::Try(_) => "Try",
            Step::OnSuccess { .. } => "OnSuccess",
            Step::OnFailure { .. } => "OnFailure",
            Step::OnAbort { .. } => "OnAbort",
            Step::OnError { .. } => "OnError",
            Step::Ensure { .. } => "Ensure",
            Step::Get(_) => "Get",
            Step::Put(_) => "Put",
            Step::Task(_) => "Task",
            Step::Check(_) => "Check",
            Step::SetPipeline(_) => "SetPipeline",
            Step::LoadVar(_) => "LoadVar",
            Step::ArtifactInput(_) => "ArtifactInput",
            Step::ArtifactOutput(_) => "ArtifactOutput",
        };
        f.write_str(variant)
    }
}

impl Step {
    /// Execute the sub-tree rooted at this node.
    pub fn run(
        self,
        ctx: RunContext,
        state: RunState,
    ) -> BoxFuture<'static, Result<Outcome, StepError>> {
        Box::pin(async move {
            match self {
                Step::Identity => Ok(Outcome::Succeeded),

                Step::OnSuccess { step, next } => {
                    let first = step.run(ctx.clone(), state.clone()).await?;
                    if !first.succeeded() {
                        return Ok(first);
                    }
                    next.run(ctx, state).await
                }

                Step::OnFailure { step, next } => {
                    let first = step.run(ctx.clone(), state.clone()).await?;
                    if !first.succeeded() {
                        next.run(ctx, state).await?;
                    }
                    Ok(first)
                }

                Step::OnAbort { step, next } => match step.run(ctx.clone(), state.clone()).await {
                    Err(StepError::Aborted) => {
                        next.run(ctx.uncancellable(), state).await?;
                        Err(StepError::Aborted)
                    }
                    other => other,
                },

                Step::OnError { step, next } => match step.run(ctx.clone(), state.clone()).await {
                    Err(StepError::Aborted) => Err(StepError::Aborted),
                    Err(err) => {
                        next.run(ctx.uncancellable(), state).await?;
                        Err(err)
                    }
                    ok => ok,
                },

                Step::Ensure { step, next } => {
                    let first = step.run(ctx.clone(), state.clone()).await;
                    // The hook always runs, even after cancellation.
                    let second = next.run(ctx.uncancellable(), state).await;
                    match (first, second) {
                        (Err(err), _) => Err(err),
                        (Ok(_), Err(err)) => Err(err),
                        (Ok(a), Ok(b)) => Ok(if a.succeeded() && b.succeeded() {
                            Outcome::Succeeded
                        } else {
                            Outcome::Failed
                        }),
                    }
                }

                Step::Try(step) => {
                    step.run(ctx, state).await?;
                    Ok(Outcome::Succeeded)
                }

                Step::Timeout { step, timeout } => run_timeout(*step, timeout, ctx, state).await,
                Step::Retry(attempts) => run_retry(attempts, ctx, state).await,
                Step::InParallel {
                    steps,
                    limit,
                    fail_fast,
                } => run_in_parallel(steps, limit, fail_fast, ctx, state).await,

                Step::Get(step) => step.run(ctx, state).await,
                Step::Put(step) => step.run(ctx, state).await,
                Step::Task(step) => step.run(ctx, state).await,
                Step::Check(step) => step.run(ctx, state).await,
                Step::SetPipeline(step) => step.run(ctx, state).await,
                Step::LoadVar(step) => step.run(ctx, state).await,
                Step::ArtifactInput(step) => step.run(ctx, state).await,
                Step::ArtifactOutput(step) => step.run(ctx, state).await,
            }
        })
    }

    /// One-line description used by plan explainers.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Step::Identity => "identity".to_string(),
            Step::InParallel { steps, limit, fail_fast } => format!(
                "in_parallel ({} steps, limit {limit}, fail_fast {fail_fast})",
                steps.len()
            ),
            Step::Retry(attempts) => format!("retry ({} attempts)", attempts.len()),
            Step::Timeout { timeout, .. } => format!("timeout ({}s)", timeout.as_secs()),
            Step::Try(_) => "try".to_string(),
            Step::OnSuccess { .. } => "on_success".to_string(),
            Step::OnFailure { .. } => "on_failure".to_string(),
            Step::OnAbort { .. } => "on_abort".to_string(),
            Step::OnError { .. } => "on_error".to_string(),
            Step::Ensure { .. } => "ensure".to_string(),
            Step::Get(step) => format!("get '{}'", step.name()),
            Step::Put(step) => format!("put '{}'", step.name()),
            Step::Task(step) => format!("task '{}'", step.name()),
            Step::Check(step) => format!("check '{}'", step.name()),
            Step::SetPipeline(step) => format!("set_pipeline '{}'", step.name()),
            Step::LoadVar(step) => format!("load_var '{}'", step.name()),
            Step::ArtifactInput(step) => format!("artifact_input '{}'", step.name()),
            Step::ArtifactOutput(step) => format!("artifact_output '{}'", step.name()),
        }
    }

    /// Child steps, for tree walks.
    #[must_use]
    pub fn children(&self) -> Vec<&Step> {
        match self {
            Step::InParallel { steps, .. } | Step::Retry(steps) => steps.iter().collect(),
            Step::Timeout { step, .. } | Step::Try(step) => vec![step.as_ref()],
            Step::OnSuccess { step, next }
            | Step::OnFailure { step, next }
            | Step::OnAbort { step, next }
            | Step::OnError { step, next }
            | Step::Ensure { step, next } => vec![step.as_ref(), next.as_ref()],
            _ => Vec::new(),
        }
    }
}

/// Render the tree as an indented outline (plan explainers, tests).
#[must_use]
pub fn describe_tree(step: &Step) -> String {
    fn walk(step: &Step, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&step.describe());
        out.push('\n');
        for child in step.children() {
            walk(child, depth + 1, out);
        }
    }
    let mut out = String::new();
    walk(step, 0, &mut out);
    out
}

/// Run the child under a deadline. Hitting the deadline cancels the
/// child and reports *failure*; cancellation from above still reports
/// as an abort.
async fn run_timeout(
    step: Step,
    timeout: Duration,
    ctx: RunContext,
    state: RunState,
) -> Result<Outcome, StepError> {
    let child_cancel = ctx.cancel.child_token();
    let mut step_fut = step.run(RunContext::with_cancel(child_cancel.clone()), state);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut timed_out = false;
    let result = loop {
        tokio::select! {
            result = &mut step_fut => break result,
            () = &mut deadline, if !timed_out => {
                tracing::info!(timeout_secs = timeout.as_secs(), "step timed out");
                timed_out = true;
                child_cancel.cancel();
            }
        }
    };

    match result {
        Err(StepError::Aborted) if timed_out && !ctx.cancel.is_cancelled() => Ok(Outcome::Failed),
        other => other,
    }
}

/// Run attempts in order until one succeeds. Errored attempts are
/// retried like failed ones; cancellation is never retried.
async fn run_retry(
    attempts: Vec<Step>,
    ctx: RunContext,
    state: RunState,
) -> Result<Outcome, StepError> {
    let total = attempts.len();
    let mut last: Result<Outcome, StepError> = Ok(Outcome::Failed);
    for (index, attempt) in attempts.into_iter().enumerate() {
        match attempt.run(ctx.clone(), state.clone()).await {
            Ok(outcome) if outcome.succeeded() => return Ok(outcome),
            Err(StepError::Aborted) => return Err(StepError::Aborted),
            result => {
                if let Err(err) = &result {
                    tracing::warn!(attempt = index + 1, total, "attempt errored: {err}");
                }
                last = result;
            }
        }
    }
    last
}

/// Fan out children with bounded concurrency. With `fail_fast`, the
/// first non-success cancels the remaining siblings; they observe the
/// cancellation and wind down through the normal abort path.
async fn run_in_parallel(
    steps: Vec<Step>,
    limit: usize,
    fail_fast: bool,
    ctx: RunContext,
    state: RunState,
) -> Result<Outcome, StepError> {
    let sibling_cancel = ctx.cancel.child_token();
    let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
    let mut join_set: JoinSet<Result<Outcome, StepError>> = JoinSet::new();

    for step in steps {
        let cancel = sibling_cancel.clone();
        let state = state.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => {
                    tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => return Err(StepError::Aborted),
                        },
                        () = cancel.cancelled() => return Err(StepError::Aborted),
                    }
                }
                None => None,
            };
            if cancel.is_cancelled() {
                return Err(StepError::Aborted);
            }
            step.run(RunContext::with_cancel(cancel), state).await
        });
    }

    let mut succeeded = true;
    let mut first_error: Option<StepError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                if !outcome.succeeded() {
                    succeeded = false;
                    if fail_fast {
                        sibling_cancel.cancel();
                    }
                }
            }
            // A sibling cancelled by fail-fast, not by the build.
            Ok(Err(StepError::Aborted)) if !ctx.cancel.is_cancelled() => {
                succeeded = false;
            }
            Ok(Err(err)) => {
                succeeded = false;
                if first_error.is_none() {
                    first_error = Some(err);
                }
                if fail_fast {
                    sibling_cancel.cancel();
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(StepError::Transient(anyhow::anyhow!(
                        "parallel step panicked: {join_err}"
                    )));
                }
                sibling_cancel.cancel();
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(StepError::Aborted);
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(if succeeded {
        Outcome::Succeeded
    } else {
        Outcome::Failed
    })
}
