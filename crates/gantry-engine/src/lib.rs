//! Step tree construction and execution for the gantry build core.
//!
//! The engine compiles a declarative plan into a step tree and drives
//! it concurrently against remote workers: combinators fan out
//! children, leaves place containers through the worker client, and
//! check leaves coordinate through interval gates and advisory locks.

pub mod artifact;
pub mod builder;
pub mod check;
pub mod clock;
pub mod delegate;
pub mod error;
pub mod rate_limit;
pub mod run_state;
pub mod step;
pub mod steps;
pub mod testing;
pub mod vars;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gantry_state::StateBackend;
use gantry_types::{Build, Plan};
use gantry_worker::{StepClient, Streamer, WorkerRegistry};

pub use builder::StepBuilder;
pub use delegate::{DelegateFactory, EventSink};
pub use error::StepError;
pub use run_state::RunState;
pub use step::{Outcome, RunContext, Step};

/// Collaborators shared by every step of the core.
pub struct Services {
    pub state: Arc<dyn StateBackend>,
    pub registry: Arc<WorkerRegistry>,
    pub client: StepClient,
    pub streamer: Streamer,
    pub clock: Arc<dyn clock::Clock>,
    pub limiter: Arc<dyn rate_limit::RateLimiter>,
    pub delegates: DelegateFactory,
    /// TTL on check-container ownership rows.
    pub check_container_expiry: Duration,
}

/// Result of driving one build's step tree to completion.
#[derive(Debug)]
pub struct BuildResult {
    pub outcome: Outcome,
    /// Final run state (artifacts, variables, per-node results).
    pub state: RunState,
}

/// Compiles and runs builds.
pub struct Engine {
    services: Arc<Services>,
}

impl Engine {
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    #[must_use]
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Compile and execute a build's plan.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::UserConfig`] for malformed plans or
    /// unsupported schemas, [`StepError::Aborted`] when cancelled, and
    /// other [`StepError`] values when the tree errors.
    pub async fn execute(
        &self,
        build: &Arc<Build>,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<BuildResult, StepError> {
        let state = RunState::new();
        let step = StepBuilder::new(self.services.clone()).build(build, plan, state.vars())?;

        tracing::info!(
            build = build.id,
            pipeline = build.pipeline_name,
            job = build.job_name,
            "executing build plan"
        );
        let outcome = step
            .run(RunContext::with_cancel(cancel), state.clone())
            .await?;
        tracing::info!(
            build = build.id,
            succeeded = outcome.succeeded(),
            "build plan finished"
        );

        Ok(BuildResult { outcome, state })
    }
}
