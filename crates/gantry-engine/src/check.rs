//! The check coordinator: decides whether a check should really run or
//! reuse a previous result, and takes the scope's advisory lock
//! accordingly.
//!
//! Three check flavors behave differently:
//! 1. scheduler-triggered periodic checks run once the interval since
//!    the last check elapses;
//! 2. manually triggered checks reuse a previous result when the last
//!    check succeeded and started after the check build was created;
//! 3. step-embedded checks reuse a previous result when the last check
//!    succeeded and finished after the build started, and never take
//!    the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use gantry_state::{LastCheck, StateBackend};
use gantry_types::plan::CheckPlan;
use gantry_types::Build;

use crate::clock::Clock;
use crate::error::StepError;
use crate::rate_limit::RateLimiter;

/// How long to wait between lock attempts while another holder checks.
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the scope's checking lock; released explicitly after the
/// check, or on drop as a backstop for error paths.
pub struct CheckLockGuard {
    state: Arc<dyn StateBackend>,
    scope_id: i64,
    released: AtomicBool,
}

impl CheckLockGuard {
    fn new(state: Arc<dyn StateBackend>, scope_id: i64) -> Self {
        Self {
            state,
            scope_id,
            released: AtomicBool::new(false),
        }
    }

    /// Release the lock. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Transient`] on storage failure.
    pub fn release(&self) -> Result<(), StepError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state
            .release_check_lock(self.scope_id)
            .map_err(StepError::from)
    }
}

impl Drop for CheckLockGuard {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            if let Err(err) = self.release() {
                tracing::warn!(scope = self.scope_id, "failed to release check lock: {err}");
            }
        }
    }
}

/// Decide whether the check should run now.
///
/// Returns the held lock (periodic checks only) and the decision. The
/// gate is re-evaluated after the lock is acquired: another node may
/// have completed a check between the gate test and the acquisition,
/// in which case the lock is released and the check skipped.
///
/// # Errors
///
/// Returns [`StepError::Aborted`] when cancelled while rate-limited or
/// waiting for the lock, [`StepError::Transient`] on storage failure.
pub async fn wait_to_run(
    plan: &CheckPlan,
    build: &Build,
    scope_id: i64,
    state: &Arc<dyn StateBackend>,
    clock: &Arc<dyn Clock>,
    limiter: &Arc<dyn RateLimiter>,
    cancel: &CancellationToken,
) -> Result<(Option<CheckLockGuard>, bool), StepError> {
    if !plan.skip_interval {
        if plan.interval.never {
            // The user asked for periodic checks to never run.
            return Ok((None, false));
        }
        if !plan.resource.is_empty() {
            // Rate limit periodic resource checks so worker load (plus
            // load on external services) isn't too spiky. Resource type
            // and prototype checks are created every time a resource is
            // used rather than periodically, so they bypass this.
            limiter.wait(cancel).await?;
        }
    }

    if !plan.is_periodic() {
        let last = state.last_check(scope_id)?;
        if last.succeeded && last.end_time > build.start_time {
            return Ok((None, false));
        }
        // Embedded checks run without the lock.
        return Ok((None, true));
    }

    let interval = chrono::Duration::from_std(plan.interval.interval())
        .unwrap_or_else(|_| chrono::Duration::zero());
    let gate_rejects = |last: &LastCheck, now: DateTime<Utc>| {
        if plan.skip_interval {
            // Redundant manual check: the last check succeeded and
            // began after this check build was created.
            plan.from_version.is_none()
                && last.succeeded
                && build.create_time < last.start_time
        } else {
            now < last.end_time + interval
        }
    };

    loop {
        let last = state.last_check(scope_id)?;
        if gate_rejects(&last, clock.now()) {
            return Ok((None, false));
        }

        if state.try_acquire_check_lock(scope_id)? {
            let guard = CheckLockGuard::new(state.clone(), scope_id);
            // Between the gate test and the acquisition another node
            // may have checked; re-read and re-evaluate once.
            let last = state.last_check(scope_id)?;
            if gate_rejects(&last, clock.now()) {
                guard.release()?;
                return Ok((None, false));
            }
            return Ok((Some(guard), true));
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(StepError::Aborted),
            () = clock.sleep(LOCK_POLL_INTERVAL) => {}
        }
    }
}
