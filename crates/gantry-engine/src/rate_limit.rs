//! Global rate limiting for periodic resource checks.
//!
//! Only periodic *resource* checks are limited; resource-type,
//! prototype, manual, and step-embedded checks are created on demand
//! and bypass the limiter entirely.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until a check may proceed, or until cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Aborted`] when cancelled while waiting.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), StepError>;
}

/// No limiting; every check proceeds immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<(), StepError> {
        Ok(())
    }
}

/// Spaces check starts at least `min_interval` apart, smoothing worker
/// and external-service load.
pub struct IntervalLimiter {
    min_interval: Duration,
    next_slot: tokio::sync::Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Derive the interval from a checks-per-second budget.
    #[must_use]
    pub fn per_second(checks_per_second: f64) -> Self {
        let min_interval = if checks_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / checks_per_second)
        } else {
            Duration::ZERO
        };
        Self::new(min_interval)
    }
}

#[async_trait]
impl RateLimiter for IntervalLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), StepError> {
        if self.min_interval.is_zero() {
            return Ok(());
        }
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = next_slot.map_or(now, |slot| slot.max(now));
        *next_slot = Some(slot + self.min_interval);
        drop(next_slot);

        if slot > now {
            tokio::select! {
                () = tokio::time::sleep_until(slot) => {}
                () = cancel.cancelled() => return Err(StepError::Aborted),
            }
        }
        Ok(())
    }
}
