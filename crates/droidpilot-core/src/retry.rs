//! Bounded polling with an explicit deadline.
//!
//! A [`RetryDeadline`] pairs a fixed polling interval with a maximum elapsed
//! budget. [`retry_with_deadline`] runs an async operation under that budget:
//! the attempt count is at most `ceil(max_elapsed / interval)` (at least one),
//! and the helper sleeps for `interval` between attempts. No new attempt
//! starts once the next one would begin at or after `max_elapsed`, so slow
//! attempts shorten the loop. Errors the caller does not classify as
//! retryable are returned immediately. Once the budget is spent the most
//! recent error is returned.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Interval and elapsed-time budget for a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDeadline {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total time budget.
    pub max_elapsed: Duration,
}

impl RetryDeadline {
    /// Creates a deadline from an interval and a budget.
    pub fn new(interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            interval,
            max_elapsed,
        }
    }

    /// Creates a deadline from millisecond values.
    pub fn from_millis(interval_ms: u64, max_elapsed_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(max_elapsed_ms),
        )
    }

    /// Number of attempts this deadline allows.
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis();
        if interval == 0 {
            return 1;
        }
        let attempts = self.max_elapsed.as_millis().div_ceil(interval);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// deadline's attempts or time budget are used up.
pub async fn retry_with_deadline<T, E, F, Fut, R>(
    deadline: &RetryDeadline,
    mut op: F,
    mut retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = deadline.max_attempts();
    let start = Instant::now();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e)
                if attempt < max_attempts
                    && start.elapsed() + deadline.interval < deadline.max_elapsed
                    && retryable(&e) =>
            {
                debug!(attempt, max_attempts, error = %e, "attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(deadline.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
