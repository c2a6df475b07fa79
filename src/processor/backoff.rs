//! Retry policy shared by the cursor reader (source fetches) and the workers (sink writes).

use crate::store::SourceError;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Errors the retry policy knows how to classify.
pub trait Retryable {
    fn failure_class(&self) -> FailureClass;
}

impl Retryable for SourceError {
    fn failure_class(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Transient failure, but the attempt budget is spent.
    Exhausted,
    /// Permanent failure; retrying cannot help.
    GiveUp,
}

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after `attempt` (1-based) failed with `error`.
    pub fn decide<E: Retryable + ?Sized>(&self, attempt: u32, error: &E) -> RetryDecision {
        match error.failure_class() {
            FailureClass::Permanent => RetryDecision::GiveUp,
            FailureClass::Transient if attempt >= self.max_attempts => RetryDecision::Exhausted,
            FailureClass::Transient => RetryDecision::RetryAfter(self.backoff_for(attempt)),
        }
    }

    /// Delay before attempt `attempt + 1`: `initial * 2^(attempt - 1)`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = next_backoff(delay, self.max_backoff);
            if delay == self.max_backoff {
                break;
            }
        }
        delay.min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sleep interrupted by cancellation")]
pub struct Interrupted;

pub async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: &CancellationToken,
) -> Result<(), Interrupted> {
    if cancellation.is_cancelled() {
        return Err(Interrupted);
    }

    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    tokio::select! {
        _ = cancellation.cancelled() => Err(Interrupted),
        _ = sleep(delay) => Ok(()),
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}
