//! Exponential-backoff retry for transient failures, on top of `backoff`.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use tracing::warn;

use crate::error::{AutoNewsError, Result};

/// Attempt cap and backoff window for one class of call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Doubling schedule from `initial_interval`, capped at `max_interval`.
    /// No jitter and no elapsed-time limit: `max_attempts` bounds the retries.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval.max(self.initial_interval))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached. Only errors for which
/// [`AutoNewsError::is_retryable`] holds are retried.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_quota(policy, None, label, op).await
}

/// Like [`retry`], but quota rejections wait on `quota`'s schedule instead.
/// Attempts still count against `policy.max_attempts`.
pub async fn retry_with_quota<T, F, Fut>(
    policy: &RetryPolicy,
    quota: Option<&RetryPolicy>,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let attempts = AtomicU32::new(0);
    let quota_backoff = quota.map(|q| Mutex::new(q.backoff()));

    let attempt = || {
        let fut = op();
        let attempts = &attempts;
        let quota_backoff = quota_backoff.as_ref();
        async move {
            let e = match fut.await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err(classify(e, n >= max_attempts, quota_backoff))
        }
    };

    let notify = |e: AutoNewsError, delay: Duration| {
        warn!(
            label,
            attempt = attempts.load(Ordering::SeqCst),
            max_attempts,
            delay_ms = delay.as_millis(),
            error = %e,
            "transient failure, retrying"
        );
    };

    backoff::future::retry_notify(policy.backoff(), attempt, notify).await
}

/// Retryable errors are transient until the attempt cap; quota rejections
/// take their delay from the quota schedule when one is given.
fn classify(
    e: AutoNewsError,
    exhausted: bool,
    quota: Option<&Mutex<ExponentialBackoff>>,
) -> backoff::Error<AutoNewsError> {
    if exhausted || !e.is_retryable() {
        return backoff::Error::permanent(e);
    }
    let quota_delay = match quota {
        Some(schedule) if e.is_quota() => schedule
            .lock()
            .ok()
            .and_then(|mut schedule| schedule.next_backoff()),
        _ => None,
    };
    match quota_delay {
        Some(delay) => backoff::Error::retry_after(e, delay),
        None => backoff::Error::transient(e),
    }
}
