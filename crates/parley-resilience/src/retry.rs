//! Retries with exponential backoff, and best-effort recovery pauses.

use crate::classify::{classify, ErrorKind};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the 1-based `attempt` failed: `base * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` attempts are used up. Returns the last error.
pub async fn retry_operation<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let info = classify(&e);
                if !info.retryable || attempt >= max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    kind = info.kind.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// The fixed pause taken by [`attempt_recovery`] for `kind`, if any.
pub fn recovery_pause(kind: ErrorKind) -> Option<Duration> {
    match kind {
        ErrorKind::Network => Some(Duration::from_secs(2)),
        ErrorKind::ServiceUnavailable => Some(Duration::from_secs(5)),
        ErrorKind::RateLimited => Some(Duration::from_secs(60)),
        _ => None,
    }
}

/// Waits out a transient failure before the caller tries again.
///
/// Returns `true` when a recovery pause was taken; `false` for kinds that no
/// pause can help. A `true` result is a hint, not a guarantee.
pub async fn attempt_recovery<E: fmt::Display + ?Sized>(error: &E) -> bool {
    let kind = classify(error).kind;
    match recovery_pause(kind) {
        Some(pause) => {
            tracing::info!(
                kind = kind.as_str(),
                pause_ms = pause.as_millis() as u64,
                "pausing before recovery attempt"
            );
            tokio::time::sleep(pause).await;
            true
        }
        None => {
            tracing::debug!(kind = kind.as_str(), "no recovery strategy for error");
            false
        }
    }
}
