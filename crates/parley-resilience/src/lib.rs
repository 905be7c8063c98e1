//! Reliability primitives shared by every call path.
//!
//! - [`breaker`]: per-service circuit breakers and a lazily populated manager.
//! - [`limiter`]: fixed-window rate limiting, the upstream provider quota and
//!   jittered backoff.
//! - [`classify`]: maps arbitrary failures onto a closed [`ErrorKind`]
//!   taxonomy with retry hints and user-facing fallback text.
//! - [`retry`]: exponential-backoff retries and best-effort recovery pauses.
//!
//! All shared state here sits behind short `std::sync` critical sections that
//! never span an `.await`.

pub mod breaker;
pub mod classify;
pub mod limiter;
pub mod retry;

pub use breaker::{
    BreakerError, BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager,
    CircuitState,
};
pub use classify::{
    classify, ClassificationRule, ErrorClassifier, ErrorInfo, ErrorKind, ErrorResponse,
};
pub use limiter::{
    backoff_delay, next_model, ProviderQuota, ProviderQuotaConfig, RateLimitConfig,
    RateLimitDecision, RateLimitExceeded, RateLimiter,
};
pub use retry::{attempt_recovery, recovery_pause, retry_operation, RetryPolicy};

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
///
/// Stale counters are preferable to refusing every caller.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("{} lock poisoned, recovering with stale state", what);
            poisoned.into_inner()
        }
    }
}
