//! Per-service circuit breakers.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  N failures   ┌────────┐  recovery   ┌──────────┐
//! │ Closed ├──────────────►│  Open  ├────────────►│ HalfOpen │
//! └───▲────┘               └───▲────┘   timeout   └────┬─────┘
//!     │                        │      failure          │
//!     │  success               └───────────────────────┤
//!     └────────────────────────────────────────────────┘
//! ```
//!
//! A half-open breaker admits exactly one probe call; concurrent callers are
//! short-circuited until the probe settles.

use crate::lock_or_recover;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Breaker state for one named service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Healthy; every call goes through.
    Closed,
    /// Tripped; calls are short-circuited until the recovery timeout elapses.
    Open,
    /// Recovery timeout elapsed; one probe call decides the next state.
    HalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Calls slower than this are logged as degraded. They are not failures.
    #[serde(default = "default_expected_response_time_ms")]
    pub expected_response_time_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_expected_response_time_ms() -> u64 {
    5_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            expected_response_time_ms: default_expected_response_time_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn expected_response_time(&self) -> Duration {
        Duration::from_millis(self.expected_response_time_ms)
    }
}

/// Outcome of a guarded call that did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not invoked.
    #[error("service {service} is temporarily unavailable")]
    Open {
        service: String,
        retry_after: Duration,
    },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Suggested wait before calling again, when short-circuited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Open { retry_after, .. } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }
}

/// Serializable snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_ago_ms: Option<u64>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

enum Admission {
    Allowed { probe: bool },
    Rejected { retry_after: Duration },
}

/// Failure isolator for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Clears the in-flight probe flag if a probe call is dropped before it
/// settles, so a cancelled probe cannot wedge the breaker half-open.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock_or_recover(&self.breaker.inner, "circuit breaker").probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as last recorded. An open breaker whose recovery timeout
    /// has elapsed still reports `Open` until the next call probes it.
    pub fn state(&self) -> CircuitState {
        lock_or_recover(&self.inner, "circuit breaker").state
    }

    /// Runs `operation` unless the breaker is open.
    ///
    /// Short-circuited calls return [`BreakerError::Open`] without invoking
    /// `operation`.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let probe = match self.admit() {
            Admission::Allowed { probe } => probe,
            Admission::Rejected { retry_after } => {
                return Err(BreakerError::Open {
                    service: self.name.clone(),
                    retry_after,
                });
            }
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();

        if elapsed > self.config.expected_response_time() {
            tracing::warn!(
                service = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                expected_ms = self.config.expected_response_time_ms,
                "slow call through circuit breaker"
            );
        }

        match &result {
            Ok(_) => self.record_success(probe),
            Err(e) => self.record_failure(e, probe),
        }
        guard.armed = false;

        result.map_err(BreakerError::Inner)
    }

    /// Runs `operation`, substituting `fallback` when the breaker is open or
    /// the operation fails. Failures are still recorded.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match self.execute(operation).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open { .. }) => {
                tracing::debug!(service = %self.name, "circuit open, using fallback");
                fallback().await
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(service = %self.name, "call failed, using fallback: {}", e);
                fallback().await
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = lock_or_recover(&self.inner, "circuit breaker");
        BreakerStats {
            service_name: self.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            last_failure_ago_ms: inner
                .last_failure_at
                .map(|t| t.elapsed().as_millis() as u64),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let mut inner = lock_or_recover(&self.inner, "circuit breaker");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }

    fn admit(&self) -> Admission {
        let mut inner = lock_or_recover(&self.inner, "circuit breaker");
        let admission = match inner.state {
            CircuitState::Closed => Admission::Allowed { probe: false },
            CircuitState::HalfOpen if inner.probe_in_flight => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Admission::Allowed { probe: true }
            }
            CircuitState::Open => {
                let recovery = self.config.recovery_timeout();
                let since_failure = inner
                    .last_failure_at
                    .map_or(recovery, |t| t.elapsed());
                if since_failure >= recovery {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(service = %self.name, "circuit half-open, probing");
                    Admission::Allowed { probe: true }
                } else {
                    Admission::Rejected {
                        retry_after: recovery - since_failure,
                    }
                }
            }
        };

        match admission {
            Admission::Allowed { .. } => inner.total_calls += 1,
            Admission::Rejected { .. } => inner.rejected_calls += 1,
        }
        admission
    }

    /// Only the half-open probe may close the circuit. A call admitted while
    /// closed that settles after the breaker tripped leaves the state alone.
    fn record_success(&self, probe: bool) {
        let mut inner = lock_or_recover(&self.inner, "circuit breaker");
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                tracing::info!(service = %self.name, "circuit closed after successful probe");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                tracing::debug!(service = %self.name, "stale success ignored while circuit is not closed");
            }
        }
    }

    fn record_failure(&self, error: &dyn fmt::Display, probe: bool) {
        let mut inner = lock_or_recover(&self.inner, "circuit breaker");
        inner.consecutive_failures += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        if probe {
            inner.probe_in_flight = false;
        }

        let trip = match inner.state {
            CircuitState::HalfOpen => probe,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            tracing::warn!(
                service = %self.name,
                failures = inner.consecutive_failures,
                recovery_ms = self.config.recovery_timeout_ms,
                "circuit opened: {}",
                error
            );
        } else {
            tracing::debug!(
                service = %self.name,
                failures = inner.consecutive_failures,
                "call failed: {}",
                error
            );
        }
    }
}

/// Lazily creates and caches one breaker per service name.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_overrides(default_config, HashMap::new())
    }

    /// Services named in `overrides` get their own thresholds.
    pub fn with_overrides(
        default_config: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            default_config,
            overrides,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = match self.breakers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = breakers.get(name) {
                return existing.clone();
            }
        }

        let mut breakers = match self.breakers.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("breaker registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                tracing::debug!(service = name, "created circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// Snapshot of every breaker created so far, ordered by name.
    pub fn stats(&self) -> BTreeMap<String, BreakerStats> {
        let breakers = match self.breakers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    /// Names of breakers currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        self.stats()
            .into_iter()
            .filter(|(_, s)| s.state == CircuitState::Open)
            .map(|(name, _)| name)
            .collect()
    }

    pub fn reset_all(&self) {
        let breakers = match self.breakers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
                expected_response_time_ms: 5_000,
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>("connection refused") })
            .await;
    }

    #[tokio::test]
    async fn initial_state_is_closed() {
        let breaker = make_breaker(3, 1_000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let value = breaker.execute(|| async { Ok::<_, String>(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = make_breaker(3, 60_000);
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = make_breaker(3, 60_000);
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 2);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_to_fallback_without_invoking_operation() {
        let breaker = make_breaker(2, 60_000);
        fail(&breaker).await;
        fail(&breaker).await;

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("live")
                },
                || async { Ok("fallback") },
            )
            .await;

        assert_eq!(result.unwrap(), "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_breaker_without_fallback_reports_unavailable() {
        let breaker = make_breaker(1, 60_000);
        fail(&breaker).await;

        let err = breaker
            .execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
        assert_eq!(err.to_string(), "service llm is temporarily unavailable");
        assert!(err.retry_after().unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_recovery_invokes_operation_exactly_once() {
        let breaker = make_breaker(2, 1_000);
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("recovered")
            })
            .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_circuit() {
        let breaker = make_breaker(1, 1_000);
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fresh recovery window: still short-circuiting right after.
        let err = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(err, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_concurrent_probe() {
        let breaker = Arc::new(make_breaker(1, 1_000));
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probing = breaker.clone();
        let probe = tokio::spawn(async move {
            probing
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(second, Err(BreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_releases_half_open_slot() {
        let breaker = make_breaker(1, 1_000);
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        {
            let pending = breaker.execute(|| std::future::pending::<Result<(), String>>());
            let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;
        }

        let result = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_from_before_the_trip_keeps_circuit_open() {
        let breaker = Arc::new(make_breaker(2, 30_000));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = breaker.clone();
        let in_flight = tokio::spawn(async move {
            slow.execute(|| async move {
                let _ = release_rx.await;
                Ok::<_, String>(())
            })
            .await
        });
        tokio::task::yield_now().await;

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        release_tx.send(()).unwrap();
        in_flight.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(err, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_release_the_probe_slot() {
        let breaker = Arc::new(make_breaker(1, 1_000));

        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = breaker.clone();
        let stale = tokio::spawn(async move {
            slow.execute(|| async move {
                let _ = fail_rx.await;
                Err::<(), _>("timed out".to_string())
            })
            .await
        });
        tokio::task::yield_now().await;

        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probing = breaker.clone();
        let probe = tokio::spawn(async move {
            probing
                .execute(|| async move {
                    let _ = probe_rx.await;
                    Ok::<_, String>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail_tx.send(()).unwrap();
        assert!(stale.await.unwrap().is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let blocked = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(blocked, Err(BreakerError::Open { .. })));

        probe_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fallback_used_when_operation_fails() {
        let breaker = make_breaker(5, 60_000);
        let result = breaker
            .execute_with_fallback(
                || async { Err::<&str, _>("network down".to_string()) },
                || async { Ok("cached") },
            )
            .await;
        assert_eq!(result.unwrap(), "cached");
        assert_eq!(breaker.stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_do_not_count_as_failures() {
        let breaker = CircuitBreaker::new(
            "tts",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 1_000,
                expected_response_time_ms: 10,
            },
        );
        breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn manager_reuses_breakers_by_name() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let a = manager.breaker("llm");
        let b = manager.breaker("llm");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &manager.breaker("tts")));
        assert_eq!(manager.stats().len(), 2);
    }

    #[test]
    fn manager_applies_per_service_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "stt".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        );
        let manager =
            CircuitBreakerManager::with_overrides(CircuitBreakerConfig::default(), overrides);
        assert_eq!(manager.breaker("stt").config().failure_threshold, 2);
        assert_eq!(manager.breaker("llm").config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn manager_reports_open_circuits_and_resets() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        fail(&manager.breaker("llm")).await;
        manager.breaker("tts");

        assert_eq!(manager.open_circuits(), vec!["llm".to_string()]);
        let stats = manager.stats();
        assert_eq!(stats["llm"].state, CircuitState::Open);
        assert_eq!(stats["tts"].state, CircuitState::Closed);

        manager.reset_all();
        assert!(manager.open_circuits().is_empty());
    }

    #[test]
    fn stats_serialize_with_wire_state_names() {
        let breaker = make_breaker(3, 1_000);
        let json = serde_json::to_value(breaker.stats()).unwrap();
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["serviceName"], "llm");
    }
}
