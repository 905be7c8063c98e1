use crate::metrics::{LatencyStats, Metrics};
use crate::probe::DependencyProbe;
use crate::process::{ProcessSampler, ProcessStats};
use parley_cache::{CacheStats, TwoTierCache};
use parley_resilience::limiter::WindowStats;
use parley_resilience::{BreakerStats, CircuitBreakerManager, ErrorKind, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Response-time samples kept for the rolling average.
const RESPONSE_WINDOW: usize = 1000;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits used by [`HealthThresholds::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: f64,
    #[serde(default = "default_error_rate_unhealthy")]
    pub error_rate_unhealthy: f64,
    #[serde(default = "default_error_rate_degraded")]
    pub error_rate_degraded: f64,
    #[serde(default = "default_response_time_ceiling_ms")]
    pub response_time_ceiling_ms: f64,
}

fn default_memory_ceiling_mb() -> f64 {
    500.0
}

fn default_error_rate_unhealthy() -> f64 {
    0.10
}

fn default_error_rate_degraded() -> f64 {
    0.05
}

fn default_response_time_ceiling_ms() -> f64 {
    5000.0
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_ceiling_mb: default_memory_ceiling_mb(),
            error_rate_unhealthy: default_error_rate_unhealthy(),
            error_rate_degraded: default_error_rate_degraded(),
            response_time_ceiling_ms: default_response_time_ceiling_ms(),
        }
    }
}

impl HealthThresholds {
    /// Applies the verdict rules in order; the first match wins.
    pub fn evaluate(&self, rss_mb: f64, error_rate: f64, avg_response_ms: f64) -> HealthStatus {
        if rss_mb > self.memory_ceiling_mb {
            HealthStatus::Degraded
        } else if error_rate > self.error_rate_unhealthy {
            HealthStatus::Unhealthy
        } else if error_rate > self.error_rate_degraded {
            HealthStatus::Degraded
        } else if avg_response_ms > self.response_time_ceiling_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Last probe result for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub name: String,
    pub status: HealthStatus,
    /// Epoch milliseconds.
    pub last_check: i64,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub samples: usize,
}

/// Everything the monitor knows, as one serializable view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub timestamp: i64,
    pub uptime_ms: u64,
    pub requests: RequestStats,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub process: ProcessStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    pub circuit_breakers: BTreeMap<String, BreakerStats>,
    pub rate_limits: BTreeMap<String, WindowStats>,
    pub latency: BTreeMap<String, LatencyStats>,
}

/// Components whose snapshots are folded into [`HealthMetrics`].
#[derive(Default, Clone)]
pub struct HealthSources {
    pub cache: Option<Arc<TwoTierCache>>,
    pub breakers: Option<Arc<CircuitBreakerManager>>,
    pub limiter: Option<RateLimiter>,
    pub metrics: Option<Metrics>,
}

#[derive(Default)]
struct Samples {
    response_times: VecDeque<u64>,
    errors_by_kind: HashMap<ErrorKind, u64>,
}

pub struct HealthMonitor {
    started: Instant,
    thresholds: HealthThresholds,
    sources: HealthSources,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    samples: Mutex<Samples>,
    services: Mutex<BTreeMap<String, ServiceHealth>>,
    probes: Vec<Arc<dyn DependencyProbe>>,
    process: Mutex<ProcessSampler>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, sources: HealthSources) -> Self {
        Self {
            started: Instant::now(),
            thresholds,
            sources,
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            samples: Mutex::new(Samples::default()),
            services: Mutex::new(BTreeMap::new()),
            probes: Vec::new(),
            process: Mutex::new(ProcessSampler::new()),
        }
    }

    /// Registers a dependency to be checked by [`Self::check_dependencies`].
    pub fn with_probe(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn record_request(&self, success: bool, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut samples = lock(&self.samples, "health samples");
        if samples.response_times.len() == RESPONSE_WINDOW {
            samples.response_times.pop_front();
        }
        samples
            .response_times
            .push_back(elapsed.as_millis().min(u64::MAX as u128) as u64);
    }

    /// Counts a classified error. Callers that report errors outside the
    /// HTTP path must also count the originating unit of work with
    /// [`Self::record_request`], or the error rate loses its denominator.
    pub fn record_error(&self, kind: ErrorKind) {
        let mut samples = lock(&self.samples, "health samples");
        *samples.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn request_stats(&self) -> RequestStats {
        let total = self.total.load(Ordering::Relaxed);
        let samples = lock(&self.samples, "health samples");
        let errors: u64 = samples.errors_by_kind.values().sum();
        let count = samples.response_times.len();
        let avg = if count == 0 {
            0.0
        } else {
            samples.response_times.iter().sum::<u64>() as f64 / count as f64
        };
        RequestStats {
            total,
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            error_rate: if total == 0 {
                0.0
            } else {
                (errors as f64 / total as f64).min(1.0)
            },
            avg_response_time_ms: avg,
            samples: count,
        }
    }

    pub fn errors_by_kind(&self) -> BTreeMap<String, u64> {
        lock(&self.samples, "health samples")
            .errors_by_kind
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), *count))
            .collect()
    }

    pub fn process_stats(&self) -> ProcessStats {
        lock(&self.process, "process sampler").sample()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMetrics {
            timestamp: parley_types::now_millis(),
            uptime_ms: self.uptime().as_millis() as u64,
            requests: self.request_stats(),
            errors_by_kind: self.errors_by_kind(),
            process: self.process_stats(),
            cache: self.sources.cache.as_ref().map(|c| c.stats()),
            circuit_breakers: self
                .sources
                .breakers
                .as_ref()
                .map(|b| b.stats())
                .unwrap_or_default(),
            rate_limits: self
                .sources
                .limiter
                .as_ref()
                .map(|l| l.stats())
                .unwrap_or_default(),
            latency: self
                .sources
                .metrics
                .as_ref()
                .map(|m| m.snapshot())
                .unwrap_or_default(),
        }
    }

    pub fn overall_health(&self) -> HealthStatus {
        let requests = self.request_stats();
        let process = self.process_stats();
        self.thresholds.evaluate(
            process.rss_mb,
            requests.error_rate,
            requests.avg_response_time_ms,
        )
    }

    /// Probes every registered dependency, each bounded by a 5 s timeout,
    /// and records the results.
    pub async fn check_dependencies(&self) -> Vec<ServiceHealth> {
        let mut results = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            results.push(self.run_probe(probe.as_ref()).await);
        }
        results
    }

    /// Re-probes a single dependency by name. Returns `None` if unknown.
    pub async fn check_dependency(&self, name: &str) -> Option<ServiceHealth> {
        let probe = self.probes.iter().find(|p| p.name() == name)?;
        Some(self.run_probe(probe.as_ref()).await)
    }

    async fn run_probe(&self, probe: &dyn DependencyProbe) -> ServiceHealth {
        let started = Instant::now();
        let (status, error) = match tokio::time::timeout(PROBE_TIMEOUT, probe.check()).await {
            Ok(Ok(status)) => (status, None),
            Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!("probe timed out after {}ms", PROBE_TIMEOUT.as_millis())),
            ),
        };
        if status != HealthStatus::Healthy {
            tracing::warn!(
                dependency = probe.name(),
                status = status.as_str(),
                error = error.as_deref().unwrap_or(""),
                "dependency check did not pass"
            );
        }
        let result = ServiceHealth {
            name: probe.name().to_string(),
            status,
            last_check: parley_types::now_millis(),
            response_time_ms: started.elapsed().as_millis() as u64,
            error,
        };
        lock(&self.services, "health services").insert(result.name.clone(), result.clone());
        result
    }

    /// Last recorded result per dependency, ordered by name.
    pub fn services(&self) -> Vec<ServiceHealth> {
        lock(&self.services, "health services")
            .values()
            .cloned()
            .collect()
    }

    /// False once any dependency was last seen unhealthy.
    pub fn is_ready(&self) -> bool {
        lock(&self.services, "health services")
            .values()
            .all(|s| s.status != HealthStatus::Unhealthy)
    }

    /// Zeroes every counter and forgets dependency results.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        {
            let mut samples = lock(&self.samples, "health samples");
            samples.response_times.clear();
            samples.errors_by_kind.clear();
        }
        lock(&self.services, "health services").clear();
        tracing::info!("health counters reset");
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("{} lock poisoned, recovering with stale state", what);
            poisoned.into_inner()
        }
    }
}
