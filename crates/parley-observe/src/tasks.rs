//! Periodic health tasks, spawned by the server binary.

use crate::monitor::{HealthMonitor, HealthStatus};
use parley_resilience::attempt_recovery;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Dependencies with a recovery pause in flight. At most one per name.
#[derive(Clone, Default)]
pub(crate) struct RecoveryTracker {
    pending: Arc<Mutex<HashSet<String>>>,
}

impl RecoveryTracker {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_pending(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Spawns the pause and re-check for `name`. Returns `None` while an
    /// earlier recovery for the same dependency is still running.
    pub(crate) fn schedule(
        &self,
        monitor: &Arc<HealthMonitor>,
        name: String,
        error: String,
    ) -> Option<JoinHandle<()>> {
        if !self.lock().insert(name.clone()) {
            tracing::debug!(dependency = %name, "recovery already pending");
            return None;
        }
        let tracker = self.clone();
        let monitor = Arc::clone(monitor);
        Some(tokio::spawn(async move {
            if attempt_recovery(error.as_str()).await {
                if let Some(retried) = monitor.check_dependency(&name).await {
                    tracing::info!(
                        dependency = %retried.name,
                        status = retried.status.as_str(),
                        "dependency re-probed after recovery pause"
                    );
                }
            }
            tracker.lock().remove(&name);
        }))
    }
}

/// Re-probes dependencies and logs the overall verdict when it is not
/// healthy.
///
/// A dependency that fails its probe gets one recovery pause (for transient
/// error kinds) followed by a second probe, on a task of its own. Runs
/// indefinitely.
pub async fn start_health_check_task(monitor: Arc<HealthMonitor>, interval: Duration) {
    if interval.is_zero() {
        tracing::warn!("health check task disabled (interval=0)");
        return;
    }

    tracing::info!(
        interval_secs = interval.as_secs(),
        "starting health check task"
    );

    let recoveries = RecoveryTracker::default();
    loop {
        sleep(interval).await;

        let verdict = monitor.overall_health();
        if verdict != HealthStatus::Healthy {
            let requests = monitor.request_stats();
            tracing::warn!(
                status = verdict.as_str(),
                error_rate = requests.error_rate,
                avg_response_time_ms = requests.avg_response_time_ms,
                "service health is not nominal"
            );
        }

        for result in monitor.check_dependencies().await {
            if result.status != HealthStatus::Unhealthy {
                continue;
            }
            let error = result.error.unwrap_or_default();
            recoveries.schedule(&monitor, result.name, error);
        }
    }
}

/// Logs a one-line health summary at a slow cadence. Runs indefinitely.
pub async fn start_summary_task(monitor: Arc<HealthMonitor>, interval: Duration) {
    if interval.is_zero() {
        tracing::warn!("health summary task disabled (interval=0)");
        return;
    }

    loop {
        sleep(interval).await;

        let metrics = monitor.health_metrics();
        let unhealthy: Vec<String> = monitor
            .services()
            .into_iter()
            .filter(|s| s.status == HealthStatus::Unhealthy)
            .map(|s| s.name)
            .collect();
        let open_circuits = metrics
            .circuit_breakers
            .values()
            .filter(|b| b.state == parley_resilience::CircuitState::Open)
            .count();

        tracing::info!(
            status = monitor.overall_health().as_str(),
            uptime_secs = metrics.uptime_ms / 1000,
            requests = metrics.requests.total,
            error_rate = metrics.requests.error_rate,
            avg_response_time_ms = metrics.requests.avg_response_time_ms,
            rss_mb = metrics.process.rss_mb,
            cache_hit_rate = metrics.cache.as_ref().map(|c| c.hit_rate).unwrap_or(0.0),
            open_circuits,
            unhealthy_dependencies = ?unhealthy,
            "health summary"
        );
    }
}
