//! Prometheus text exposition of the health snapshot.
//!
//! Counters mirror the monitor's running totals; they are brought up to date
//! on every scrape, so the registry never drifts from [`HealthMetrics`].

use crate::error::ObserveError;
use crate::monitor::HealthMetrics;
use parley_resilience::CircuitState;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct PrometheusExporter {
    registry: Registry,
    requests: IntCounterVec,
    errors: IntCounterVec,
    error_rate: Gauge,
    avg_response_ms: Gauge,
    uptime_seconds: Gauge,
    rss_mb: Gauge,
    cpu_percent: Gauge,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_entries: IntGauge,
    breaker_open: GaugeVec,
    breaker_rejected: IntCounterVec,
    stage_calls: IntCounterVec,
    stage_avg_ms: GaugeVec,
    stage_max_ms: GaugeVec,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self, ObserveError> {
        let registry = Registry::new_custom(Some("parley".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests handled, by outcome"),
            &["outcome"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Classified errors, by kind"),
            &["kind"],
        )?;
        let error_rate = Gauge::new("error_rate", "Errors per handled request")?;
        let avg_response_ms = Gauge::new(
            "response_time_avg_ms",
            "Average response time over the rolling window",
        )?;
        let uptime_seconds = Gauge::new("uptime_seconds", "Seconds since start-up")?;
        let rss_mb = Gauge::new("process_resident_memory_mb", "Resident memory")?;
        let cpu_percent = Gauge::new("process_cpu_percent", "CPU usage since the last sample")?;
        let cache_hits = IntCounter::new("cache_hits_total", "Cache hits across both tiers")?;
        let cache_misses = IntCounter::new("cache_misses_total", "Cache misses")?;
        let cache_entries = IntGauge::new("cache_local_entries", "Entries in the local tier")?;
        let breaker_open = GaugeVec::new(
            Opts::new("circuit_breaker_open", "1 while the service's circuit is open"),
            &["service"],
        )?;
        let breaker_rejected = IntCounterVec::new(
            Opts::new(
                "circuit_breaker_rejected_total",
                "Calls short-circuited by the breaker",
            ),
            &["service"],
        )?;
        let stage_calls = IntCounterVec::new(
            Opts::new("stage_latency_count", "Timed calls per pipeline stage"),
            &["series"],
        )?;
        let stage_avg_ms = GaugeVec::new(
            Opts::new("stage_latency_avg_ms", "Average latency per pipeline stage"),
            &["series"],
        )?;
        let stage_max_ms = GaugeVec::new(
            Opts::new("stage_latency_max_ms", "Worst latency per pipeline stage"),
            &["series"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(error_rate.clone()))?;
        registry.register(Box::new(avg_response_ms.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(rss_mb.clone()))?;
        registry.register(Box::new(cpu_percent.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(breaker_open.clone()))?;
        registry.register(Box::new(breaker_rejected.clone()))?;
        registry.register(Box::new(stage_calls.clone()))?;
        registry.register(Box::new(stage_avg_ms.clone()))?;
        registry.register(Box::new(stage_max_ms.clone()))?;

        Ok(Self {
            registry,
            requests,
            errors,
            error_rate,
            avg_response_ms,
            uptime_seconds,
            rss_mb,
            cpu_percent,
            cache_hits,
            cache_misses,
            cache_entries,
            breaker_open,
            breaker_rejected,
            stage_calls,
            stage_avg_ms,
            stage_max_ms,
        })
    }

    /// Registry for collectors owned by the caller, such as connection
    /// gauges. They are included in [`Self::render`].
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `Content-Type` of the rendered exposition.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Updates every series from `metrics` and renders the registry.
    pub fn render(&self, metrics: &HealthMetrics) -> Result<String, ObserveError> {
        self.update(metrics);
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ObserveError::Export(e.to_string()))
    }

    fn update(&self, metrics: &HealthMetrics) {
        let requests = &metrics.requests;
        sync_counter(&self.requests.with_label_values(&["success"]), requests.successful);
        sync_counter(&self.requests.with_label_values(&["failure"]), requests.failed);
        for (kind, count) in &metrics.errors_by_kind {
            sync_counter(&self.errors.with_label_values(&[kind.as_str()]), *count);
        }
        self.error_rate.set(requests.error_rate);
        self.avg_response_ms.set(requests.avg_response_time_ms);
        self.uptime_seconds.set(metrics.uptime_ms as f64 / 1000.0);
        self.rss_mb.set(metrics.process.rss_mb);
        self.cpu_percent.set(f64::from(metrics.process.cpu_percent));

        if let Some(cache) = &metrics.cache {
            sync_counter(&self.cache_hits, cache.hits);
            sync_counter(&self.cache_misses, cache.misses);
            self.cache_entries
                .set(i64::try_from(cache.local_entries).unwrap_or(i64::MAX));
        }

        for (service, stats) in &metrics.circuit_breakers {
            let open = if stats.state == CircuitState::Open { 1.0 } else { 0.0 };
            self.breaker_open
                .with_label_values(&[service.as_str()])
                .set(open);
            sync_counter(
                &self.breaker_rejected.with_label_values(&[service.as_str()]),
                stats.rejected_calls,
            );
        }

        for (series, stats) in &metrics.latency {
            sync_counter(&self.stage_calls.with_label_values(&[series.as_str()]), stats.count);
            self.stage_avg_ms
                .with_label_values(&[series.as_str()])
                .set(stats.avg_ms);
            self.stage_max_ms
                .with_label_values(&[series.as_str()])
                .set(stats.max_ms as f64);
        }
    }
}

/// Moves `counter` to `value`. A lower value means the source was reset.
fn sync_counter(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value < current {
        counter.reset();
        counter.inc_by(value);
    } else {
        counter.inc_by(value - current);
    }
}
