//! Health and latency observability for the Parley backend.
//!
//! The [`HealthMonitor`] aggregates running request counters, a rolling
//! window of response times, error counts by kind, external dependency probe
//! results, process memory/CPU, and the cache / circuit breaker / rate
//! limiter snapshots into one [`HealthMetrics`] view and a single
//! [`HealthStatus`] verdict.
//!
//! It observes; it never sits on the request path. Recording is a handful
//! of atomic increments and short critical sections.
//!
//! # Verdict rules
//!
//! Evaluated in order, first match wins:
//!
//! | Condition | Verdict |
//! |-----------|---------|
//! | resident memory above the ceiling | `degraded` |
//! | error rate above the high threshold | `unhealthy` |
//! | error rate above the low threshold | `degraded` |
//! | average response time above the ceiling | `degraded` |
//! | otherwise | `healthy` |

mod error;
mod metrics;
mod monitor;
mod probe;
mod process;
mod prom;
mod tasks;

pub use error::ObserveError;
pub use metrics::{LatencyStats, Metrics};
pub use monitor::{
    HealthMetrics, HealthMonitor, HealthSources, HealthStatus, HealthThresholds, RequestStats,
    ServiceHealth,
};
pub use probe::{CacheProbe, DependencyProbe, HttpProbe};
pub use process::{ProcessSampler, ProcessStats};
pub use prom::PrometheusExporter;
pub use tasks::{start_health_check_task, start_summary_task};
