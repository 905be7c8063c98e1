use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Summary of one named latency series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub last_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Series {
    count: u64,
    total_ms: u64,
    max_ms: u64,
    last_ms: u64,
}

/// Named latency recorder, cheap to clone and share.
///
/// Series names follow `<stage>_latency_ms`, e.g. `stt_partial_latency_ms`.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    series: Arc<Mutex<HashMap<String, Series>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, ms: u64) {
        let mut series = self.lock();
        let entry = series.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.total_ms = entry.total_ms.saturating_add(ms);
        entry.max_ms = entry.max_ms.max(ms);
        entry.last_ms = ms;
    }

    pub fn get(&self, name: &str) -> Option<LatencyStats> {
        self.lock().get(name).map(Self::summarize)
    }

    pub fn snapshot(&self) -> BTreeMap<String, LatencyStats> {
        self.lock()
            .iter()
            .map(|(name, s)| (name.clone(), Self::summarize(s)))
            .collect()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    fn summarize(series: &Series) -> LatencyStats {
        LatencyStats {
            count: series.count,
            avg_ms: if series.count == 0 {
                0.0
            } else {
                series.total_ms as f64 / series.count as f64
            },
            max_ms: series.max_ms,
            last_ms: series.last_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Series>> {
        match self.series.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("metrics lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }
}
