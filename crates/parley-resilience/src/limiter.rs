//! Fixed-window rate limiting, provider quotas and backoff.

use crate::lock_or_recover;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Keys tracked before expired windows are evicted.
const MAX_TRACKED_KEYS: usize = 10_000;

/// Limits for one class of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Result of one [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Converts a rejection into a typed error carrying the retry hint.
    pub fn into_result(self, key: &str) -> Result<Self, RateLimitExceeded> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitExceeded {
                key: key.to_string(),
                retry_after: self.reset_after,
            })
        }
    }
}

/// A request was refused by a limiter or quota.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rate limit exceeded for {key}, retry after {}ms", .retry_after.as_millis())]
pub struct RateLimitExceeded {
    pub key: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// Per-key counters for one window, as reported by [`RateLimiter::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub count: u32,
    pub remaining: u32,
    pub reset_in_ms: u64,
}

/// In-memory fixed-window rate limiter keyed by arbitrary strings such as
/// `user:<id>:<operation>`.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Counts one request against `key`.
    ///
    /// The first request of a window resets the counter to 1. Once
    /// `max_requests` is reached further requests are refused until the
    /// window ends; refused requests are not counted.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let mut state = lock_or_recover(&self.state, "rate limiter");
        let now = Instant::now();
        let max = self.config.max_requests;

        // Evict only expired windows; clearing everything would hand every
        // key a fresh budget.
        if state.len() > MAX_TRACKED_KEYS {
            state.retain(|_, window| window.reset_at > now);
        }

        if let Some(window) = state.get_mut(key).filter(|w| now <= w.reset_at) {
            let reset_after = window.reset_at.saturating_duration_since(now);
            if window.count >= max {
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_after,
                };
            }
            window.count += 1;
            return RateLimitDecision {
                allowed: true,
                remaining: max - window.count,
                reset_after,
            };
        }

        // First use, or the previous window has ended.
        let window = self.config.window();
        state.insert(
            key.to_string(),
            RateWindow {
                count: 1,
                reset_at: now + window,
            },
        );
        RateLimitDecision {
            allowed: max > 0,
            remaining: max.saturating_sub(1),
            reset_after: window,
        }
    }

    /// Checks the `user:<id>:<operation>` key.
    pub fn check_user(&self, user_id: &str, operation: &str) -> RateLimitDecision {
        self.check(&Self::user_key(user_id, operation))
    }

    /// Checks the `burst:<id>` key.
    pub fn check_burst(&self, user_id: &str) -> RateLimitDecision {
        self.check(&format!("burst:{user_id}"))
    }

    pub fn user_key(user_id: &str, operation: &str) -> String {
        format!("user:{user_id}:{operation}")
    }

    /// Counters for every live window, ordered by key.
    pub fn stats(&self) -> BTreeMap<String, WindowStats> {
        let state = lock_or_recover(&self.state, "rate limiter");
        let now = Instant::now();
        state
            .iter()
            .filter(|(_, window)| window.reset_at >= now)
            .map(|(key, window)| {
                (
                    key.clone(),
                    WindowStats {
                        count: window.count,
                        remaining: self.config.max_requests.saturating_sub(window.count),
                        reset_in_ms: window.reset_at.saturating_duration_since(now).as_millis()
                            as u64,
                    },
                )
            })
            .collect()
    }

    /// Forgets `key`, giving it a fresh window on the next check.
    pub fn reset(&self, key: &str) {
        lock_or_recover(&self.state, "rate limiter").remove(key);
    }

    pub fn clear(&self) {
        lock_or_recover(&self.state, "rate limiter").clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Ceilings imposed by the upstream model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderQuotaConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
}

fn default_per_minute() -> u32 {
    60
}

fn default_per_hour() -> u32 {
    1000
}

impl Default for ProviderQuotaConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
        }
    }
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct QuotaWindows {
    minute_count: u32,
    minute_start: Instant,
    hour_count: u32,
    hour_start: Instant,
}

impl QuotaWindows {
    fn new(now: Instant) -> Self {
        Self {
            minute_count: 0,
            minute_start: now,
            hour_count: 0,
            hour_start: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.minute_start) >= MINUTE {
            self.minute_count = 0;
            self.minute_start = now;
        }
        if now.duration_since(self.hour_start) >= HOUR {
            self.hour_count = 0;
            self.hour_start = now;
        }
    }
}

/// Per-key usage reported by [`ProviderQuota::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStats {
    pub minute_count: u32,
    pub hour_count: u32,
}

/// Tracks upstream usage per provider credential against minute and hour
/// ceilings.
#[derive(Clone, Debug)]
pub struct ProviderQuota {
    config: ProviderQuotaConfig,
    state: Arc<Mutex<HashMap<String, QuotaWindows>>>,
}

impl ProviderQuota {
    pub fn new(config: ProviderQuotaConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Checks whether one more request fits, without counting it.
    pub fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        let mut state = lock_or_recover(&self.state, "provider quota");
        let now = Instant::now();
        let windows = state
            .entry(key.to_string())
            .or_insert_with(|| QuotaWindows::new(now));
        windows.roll(now);
        self.verdict(key, windows, now)
    }

    /// Counts one request.
    pub fn record(&self, key: &str) {
        let mut state = lock_or_recover(&self.state, "provider quota");
        let now = Instant::now();
        let windows = state
            .entry(key.to_string())
            .or_insert_with(|| QuotaWindows::new(now));
        windows.roll(now);
        windows.minute_count += 1;
        windows.hour_count += 1;
    }

    /// Checks and, when allowed, counts one request under a single lock.
    pub fn try_acquire(&self, key: &str) -> Result<(), RateLimitExceeded> {
        let mut state = lock_or_recover(&self.state, "provider quota");
        let now = Instant::now();
        let windows = state
            .entry(key.to_string())
            .or_insert_with(|| QuotaWindows::new(now));
        windows.roll(now);
        self.verdict(key, windows, now)?;
        windows.minute_count += 1;
        windows.hour_count += 1;
        Ok(())
    }

    pub fn stats(&self) -> BTreeMap<String, QuotaStats> {
        let state = lock_or_recover(&self.state, "provider quota");
        state
            .iter()
            .map(|(key, w)| {
                (
                    key.clone(),
                    QuotaStats {
                        minute_count: w.minute_count,
                        hour_count: w.hour_count,
                    },
                )
            })
            .collect()
    }

    fn verdict(
        &self,
        key: &str,
        windows: &QuotaWindows,
        now: Instant,
    ) -> Result<(), RateLimitExceeded> {
        if windows.hour_count >= self.config.per_hour {
            return Err(RateLimitExceeded {
                key: key.to_string(),
                retry_after: HOUR.saturating_sub(now.duration_since(windows.hour_start)),
            });
        }
        if windows.minute_count >= self.config.per_minute {
            return Err(RateLimitExceeded {
                key: key.to_string(),
                retry_after: MINUTE.saturating_sub(now.duration_since(windows.minute_start)),
            });
        }
        Ok(())
    }
}

impl Default for ProviderQuota {
    fn default() -> Self {
        Self::new(ProviderQuotaConfig::default())
    }
}

/// Exponential backoff with up to 10% random jitter:
/// `min(base * 2^failures, cap) + jitter`.
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(failures));
    let capped = exponential.min(cap);
    let jitter = rand::thread_rng().gen_range(0.0..=0.1);
    capped + capped.mul_f64(jitter)
}

/// Picks the model after `current` in `models`, wrapping around. Unknown
/// `current` values start from the first model.
pub fn next_model<'a>(current: &str, models: &'a [String]) -> Option<&'a str> {
    if models.is_empty() {
        return None;
    }
    let next = match models.iter().position(|m| m == current) {
        Some(i) => (i + 1) % models.len(),
        None => 0,
    };
    Some(models[next].as_str())
}
