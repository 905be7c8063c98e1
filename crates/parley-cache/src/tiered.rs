use crate::error::CacheError;
use crate::pattern;
use crate::store::RemoteStore;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tuning for [`TwoTierCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied by [`TwoTierCache::set`] when the caller does not pass one.
    pub default_ttl: Duration,
    /// Upper bound on how long the local tier keeps any entry.
    pub local_ttl: Duration,
    /// Most entries the local tier holds; the least recently used go first.
    pub local_high_water: usize,
    /// Bound on every remote call.
    pub remote_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            local_ttl: Duration::from_secs(300),
            local_high_water: 1000,
            remote_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: String,
    ttl: Duration,
}

/// Gives each local entry its own lifetime, capped by the cache-wide TTL.
struct EntryTtl;

impl Expiry<String, LocalEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Approximate until pending maintenance has run.
    pub local_entries: u64,
    pub remote_backend: Option<String>,
    pub remote_available: bool,
    pub remote_errors: u64,
}

/// Local cache in front of an optional shared store.
///
/// Reads check the local tier first and fall back to the remote tier,
/// repopulating locally on a remote hit. Writes go to both. Expired local
/// entries are never returned, even before maintenance evicts them.
pub struct TwoTierCache {
    local: Cache<String, LocalEntry>,
    remote: Option<Arc<dyn RemoteStore>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
}

impl std::fmt::Debug for TwoTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("remote", &self.remote.as_ref().map(|r| r.name().to_string()))
            .field("config", &self.config)
            .finish()
    }
}

impl TwoTierCache {
    /// Creates a local-only cache.
    pub fn new(config: CacheConfig) -> Self {
        let local = Cache::builder()
            .max_capacity(config.local_high_water as u64)
            .time_to_live(config.local_ttl)
            .expire_after(EntryTtl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            local,
            remote: None,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
        }
    }

    /// Creates a cache backed by a shared store.
    pub fn with_remote(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote: Some(remote),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether the shared tier is connected and answering.
    pub fn is_available(&self) -> bool {
        self.remote.as_ref().is_some_and(|r| r.is_available())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.local.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }

        if let Some(remote) = &self.remote {
            let found = self
                .remote_call("get", key, remote.get(key))
                .await
                .flatten();
            if let Some(value) = found {
                self.local_insert(key, value.clone(), self.config.local_ttl)
                    .await;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `value` under `key` with the default TTL.
    pub async fn set(&self, key: &str, value: impl Into<String>) {
        self.set_with_ttl(key, value, self.config.default_ttl).await;
    }

    /// Stores `value` under `key`. The local copy lives for the shorter of
    /// `ttl` and the configured local TTL.
    pub async fn set_with_ttl(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        let value = value.into();
        if let Some(remote) = &self.remote {
            self.remote_call("set", key, remote.set(key, &value, ttl))
                .await;
        }
        self.local_insert(key, value, ttl.min(self.config.local_ttl))
            .await;
    }

    pub async fn del(&self, key: &str) {
        self.local.invalidate(key).await;
        if let Some(remote) = &self.remote {
            self.remote_call("del", key, remote.del(key)).await;
        }
    }

    /// Removes every key matching the glob `pattern` from both tiers. Returns
    /// the number of local entries removed. An invalid pattern is a no-op.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let Some(compiled) = pattern::compile(pattern) else {
            return 0;
        };

        let matching: Vec<Arc<String>> = self
            .local
            .iter()
            .filter(|(key, _)| compiled.matches(key))
            .map(|(key, _)| key)
            .collect();
        for key in &matching {
            self.local.invalidate(key.as_str()).await;
        }
        self.local.run_pending_tasks().await;

        if let Some(remote) = &self.remote {
            if let Some(count) = self
                .remote_call("delete_matching", pattern, remote.delete_matching(pattern))
                .await
            {
                tracing::debug!(pattern, remote_removed = count, "invalidated remote cache keys");
            }
        }

        tracing::debug!(pattern, local_removed = matching.len(), "invalidated local cache keys");
        matching.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            local_entries: self.local.entry_count(),
            remote_backend: self.remote.as_ref().map(|r| r.name().to_string()),
            remote_available: self.is_available(),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the hit/miss counters. Entries are kept.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.remote_errors.store(0, Ordering::Relaxed);
    }

    /// Applies pending evictions so [`Self::stats`] reports an exact count.
    pub async fn run_pending_tasks(&self) {
        self.local.run_pending_tasks().await;
    }

    async fn local_insert(&self, key: &str, value: String, ttl: Duration) {
        self.local
            .insert(key.to_string(), LocalEntry { value, ttl })
            .await;
    }

    async fn remote_call<T>(
        &self,
        op: &'static str,
        key: &str,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.remote_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(op, key, "remote cache call failed: {}", e);
                None
            }
            Err(_) => {
                self.remote_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    op,
                    key,
                    timeout_ms = self.config.remote_timeout.as_millis() as u64,
                    "remote cache call timed out"
                );
                None
            }
        }
    }
}
