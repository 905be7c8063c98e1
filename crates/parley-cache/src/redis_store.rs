//! Redis-backed shared tier.

use crate::error::CacheError;
use crate::store::RemoteStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared store over a multiplexed, auto-reconnecting Redis connection.
pub struct RedisStore {
    conn: ConnectionManager,
    available: AtomicBool,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(url, "connected to redis");
        Ok(Self {
            conn,
            available: AtomicBool::new(true),
        })
    }

    fn track<T>(&self, result: Result<T, redis::RedisError>) -> Result<T, CacheError> {
        match result {
            Ok(value) => {
                if !self.available.swap(true, Ordering::Relaxed) {
                    tracing::info!("redis connection restored");
                }
                Ok(value)
            }
            Err(e) => {
                if self.available.swap(false, Ordering::Relaxed) {
                    tracing::warn!("redis connection lost: {}", e);
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let result = conn.get::<_, Option<String>>(key).await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let result = conn.set_ex::<_, _, ()>(key, value, secs).await;
        self.track(result)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let result = conn.del::<_, ()>(key).await;
        self.track(result)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut scan_conn = self.conn.clone();
        let keys: Vec<String> = {
            let scanned = scan_conn.scan_match::<_, String>(pattern).await;
            let mut iter = self.track(scanned)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let result = conn.del::<_, u64>(&keys).await;
        self.track(result)
    }
}
