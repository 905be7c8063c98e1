use crate::error::CacheError;
use async_trait::async_trait;
use std::time::Duration;

/// A shared cache reachable over the network.
///
/// Implementations should report their own connectivity through
/// [`RemoteStore::is_available`]; the two-tier cache bounds every call with a
/// timeout and absorbs all errors.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend label used in logs and health output.
    fn name(&self) -> &str;

    /// Whether the last interaction with the backend succeeded.
    fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Deletes every key matching a glob pattern. Returns the number removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError>;
}
