use thiserror::Error;

/// Errors reported by a [`crate::RemoteStore`].
///
/// These never escape [`crate::TwoTierCache`]; they are logged and absorbed.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
