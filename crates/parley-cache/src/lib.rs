//! Two-tier response cache.
//!
//! A bounded process-local [`moka`] cache sits in front of an optional shared
//! [`RemoteStore`]. The remote tier is a pure optimization: every remote
//! failure is logged and treated as a miss or a no-op, so callers never see
//! a cache error and the process degrades to local-only caching.
//!
//! Keys are built with [`generate_key`] as `prefix:type:hash` so unrelated
//! call sites cannot collide.

pub mod error;
pub mod pattern;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod tiered;

pub use error::CacheError;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use store::RemoteStore;
pub use tiered::{CacheConfig, CacheStats, TwoTierCache};

use sha2::{Digest, Sha256};

/// Builds a deterministic cache key of the form `prefix:type:hash`.
pub fn generate_key(prefix: &str, kind: &str, hash: &str) -> String {
    format!("{prefix}:{kind}:{hash}")
}

/// Hex-encoded SHA-256 of `content`, suitable as the hash part of a key.
pub fn hash_key(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_joins_parts_with_colons() {
        assert_eq!(generate_key("llm", "response", "abc"), "llm:response:abc");
    }

    #[test]
    fn hash_key_is_deterministic_sha256() {
        let a = hash_key("hello:");
        let b = hash_key("hello:");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_key("hello:ctx"));
    }

    #[test]
    fn hash_key_matches_known_digest() {
        assert_eq!(
            hash_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
