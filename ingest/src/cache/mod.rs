//! Occurrence counters scoped to a time window.
//!
//! Every request for the same content bumps the same counter, so the store is
//! where concurrent duplicate submissions get serialized. Implementations must
//! guarantee that:
//! - `set_if_absent` never replaces a live entry, so two racing callers end up
//!   sharing one counter;
//! - `increment_and_get` is atomic and returns the post-increment value, so
//!   concurrent callers each observe a distinct count;
//! - the expiry is fixed when an entry is created and is never pushed back by
//!   an increment;
//! - an entry that expired before `increment_and_get` is replaced by a fresh
//!   one instead of failing.

mod memory;
mod redis_cache;

pub use self::memory::InMemoryCache;
pub use self::redis_cache::RedisCache;

use crate::clock::Clock;
use crate::config::CacheConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait AdmissionCache: Send + Sync {
    /// Current count for `key`, or 0 if it is absent or expired.
    async fn get(&self, key: &str) -> Result<i64, CacheError>;

    /// Creates an entry expiring after `ttl` unless a live one exists.
    /// Returns whether an entry was created.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Atomically increments the counter and returns the new value.
    async fn increment_and_get(&self, key: &str) -> Result<i64, CacheError>;
}

/// Builds the configured store. `window` is the lifetime given to entries
/// that `increment_and_get` has to create on its own.
pub async fn build_cache(
    config: &CacheConfig,
    clock: Arc<dyn Clock>,
    window: Duration,
) -> Result<Arc<dyn AdmissionCache>, CacheError> {
    match config {
        CacheConfig::Memory {
            purge_interval_secs,
        } => {
            let cache = Arc::new(InMemoryCache::new(clock, window));
            cache
                .clone()
                .spawn_purger(Duration::from_secs((*purge_interval_secs).max(1)));
            Ok(cache)
        }
        CacheConfig::Redis {
            url,
            key_prefix,
            timeout_ms,
        } => {
            let cache = RedisCache::connect(
                url,
                key_prefix.clone(),
                Duration::from_millis(*timeout_ms),
                window,
            )
            .await?;
            Ok(Arc::new(cache))
        }
    }
}
