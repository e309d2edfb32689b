use super::{AdmissionCache, CacheError};
use crate::clock::Clock;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    count: i64,
    expires_at: Instant,
    // Kept so that an expired entry can be re-created with the same window.
    ttl: Duration,
}

impl CacheEntry {
    fn fresh(now: Instant, ttl: Duration) -> Self {
        CacheEntry {
            count: 0,
            expires_at: now + ttl,
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Process-local store. Each key lives in a DashMap shard whose lock is held
/// for the whole read-modify-write, which is what makes increments atomic.
/// Expired entries are invisible to every operation and are physically
/// removed by `purge_expired`.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        InMemoryCache {
            entries: DashMap::new(),
            clock,
            window,
        }
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically purges expired entries until the runtime shuts down.
    pub fn spawn_purger(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = self.len(), "purged expired cache entries");
                }
            }
        });
    }
}

#[async_trait]
impl AdmissionCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<i64, CacheError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
            .unwrap_or(0))
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(CacheEntry::fresh(now, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::fresh(now, ttl));
                Ok(true)
            }
        }
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, CacheError> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::fresh(now, self.window));

        if entry.is_expired(now) {
            let ttl = entry.ttl;
            *entry = CacheEntry::fresh(now, ttl);
        }
        entry.count += 1;
        Ok(entry.count)
    }
}
