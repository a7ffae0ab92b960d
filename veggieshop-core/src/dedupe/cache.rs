//! Hot-path dedupe cache
//!
//! A set-if-absent cache in front of the dedupe store. A failed `set_nx`
//! proves the triplet was seen recently and skips the store round-trip; cache
//! errors never decide acceptance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::clock::WallClock;

#[derive(Debug, Error)]
pub enum DedupeCacheError {
    #[error("dedupe cache unavailable: {0}")]
    Unavailable(String),
}

/// Set-if-absent cache SPI
#[async_trait]
pub trait DedupeCache: Send + Sync {
    /// Returns true when the key was absent and is now set for `ttl`
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, DedupeCacheError>;
}

/// In-memory cache with lazy expiry
pub struct InMemoryDedupeCache {
    entries: DashMap<String, i64>,
    clock: Arc<dyn WallClock>,
}

impl InMemoryDedupeCache {
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl DedupeCache for InMemoryDedupeCache {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, DedupeCacheError> {
        let now = self.clock.now_millis();
        let expires_at = now + ttl.as_millis() as i64;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if *existing.get() <= now {
                    existing.insert(expires_at);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }
}

/// Redis-backed cache (`SET key 1 NX EX ttl`)
#[cfg(feature = "cache")]
pub struct RedisDedupeCache {
    pool: deadpool_redis::Pool,
}

#[cfg(feature = "cache")]
impl RedisDedupeCache {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl DedupeCache for RedisDedupeCache {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, DedupeCacheError> {
        use redis::AsyncCommands;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DedupeCacheError::Unavailable(e.to_string()))?;
        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1)));
        let reply: Option<String> = conn
            .set_options(key, 1, options)
            .await
            .map_err(|e| DedupeCacheError::Unavailable(e.to_string()))?;
        Ok(reply.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_set_nx_first_wins() {
        let clock = ManualClock::new(1_000);
        let cache = InMemoryDedupeCache::new(clock);
        assert!(cache.set_nx("k", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.set_nx("k", Duration::from_secs(60)).await.unwrap());
        assert!(cache.set_nx("other", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_reset() {
        let clock = ManualClock::new(1_000);
        let cache = InMemoryDedupeCache::new(clock.clone());
        assert!(cache.set_nx("k", Duration::from_secs(1)).await.unwrap());
        clock.advance_millis(1_001);
        assert!(cache.set_nx("k", Duration::from_secs(1)).await.unwrap());
    }
}
