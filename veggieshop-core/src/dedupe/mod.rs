//! Event de-duplication with replay fences
//!
//! Events are identified by the triplet `(tenant, event_id, version)`. The
//! first occurrence is accepted and recorded; later occurrences are
//! duplicates. Before the store is consulted, replay fences reject events
//! that are too old a version, too far in the future, or outside the replay
//! window. Store failures are fail-closed: an event is quarantined rather
//! than silently accepted twice.

mod cache;
mod policy;
mod store;

pub use cache::{DedupeCache, DedupeCacheError, InMemoryDedupeCache};
#[cfg(feature = "cache")]
pub use cache::RedisDedupeCache;
pub use policy::{ReplayPolicy, ReplayPolicyProvider, StaticReplayPolicyProvider};
pub use store::{DedupeRow, DedupeStore, DedupeStoreError, InMemoryDedupeStore, TripletInsert};
#[cfg(feature = "database")]
pub use store::PgDedupeStore;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::WallClock;
use crate::tenant::TenantId;

/// Minimum supported record lifetime; shorter TTLs reopen the dedupe window
pub const MIN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Dedupe tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Triplet record lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Hot-path cache entry lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    14 * 24 * 3600
}
fn default_cache_ttl_secs() -> u64 {
    6 * 3600
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Outcome of `check_and_mark`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    /// First occurrence; process the event
    AcceptFirstSeen,
    /// Seen before; skip processing
    Duplicate,
    /// Version below the accepted floor
    QuarantineTooOldVersion,
    /// Event timestamp outside the replay window
    QuarantineOutsideReplayWindow,
    /// Event timestamp too far in the future
    QuarantineFutureSkew,
    /// The store failed; fail closed
    QuarantineStoreError,
}

impl DedupeOutcome {
    pub fn is_quarantine(&self) -> bool {
        matches!(
            self,
            Self::QuarantineTooOldVersion
                | Self::QuarantineOutsideReplayWindow
                | Self::QuarantineFutureSkew
                | Self::QuarantineStoreError
        )
    }
}

/// Triplet acceptance with replay fences and an optional hot-path cache
pub struct DedupeService {
    store: Arc<dyn DedupeStore>,
    cache: Option<Arc<dyn DedupeCache>>,
    policies: Arc<dyn ReplayPolicyProvider>,
    clock: Arc<dyn WallClock>,
    config: DedupeConfig,
}

impl DedupeService {
    pub fn new(
        store: Arc<dyn DedupeStore>,
        cache: Option<Arc<dyn DedupeCache>>,
        policies: Arc<dyn ReplayPolicyProvider>,
        clock: Arc<dyn WallClock>,
        config: DedupeConfig,
    ) -> Self {
        if Duration::from_secs(config.ttl_secs) < MIN_TTL {
            tracing::warn!(
                ttl_secs = config.ttl_secs,
                "dedupe ttl below 7 days reopens the dedupe window for slow replays"
            );
        }
        Self {
            store,
            cache,
            policies,
            clock,
            config,
        }
    }

    /// Decide whether to process an event occurrence
    ///
    /// Fence order: version floor, future skew, replay window (skipped for
    /// operator-driven replays), then the store. The store is the authority;
    /// the cache only short-circuits known duplicates.
    pub async fn check_and_mark(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        event_ts: Option<DateTime<Utc>>,
        family: Option<&str>,
        operator_replay: bool,
    ) -> DedupeOutcome {
        let policy = self.policies.policy_for(tenant, family);
        let now = self.clock.now();

        if version < policy.min_accepted_version {
            return DedupeOutcome::QuarantineTooOldVersion;
        }
        if let Some(ts) = event_ts {
            if ts > now + chrono_duration(policy.max_future_skew) {
                return DedupeOutcome::QuarantineFutureSkew;
            }
            if !operator_replay && ts < now - chrono_duration(policy.replay_window) {
                return DedupeOutcome::QuarantineOutsideReplayWindow;
            }
        }

        if let Some(ref cache) = self.cache {
            let cache_key = format!("dedupe:{}:{}:{}", tenant.as_str(), event_id, version);
            match cache
                .set_nx(&cache_key, Duration::from_secs(self.config.cache_ttl_secs))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    // Known duplicate; still bump the authoritative counter
                    if let Err(err) = self.store.bump_seen(tenant, event_id, version, now).await {
                        tracing::warn!(error = %err, "dedupe seen-count bump failed");
                    }
                    return DedupeOutcome::Duplicate;
                }
                Err(err) => {
                    // Cache trouble never decides acceptance
                    tracing::warn!(error = %err, "dedupe cache unavailable, falling through");
                }
            }
        }

        let expires_at = now + chrono::Duration::seconds(self.config.ttl_secs as i64);
        match self
            .store
            .insert_or_bump(tenant, event_id, version, now, expires_at)
            .await
        {
            Ok(TripletInsert::Inserted) => DedupeOutcome::AcceptFirstSeen,
            Ok(TripletInsert::Duplicate { .. }) => DedupeOutcome::Duplicate,
            Err(err) => {
                tracing::error!(error = %err, "dedupe store failed, quarantining event");
                DedupeOutcome::QuarantineStoreError
            }
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
