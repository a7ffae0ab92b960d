//! Write-once idempotent request acceptance
//!
//! For a `(tenant, key)` pair the first writer wins: the row is inserted
//! before the handler runs, the response snapshot is stored on completion,
//! and replays with the same request hash return the stored snapshot.
//! A replay with a different request hash is a key conflict.

mod memory;
#[cfg(feature = "database")]
mod pg;

pub use memory::InMemoryIdempotencyStore;
#[cfg(feature = "database")]
pub use pg::PgIdempotencyStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::WallClock;
use crate::problem::{Problem, ProblemKind};
use crate::tenant::TenantId;

/// Idempotency tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Record lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Rows deleted per sweep batch
    #[serde(default = "default_sweep_batch_limit")]
    pub sweep_batch_limit: u32,

    /// Sweep loop interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    86_400
}
fn default_sweep_batch_limit() -> u32 {
    500
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_batch_limit: default_sweep_batch_limit(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Stored request snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub key: Uuid,
    pub request_hash: String,
    pub http_method: String,
    pub http_path: String,
    pub response_body: Option<serde_json::Value>,
    pub status: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub row_version: i64,
}

#[derive(Debug, Error)]
pub enum IdempotencyStoreError {
    #[error("record invariant violated: {0}")]
    Invariant(String),
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
}

impl IdempotencyRecord {
    /// Check the row invariants: TTL ordering and status range
    pub fn check(&self) -> Result<(), IdempotencyStoreError> {
        if self.expires_at <= self.created_at {
            return Err(IdempotencyStoreError::Invariant(
                "expires_at must be after created_at".to_string(),
            ));
        }
        if let Some(status) = self.status {
            if !(100..=599).contains(&status) {
                return Err(IdempotencyStoreError::Invariant(format!(
                    "status {status} out of range"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of the first-writer-wins insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// This caller inserted the row and owns the execution
    Inserted,
    /// A row already existed for `(tenant, key)`
    Conflict(IdempotencyRecord),
}

/// Idempotency persistence SPI
///
/// The durable implementation maps to the `idempotency` table: primary key
/// `(tenant_id, key)`, partitioned by `created_at`, indexed on `expires_at`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic insert-if-absent (`ON CONFLICT DO NOTHING` semantics)
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<InsertOutcome, IdempotencyStoreError>;

    async fn get(
        &self,
        tenant: &TenantId,
        key: Uuid,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;

    /// Store the response snapshot for a previously inserted row
    async fn complete(
        &self,
        tenant: &TenantId,
        key: Uuid,
        response_body: serde_json::Value,
        status: u16,
    ) -> Result<(), IdempotencyStoreError>;

    /// Delete up to `limit` rows with `expires_at < now`; returns rows deleted
    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, IdempotencyStoreError>;
}

/// Parse a client-supplied idempotency key: canonical hyphenated or 32-hex
pub fn parse_key(raw: &str) -> Result<Uuid, Problem> {
    Uuid::try_parse(raw.trim()).map_err(|_| {
        Problem::with_detail(
            ProblemKind::ValidationFailed,
            "Idempotency-Key must be an RFC 4122 UUID",
        )
    })
}

/// What the caller should do after `begin`
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// First occurrence: execute the real handler, then call `complete`
    Start,
    /// Same request seen before and finished: return the stored snapshot
    Replay {
        body: serde_json::Value,
        status: u16,
    },
    /// Same request seen before but still executing
    InFlight,
}

/// Orchestrates the accept/replay/conflict decision
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn WallClock>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn WallClock>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Admit a mutating request
    ///
    /// Store failures fail closed: the request is rejected rather than risking
    /// a double execution.
    pub async fn begin(
        &self,
        tenant: &TenantId,
        key: Uuid,
        request_hash: &str,
        http_method: &str,
        http_path: &str,
    ) -> Result<BeginOutcome, Problem> {
        let now = self.clock.now();
        let record = IdempotencyRecord {
            tenant_id: tenant.clone(),
            key,
            request_hash: request_hash.to_string(),
            http_method: http_method.to_string(),
            http_path: http_path.to_string(),
            response_body: None,
            status: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.ttl_secs as i64),
            row_version: 0,
        };
        record.check().map_err(store_problem)?;

        match self.store.insert_if_absent(record).await.map_err(store_problem)? {
            InsertOutcome::Inserted => Ok(BeginOutcome::Start),
            InsertOutcome::Conflict(existing) => {
                if existing.request_hash != request_hash {
                    return Err(Problem::with_detail(
                        ProblemKind::IdempotencyKeyConflict,
                        "Idempotency key was used with a different request",
                    )
                    .tenant(tenant.as_str())
                    .extension("idempotency-key", key.to_string())
                    .extension("stored-request-hash", existing.request_hash.clone())
                    .extension("received-request-hash", request_hash));
                }
                match (existing.response_body, existing.status) {
                    (Some(body), Some(status)) => Ok(BeginOutcome::Replay { body, status }),
                    _ => Ok(BeginOutcome::InFlight),
                }
            }
        }
    }

    /// Store the handler's response snapshot
    pub async fn complete(
        &self,
        tenant: &TenantId,
        key: Uuid,
        response_body: serde_json::Value,
        status: u16,
    ) -> Result<(), Problem> {
        if !(100..=599).contains(&status) {
            return Err(Problem::with_detail(
                ProblemKind::ValidationFailed,
                format!("response status {status} out of range"),
            ));
        }
        self.store
            .complete(tenant, key, response_body, status)
            .await
            .map_err(store_problem)
    }

    /// One TTL sweep pass
    pub async fn sweep_once(&self) -> Result<u64, Problem> {
        self.store
            .sweep_expired(self.clock.now(), self.config.sweep_batch_limit)
            .await
            .map_err(store_problem)
    }

    /// Sweep loop; exits when `shutdown` flips to true
    pub async fn run_sweeper(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(deleted) => {
                            tracing::debug!(deleted, "idempotency sweep");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "idempotency sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

fn store_problem(err: IdempotencyStoreError) -> Problem {
    Problem::with_detail(ProblemKind::DependencyUnavailable, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn key() -> Uuid {
        Uuid::parse_str("11111111-1111-4111-8111-111111111111").unwrap()
    }

    fn service(clock: Arc<ManualClock>) -> IdempotencyService {
        IdempotencyService::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            clock,
            IdempotencyConfig::default(),
        )
    }

    #[test]
    fn test_parse_key_formats() {
        assert_eq!(parse_key("11111111-1111-4111-8111-111111111111").unwrap(), key());
        assert_eq!(parse_key("11111111111141118111111111111111").unwrap(), key());
        assert!(parse_key("not-a-uuid").is_err());
    }

    #[test]
    fn test_record_invariants() {
        let now = Utc::now();
        let mut record = IdempotencyRecord {
            tenant_id: tenant(),
            key: key(),
            request_hash: "h".to_string(),
            http_method: "POST".to_string(),
            http_path: "/v1/orders".to_string(),
            response_body: None,
            status: Some(201),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            row_version: 0,
        };
        assert!(record.check().is_ok());

        record.expires_at = record.created_at;
        assert!(record.check().is_err());

        record.expires_at = now + chrono::Duration::hours(1);
        record.status = Some(600);
        assert!(record.check().is_err());
    }

    #[tokio::test]
    async fn test_first_writer_then_replay() {
        let clock = ManualClock::new(1_700_000_000_000);
        let service = service(clock);

        let outcome = service
            .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
            .await
            .unwrap();
        assert!(matches!(outcome, BeginOutcome::Start));

        service
            .complete(&tenant(), key(), serde_json::json!({"id": "o1"}), 201)
            .await
            .unwrap();

        match service
            .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
            .await
            .unwrap()
        {
            BeginOutcome::Replay { body, status } => {
                assert_eq!(status, 201);
                assert_eq!(body, serde_json::json!({"id": "o1"}));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_flight_before_completion() {
        let clock = ManualClock::new(1_700_000_000_000);
        let service = service(clock);
        service
            .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
            .await
            .unwrap();
        assert!(matches!(
            service
                .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
                .await
                .unwrap(),
            BeginOutcome::InFlight
        ));
    }

    #[tokio::test]
    async fn test_different_hash_conflicts() {
        let clock = ManualClock::new(1_700_000_000_000);
        let service = service(clock);
        service
            .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
            .await
            .unwrap();

        let err = service
            .begin(&tenant(), key(), "hash-2", "POST", "/v1/orders")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::IdempotencyKeyConflict);
    }

    #[tokio::test]
    async fn test_sweep_deletes_expired() {
        let clock = ManualClock::new(1_700_000_000_000);
        let service = service(clock.clone());
        service
            .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
            .await
            .unwrap();

        // Not expired yet
        assert_eq!(service.sweep_once().await.unwrap(), 0);

        clock.advance_millis(86_400_001);
        assert_eq!(service.sweep_once().await.unwrap(), 1);

        // Key is free again after expiry
        assert!(matches!(
            service
                .begin(&tenant(), key(), "hash-1", "POST", "/v1/orders")
                .await
                .unwrap(),
            BeginOutcome::Start
        ));
    }

    #[tokio::test]
    async fn test_complete_rejects_bad_status() {
        let clock = ManualClock::new(1_700_000_000_000);
        let service = service(clock);
        let err = service
            .complete(&tenant(), key(), serde_json::json!({}), 42)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::ValidationFailed);
    }
}
