//! Transactional outbox
//!
//! Domain writes enqueue a row in the same transaction; the drain loop claims
//! PENDING rows in `created_at` order and publishes them. Rows move
//! PENDING → PUBLISHED (terminal) or, after repeated failure,
//! PENDING → QUARANTINED. `available_at` only moves forward.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::WallClock;
use crate::tenant::TenantId;

use super::backoff::Backoff;
use super::producer::{ProducerError, PublishOptions, ReliableProducer};

/// `last_error` is truncated to this many chars
pub const MAX_LAST_ERROR_LEN: usize = 2_048;

/// Outbox tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Rows claimed per drain pass
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Drain loop poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts before a row is quarantined
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// How long PUBLISHED rows are retained, in seconds
    #[serde(default = "default_published_retention_secs")]
    pub published_retention_secs: u64,

    /// Rows deleted per housekeeping batch
    #[serde(default = "default_housekeeping_batch_limit")]
    pub housekeeping_batch_limit: u32,
}

fn default_batch_size() -> u32 {
    100
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_quarantine_threshold() -> u32 {
    10
}
fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_published_retention_secs() -> u64 {
    24 * 3600
}
fn default_housekeeping_batch_limit() -> u32 {
    1_000
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            quarantine_threshold: default_quarantine_threshold(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
            published_retention_secs: default_published_retention_secs(),
            housekeeping_batch_limit: default_housekeeping_batch_limit(),
        }
    }
}

/// Row lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Published,
    Quarantined,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Quarantined => "QUARANTINED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "PUBLISHED" => Some(Self::Published),
            "QUARANTINED" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

/// One outbox row
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub topic: String,
    pub event_key: Option<String>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub entity_version: Option<i64>,
    pub payload: serde_json::Value,
    /// String-valued headers stored alongside the payload
    pub headers: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub row_version: i64,
}

/// Inputs for a new row; normalized in [`NewOutboxRecord::into_record`]
#[derive(Debug, Clone, Default)]
pub struct NewOutboxRecord {
    pub tenant_id: Option<TenantId>,
    pub topic: String,
    pub event_key: Option<String>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub entity_version: Option<i64>,
    pub payload: serde_json::Value,
    pub headers: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum OutboxStoreError {
    #[error("outbox row invariant violated: {0}")]
    Invariant(String),
    #[error("outbox store unavailable: {0}")]
    Unavailable(String),
}

impl NewOutboxRecord {
    /// Normalize and check, producing a PENDING row available immediately
    pub fn into_record(
        self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        let tenant_id = self
            .tenant_id
            .ok_or_else(|| OutboxStoreError::Invariant("tenant is required".to_string()))?;
        if self.topic.is_empty() {
            return Err(OutboxStoreError::Invariant("topic is required".to_string()));
        }
        Ok(OutboxRecord {
            id,
            tenant_id,
            topic: self.topic,
            event_key: self.event_key,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            entity_version: self.entity_version,
            payload: self.payload,
            headers: self.headers,
            created_at: now,
            available_at: now,
            published_at: None,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            row_version: 0,
        })
    }
}

/// Outbox persistence SPI
///
/// The durable implementation claims batches with `FOR UPDATE SKIP LOCKED`
/// so multiple drain workers scale horizontally without contending.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxStoreError>;

    /// Claim up to `limit` PENDING rows with `available_at <= now`, oldest
    /// `created_at` first; claimed rows stay invisible to other workers until
    /// marked
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    /// PENDING → PUBLISHED; one-shot, PUBLISHED is terminal
    async fn mark_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Record a failed attempt; reschedules or quarantines
    async fn mark_failed(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        error: &str,
        retry_delay: Duration,
        quarantine: bool,
    ) -> Result<(), OutboxStoreError>;

    /// Delete up to `limit` PUBLISHED rows older than `cutoff`
    async fn delete_published_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, OutboxStoreError>;
}

/// In-memory store approximating SKIP LOCKED with a claim set
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: DashMap<Uuid, OutboxRecord>,
    claimed: StdMutex<HashSet<Uuid>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.rows.get(&id).map(|row| row.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn release(&self, id: Uuid) {
        self.claimed.lock().expect("claim lock").remove(&id);
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxStoreError> {
        self.rows.insert(record.id, record);
        Ok(())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let mut claimed = self.claimed.lock().expect("claim lock");
        let mut batch: Vec<OutboxRecord> = self
            .rows
            .iter()
            .filter(|row| {
                row.status == OutboxStatus::Pending
                    && row.available_at <= now
                    && !claimed.contains(&row.id)
            })
            .map(|row| row.clone())
            .collect();
        batch.sort_by_key(|row| row.created_at);
        batch.truncate(limit as usize);
        for row in &batch {
            claimed.insert(row.id);
        }
        Ok(batch)
    }

    async fn mark_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = match self.rows.get_mut(&id) {
            Some(mut row) => {
                if row.status != OutboxStatus::Pending {
                    Err(OutboxStoreError::Invariant(format!(
                        "cannot publish row in state {}",
                        row.status.as_str()
                    )))
                } else {
                    row.status = OutboxStatus::Published;
                    row.published_at = Some(published_at);
                    row.row_version += 1;
                    Ok(())
                }
            }
            None => Err(OutboxStoreError::Invariant(format!("no outbox row {id}"))),
        };
        self.release(id);
        result
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        error: &str,
        retry_delay: Duration,
        quarantine: bool,
    ) -> Result<(), OutboxStoreError> {
        let result = match self.rows.get_mut(&id) {
            Some(mut row) => {
                if row.status != OutboxStatus::Pending {
                    Err(OutboxStoreError::Invariant(format!(
                        "cannot fail row in state {}",
                        row.status.as_str()
                    )))
                } else {
                    row.attempts += 1;
                    row.last_error = Some(truncate_error(error));
                    // available_at only moves forward
                    let next = now
                        + chrono::Duration::from_std(retry_delay)
                            .unwrap_or(chrono::Duration::MAX);
                    row.available_at = row.available_at.max(next);
                    if quarantine {
                        row.status = OutboxStatus::Quarantined;
                    }
                    row.row_version += 1;
                    Ok(())
                }
            }
            None => Err(OutboxStoreError::Invariant(format!("no outbox row {id}"))),
        };
        self.release(id);
        result
    }

    async fn delete_published_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, OutboxStoreError> {
        let victims: Vec<Uuid> = self
            .rows
            .iter()
            .filter(|row| {
                row.status == OutboxStatus::Published
                    && row.published_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .take(limit as usize)
            .map(|row| row.id)
            .collect();
        let mut deleted = 0;
        for id in victims {
            if self.rows.remove(&id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_LAST_ERROR_LEN {
        error.to_string()
    } else {
        error.chars().take(MAX_LAST_ERROR_LEN).collect()
    }
}

/// Drain statistics for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub quarantined: usize,
}

/// Claims batches and publishes them through the reliable producer
pub struct OutboxDrain {
    store: Arc<dyn OutboxStore>,
    producer: ReliableProducer,
    clock: Arc<dyn WallClock>,
    config: OutboxConfig,
    backoff: Backoff,
    rng: StdMutex<StdRng>,
}

impl OutboxDrain {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: ReliableProducer,
        clock: Arc<dyn WallClock>,
        config: OutboxConfig,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.base_backoff_ms),
            2.0,
            Duration::from_millis(config.max_backoff_ms),
            config.jitter_ratio,
        );
        Self {
            store,
            producer,
            clock,
            config,
            backoff,
            rng: StdMutex::new(StdRng::from_os_rng()),
        }
    }

    /// One claim-publish-mark pass
    pub async fn run_once(&self) -> Result<DrainStats, OutboxStoreError> {
        let now = self.clock.now();
        let batch = self.store.claim_batch(now, self.config.batch_size).await?;
        let mut stats = DrainStats {
            claimed: batch.len(),
            ..Default::default()
        };

        for row in batch {
            match self.publish_row(&row).await {
                Ok(()) => {
                    self.store.mark_published(row.id, self.clock.now()).await?;
                    stats.published += 1;
                }
                Err(err) => {
                    let attempts = row.attempts + 1;
                    let quarantine = attempts >= self.config.quarantine_threshold as i32;
                    let delay = {
                        let mut rng = self.rng.lock().expect("drain rng lock");
                        self.backoff.delay(attempts.max(1) as u32, &mut *rng)
                    };
                    tracing::warn!(
                        outbox_id = %row.id,
                        topic = row.topic.as_str(),
                        attempts,
                        quarantine,
                        error = %err,
                        "outbox publish failed"
                    );
                    self.store
                        .mark_failed(row.id, self.clock.now(), &err.to_string(), delay, quarantine)
                        .await?;
                    stats.failed += 1;
                    if quarantine {
                        stats.quarantined += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Drain loop; exits when `shutdown` flips to true
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once().await {
                        Ok(stats) if stats.claimed > 0 => {
                            tracing::debug!(?stats, "outbox drain pass");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "outbox drain pass failed");
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

    async fn publish_row(&self, row: &OutboxRecord) -> Result<(), ProducerError> {
        let mut inbound = crate::headers::EventHeaders::new();
        if let Some(serde_json::Value::Object(map)) = &row.headers {
            for (name, value) in map {
                if let Some(text) = value.as_str() {
                    let _ = inbound.insert_str(name, text);
                }
            }
        }
        let payload = serde_json::to_vec(&row.payload)
            .map_err(|e| ProducerError::Exhausted {
                topic: row.topic.clone(),
                attempts: 0,
                message: format!("payload serialization failed: {e}"),
            })?;
        self.producer
            .publish(
                &row.topic,
                row.event_key.as_deref(),
                payload,
                PublishOptions {
                    tenant: Some(row.tenant_id.clone()),
                    event_id: Some(row.id),
                    aggregate_id: row.aggregate_id.clone(),
                    event_family: row.event_type.clone(),
                    entity_version: row.entity_version,
                    inbound: Some(inbound),
                    ..Default::default()
                },
            )
            .await
            .map(|_| ())
    }
}

/// Deletes PUBLISHED rows past retention
pub struct OutboxHousekeeper {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn WallClock>,
    config: OutboxConfig,
}

impl OutboxHousekeeper {
    pub fn new(store: Arc<dyn OutboxStore>, clock: Arc<dyn WallClock>, config: OutboxConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<u64, OutboxStoreError> {
        let cutoff = self.clock.now()
            - chrono::Duration::seconds(self.config.published_retention_secs as i64);
        self.store
            .delete_published_before(cutoff, self.config.housekeeping_batch_limit)
            .await
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(deleted) => {
                            tracing::debug!(deleted, "outbox housekeeping");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "outbox housekeeping failed");
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

/// Postgres outbox store
#[cfg(feature = "database")]
pub struct PgOutboxStore {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl PgOutboxStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, OutboxStoreError> {
        use sqlx::Row;
        let fetch_err = |e: sqlx::Error| OutboxStoreError::Unavailable(e.to_string());
        let tenant_raw: String = row.try_get("tenant_id").map_err(fetch_err)?;
        let tenant_id = TenantId::parse(&tenant_raw)
            .map_err(|e| OutboxStoreError::Invariant(e.to_string()))?;
        let status_raw: String = row.try_get("status").map_err(fetch_err)?;
        let status = OutboxStatus::parse(&status_raw).ok_or_else(|| {
            OutboxStoreError::Invariant(format!("unknown outbox status {status_raw}"))
        })?;
        Ok(OutboxRecord {
            id: row.try_get("id").map_err(fetch_err)?,
            tenant_id,
            topic: row.try_get("topic").map_err(fetch_err)?,
            event_key: row.try_get("event_key").map_err(fetch_err)?,
            aggregate_type: row.try_get("aggregate_type").map_err(fetch_err)?,
            aggregate_id: row.try_get("aggregate_id").map_err(fetch_err)?,
            event_type: row.try_get("event_type").map_err(fetch_err)?,
            entity_version: row.try_get("entity_version").map_err(fetch_err)?,
            payload: row.try_get("payload").map_err(fetch_err)?,
            headers: row.try_get("headers").map_err(fetch_err)?,
            created_at: row.try_get("created_at").map_err(fetch_err)?,
            available_at: row.try_get("available_at").map_err(fetch_err)?,
            published_at: row.try_get("published_at").map_err(fetch_err)?,
            status,
            attempts: row.try_get("attempts").map_err(fetch_err)?,
            last_error: row.try_get("last_error").map_err(fetch_err)?,
            row_version: row.try_get("row_version").map_err(fetch_err)?,
        })
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox
                (id, tenant_id, topic, event_key, aggregate_type, aggregate_id,
                 event_type, entity_version, payload, headers, created_at,
                 available_at, published_at, status, attempts, last_error, row_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL, $13, 0, NULL, 0)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id.as_str())
        .bind(&record.topic)
        .bind(&record.event_key)
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(record.entity_version)
        .bind(&record.payload)
        .bind(&record.headers)
        .bind(record.created_at)
        .bind(record.available_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, topic, event_key, aggregate_type, aggregate_id,
                   event_type, entity_version, payload, headers, created_at,
                   available_at, published_at, status, attempts, last_error, row_version
            FROM outbox
            WHERE status = 'PENDING' AND available_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxStoreError::Unavailable(e.to_string()))?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn mark_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PUBLISHED', published_at = $2, row_version = row_version + 1
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(published_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxStoreError::Unavailable(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(OutboxStoreError::Invariant(format!(
                "outbox row {id} is not PENDING"
            )));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        error: &str,
        retry_delay: Duration,
        quarantine: bool,
    ) -> Result<(), OutboxStoreError> {
        let next_available =
            now + chrono::Duration::from_std(retry_delay).unwrap_or(chrono::Duration::MAX);
        let status = if quarantine {
            OutboxStatus::Quarantined
        } else {
            OutboxStatus::Pending
        };
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1,
                last_error = $2,
                available_at = GREATEST(available_at, $3),
                status = $4,
                row_version = row_version + 1
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(truncate_error(error))
        .bind(next_available)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxStoreError::Unavailable(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(OutboxStoreError::Invariant(format!(
                "outbox row {id} is not PENDING"
            )));
        }
        Ok(())
    }

    async fn delete_published_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, OutboxStoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'PUBLISHED' AND published_at < $1
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxStoreError::Unavailable(e.to_string()))?;
        Ok(deleted.rows_affected())
    }
}
