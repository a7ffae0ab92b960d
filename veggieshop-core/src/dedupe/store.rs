//! Dedupe triplet stores
//!
//! Durable shape: table `event_dedupe` with primary key
//! `(tenant_id, event_id, version)` and an index on `expires_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::tenant::TenantId;

#[derive(Debug, Error)]
pub enum DedupeStoreError {
    #[error("dedupe store unavailable: {0}")]
    Unavailable(String),
}

/// One triplet row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeRow {
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub seen_count: i64,
}

/// Outcome of the insert-or-conflict write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripletInsert {
    Inserted,
    Duplicate { seen_count: i64 },
}

/// Triplet persistence SPI
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Insert the triplet, or on conflict bump `seen_count` and `last_seen_at`
    async fn insert_or_bump(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TripletInsert, DedupeStoreError>;

    /// Best-effort bump when the hot-path cache already proved a duplicate
    async fn bump_seen(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DedupeStoreError>;

    /// Delete up to `limit` rows with `expires_at < now`
    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, DedupeStoreError>;
}

/// In-memory triplet store
#[derive(Debug, Default)]
pub struct InMemoryDedupeStore {
    rows: DashMap<(TenantId, String, i64), DedupeRow>,
}

impl InMemoryDedupeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: &TenantId, event_id: &str, version: i64) -> Option<DedupeRow> {
        self.rows
            .get(&(tenant.clone(), event_id.to_string(), version))
            .map(|row| row.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl DedupeStore for InMemoryDedupeStore {
    async fn insert_or_bump(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TripletInsert, DedupeStoreError> {
        let key = (tenant.clone(), event_id.to_string(), version);
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let row = existing.get_mut();
                row.seen_count += 1;
                row.last_seen_at = now;
                Ok(TripletInsert::Duplicate {
                    seen_count: row.seen_count,
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(DedupeRow {
                    first_seen_at: now,
                    last_seen_at: now,
                    expires_at,
                    seen_count: 1,
                });
                Ok(TripletInsert::Inserted)
            }
        }
    }

    async fn bump_seen(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DedupeStoreError> {
        if let Some(mut row) = self
            .rows
            .get_mut(&(tenant.clone(), event_id.to_string(), version))
        {
            row.seen_count += 1;
            row.last_seen_at = now;
        }
        Ok(())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, DedupeStoreError> {
        let expired: Vec<(TenantId, String, i64)> = self
            .rows
            .iter()
            .filter(|row| row.expires_at < now)
            .take(limit as usize)
            .map(|row| row.key().clone())
            .collect();
        let mut deleted = 0;
        for key in expired {
            if self.rows.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Postgres triplet store over the `event_dedupe` table
#[cfg(feature = "database")]
pub struct PgDedupeStore {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl PgDedupeStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl DedupeStore for PgDedupeStore {
    async fn insert_or_bump(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TripletInsert, DedupeStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO event_dedupe
                (tenant_id, event_id, version, first_seen_at, last_seen_at, expires_at, seen_count)
            VALUES ($1, $2, $3, $4, $4, $5, 1)
            ON CONFLICT (tenant_id, event_id, version) DO NOTHING
            "#,
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(version)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DedupeStoreError::Unavailable(e.to_string()))?;

        if inserted.rows_affected() == 1 {
            return Ok(TripletInsert::Inserted);
        }

        use sqlx::Row;
        let row = sqlx::query(
            r#"
            UPDATE event_dedupe
            SET seen_count = seen_count + 1, last_seen_at = $4
            WHERE tenant_id = $1 AND event_id = $2 AND version = $3
            RETURNING seen_count
            "#,
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(version)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DedupeStoreError::Unavailable(e.to_string()))?;
        let seen_count: i64 = row
            .try_get("seen_count")
            .map_err(|e| DedupeStoreError::Unavailable(e.to_string()))?;
        Ok(TripletInsert::Duplicate { seen_count })
    }

    async fn bump_seen(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DedupeStoreError> {
        sqlx::query(
            r#"
            UPDATE event_dedupe
            SET seen_count = seen_count + 1, last_seen_at = $4
            WHERE tenant_id = $1 AND event_id = $2 AND version = $3
            "#,
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(version)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| DedupeStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, DedupeStoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM event_dedupe
            WHERE (tenant_id, event_id, version) IN (
                SELECT tenant_id, event_id, version FROM event_dedupe
                WHERE expires_at < $1
                LIMIT $2
            )
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| DedupeStoreError::Unavailable(e.to_string()))?;
        Ok(deleted.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_duplicate_counts() {
        let store = InMemoryDedupeStore::new();
        let now = Utc::now();
        let expires = now + chrono::Duration::days(14);

        assert_eq!(
            store
                .insert_or_bump(&tenant(), "E1", 1, now, expires)
                .await
                .unwrap(),
            TripletInsert::Inserted
        );
        assert_eq!(store.len(), 1);

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(
            store
                .insert_or_bump(&tenant(), "E1", 1, later, expires)
                .await
                .unwrap(),
            TripletInsert::Duplicate { seen_count: 2 }
        );
        let row = store.get(&tenant(), "E1", 1).unwrap();
        assert_eq!(row.first_seen_at, now);
        assert_eq!(row.last_seen_at, later);
    }

    #[tokio::test]
    async fn test_bump_seen_missing_row_is_noop() {
        let store = InMemoryDedupeStore::new();
        store
            .bump_seen(&tenant(), "missing", 1, Utc::now())
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let store = InMemoryDedupeStore::new();
        let now = Utc::now();
        store
            .insert_or_bump(&tenant(), "old", 1, now, now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .insert_or_bump(&tenant(), "new", 1, now, now + chrono::Duration::days(14))
            .await
            .unwrap();

        let later = now + chrono::Duration::hours(1);
        assert_eq!(store.sweep_expired(later, 100).await.unwrap(), 1);
        assert!(store.get(&tenant(), "old", 1).is_none());
        assert!(store.get(&tenant(), "new", 1).is_some());
    }
}
