//! In-memory idempotency store for tests and development

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::tenant::TenantId;

use super::{IdempotencyRecord, IdempotencyStore, IdempotencyStoreError, InsertOutcome};

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    rows: DashMap<(TenantId, Uuid), IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<InsertOutcome, IdempotencyStoreError> {
        record.check()?;
        let key = (record.tenant_id.clone(), record.key);
        // Entry API keeps the check-and-insert atomic per shard
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Ok(InsertOutcome::Conflict(existing.get().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn get(
        &self,
        tenant: &TenantId,
        key: Uuid,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        Ok(self
            .rows
            .get(&(tenant.clone(), key))
            .map(|row| row.clone()))
    }

    async fn complete(
        &self,
        tenant: &TenantId,
        key: Uuid,
        response_body: serde_json::Value,
        status: u16,
    ) -> Result<(), IdempotencyStoreError> {
        match self.rows.get_mut(&(tenant.clone(), key)) {
            Some(mut row) => {
                row.response_body = Some(response_body);
                row.status = Some(status);
                row.row_version += 1;
                Ok(())
            }
            None => Err(IdempotencyStoreError::Invariant(format!(
                "no idempotency row for key {key}"
            ))),
        }
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, IdempotencyStoreError> {
        let expired: Vec<(TenantId, Uuid)> = self
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

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tenant: &str, key: Uuid, hash: &str) -> IdempotencyRecord {
        let now = Utc::now();
        IdempotencyRecord {
            tenant_id: TenantId::parse(tenant).unwrap(),
            key,
            request_hash: hash.to_string(),
            http_method: "POST".to_string(),
            http_path: "/v1/orders".to_string(),
            response_body: None,
            status: None,
            created_at: now,
            expires_at: now + chrono::Duration::hours(24),
            row_version: 0,
        }
    }

    #[tokio::test]
    async fn test_insert_then_conflict() {
        let store = InMemoryIdempotencyStore::new();
        let key = Uuid::new_v4();
        assert!(matches!(
            store.insert_if_absent(record("acme", key, "h1")).await.unwrap(),
            InsertOutcome::Inserted
        ));
        match store.insert_if_absent(record("acme", key, "h2")).await.unwrap() {
            InsertOutcome::Conflict(existing) => assert_eq!(existing.request_hash, "h1"),
            InsertOutcome::Inserted => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn test_same_key_distinct_tenants() {
        let store = InMemoryIdempotencyStore::new();
        let key = Uuid::new_v4();
        assert!(matches!(
            store.insert_if_absent(record("acme", key, "h")).await.unwrap(),
            InsertOutcome::Inserted
        ));
        assert!(matches!(
            store.insert_if_absent(record("globex", key, "h")).await.unwrap(),
            InsertOutcome::Inserted
        ));
    }

    #[tokio::test]
    async fn test_complete_updates_snapshot() {
        let store = InMemoryIdempotencyStore::new();
        let key = Uuid::new_v4();
        let tenant = TenantId::parse("acme").unwrap();
        store.insert_if_absent(record("acme", key, "h")).await.unwrap();
        store
            .complete(&tenant, key, serde_json::json!({"ok": true}), 200)
            .await
            .unwrap();
        let row = store.get(&tenant, key).await.unwrap().unwrap();
        assert_eq!(row.status, Some(200));
        assert_eq!(row.row_version, 1);
    }

    #[tokio::test]
    async fn test_sweep_respects_limit() {
        let store = InMemoryIdempotencyStore::new();
        for _ in 0..5 {
            let mut row = record("acme", Uuid::new_v4(), "h");
            row.expires_at = row.created_at + chrono::Duration::milliseconds(1);
            store.insert_if_absent(row).await.unwrap();
        }
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.sweep_expired(later, 3).await.unwrap(), 3);
        assert_eq!(store.sweep_expired(later, 3).await.unwrap(), 2);
        assert!(store.is_empty());
    }
}
