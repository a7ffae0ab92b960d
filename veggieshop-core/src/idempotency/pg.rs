//! Postgres idempotency store
//!
//! Maps to the `idempotency` table: primary key `(tenant_id, key)` enforced
//! per partition, partitioned monthly by `created_at`, indexed on
//! `expires_at`. Partition DDL is operated outside the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::tenant::TenantId;

use super::{IdempotencyRecord, IdempotencyStore, IdempotencyStoreError, InsertOutcome};

pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, IdempotencyStoreError> {
        let tenant_raw: String = row
            .try_get("tenant_id")
            .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))?;
        let tenant_id = TenantId::parse(&tenant_raw)
            .map_err(|e| IdempotencyStoreError::Invariant(e.to_string()))?;
        let status: Option<i32> = row
            .try_get("status_code")
            .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))?;
        Ok(IdempotencyRecord {
            tenant_id,
            key: get(row, "key")?,
            request_hash: get(row, "request_hash")?,
            http_method: get(row, "http_method")?,
            http_path: get(row, "http_path")?,
            response_body: get(row, "response_json")?,
            status: status.map(|s| s as u16),
            created_at: get(row, "created_at")?,
            expires_at: get(row, "expires_at")?,
            row_version: get(row, "row_version")?,
        })
    }
}

fn get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T, IdempotencyStoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<InsertOutcome, IdempotencyStoreError> {
        record.check()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency
                (tenant_id, key, request_hash, http_method, http_path,
                 response_json, status_code, created_at, expires_at, row_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)
            ON CONFLICT (tenant_id, key) DO NOTHING
            "#,
        )
        .bind(record.tenant_id.as_str())
        .bind(record.key)
        .bind(&record.request_hash)
        .bind(&record.http_method)
        .bind(&record.http_path)
        .bind(&record.response_body)
        .bind(record.status.map(|s| s as i32))
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))?;

        if inserted.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        let existing = self
            .get(&record.tenant_id, record.key)
            .await?
            .ok_or_else(|| {
                IdempotencyStoreError::Unavailable(
                    "conflicting idempotency row vanished".to_string(),
                )
            })?;
        Ok(InsertOutcome::Conflict(existing))
    }

    async fn get(
        &self,
        tenant: &TenantId,
        key: Uuid,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, key, request_hash, http_method, http_path,
                   response_json, status_code, created_at, expires_at, row_version
            FROM idempotency
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn complete(
        &self,
        tenant: &TenantId,
        key: Uuid,
        response_body: serde_json::Value,
        status: u16,
    ) -> Result<(), IdempotencyStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency
            SET response_json = $3, status_code = $4, row_version = row_version + 1
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(key)
        .bind(response_body)
        .bind(status as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(IdempotencyStoreError::Invariant(format!(
                "no idempotency row for key {key}"
            )));
        }
        Ok(())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, IdempotencyStoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM idempotency
            WHERE (tenant_id, key) IN (
                SELECT tenant_id, key FROM idempotency
                WHERE expires_at < $1
                LIMIT $2
            )
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| IdempotencyStoreError::Unavailable(e.to_string()))?;
        Ok(deleted.rows_affected())
    }
}
