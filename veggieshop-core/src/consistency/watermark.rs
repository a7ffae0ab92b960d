//! Per-tenant monotonic watermark store

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::tenant::TenantId;

#[derive(Debug, Error)]
pub enum WatermarkStoreError {
    #[error("watermark store unavailable: {0}")]
    Unavailable(String),
}

/// Per-tenant monotonic epoch-millisecond watermark
///
/// The watermark never decreases: `advance_at_least` takes the max of the
/// current value and the provided one.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Current watermark; 0 when the tenant has never written
    async fn current(&self, tenant: &TenantId) -> Result<i64, WatermarkStoreError>;

    /// Advance to at least `watermark_ms`; returns the resulting watermark
    async fn advance_at_least(
        &self,
        tenant: &TenantId,
        watermark_ms: i64,
    ) -> Result<i64, WatermarkStoreError>;
}

/// In-memory store for tests, dev, and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    marks: DashMap<TenantId, AtomicI64>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn current(&self, tenant: &TenantId) -> Result<i64, WatermarkStoreError> {
        Ok(self
            .marks
            .get(tenant)
            .map(|mark| mark.load(Ordering::SeqCst))
            .unwrap_or(0))
    }

    async fn advance_at_least(
        &self,
        tenant: &TenantId,
        watermark_ms: i64,
    ) -> Result<i64, WatermarkStoreError> {
        let entry = self
            .marks
            .entry(tenant.clone())
            .or_insert_with(|| AtomicI64::new(0));
        let previous = entry.fetch_max(watermark_ms, Ordering::SeqCst);
        Ok(previous.max(watermark_ms))
    }
}
