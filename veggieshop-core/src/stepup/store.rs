//! Step-up store SPIs and in-memory implementations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::tenant::TenantId;

use super::{ApprovalRequest, StepUpChallenge, StepUpTicket};

#[derive(Debug, Error)]
pub enum StepUpStoreError {
    #[error("step-up store unavailable: {0}")]
    Unavailable(String),
}

/// MFA challenge persistence
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn put(&self, challenge: StepUpChallenge) -> Result<(), StepUpStoreError>;

    async fn get(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<Option<StepUpChallenge>, StepUpStoreError>;

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<StepUpChallenge>, StepUpStoreError>;
}

/// Elevation ticket persistence
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn put(&self, ticket: StepUpTicket) -> Result<(), StepUpStoreError>;

    /// Most recent ticket with `issued_at <= now < expires_at`
    async fn find_active(
        &self,
        tenant: &TenantId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StepUpTicket>, StepUpStoreError>;

    /// Returns whether a ticket was revoked
    async fn revoke(&self, token: &str) -> Result<bool, StepUpStoreError>;
}

/// Two-person approval persistence
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn put(&self, request: ApprovalRequest) -> Result<(), StepUpStoreError>;

    async fn get(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<Option<ApprovalRequest>, StepUpStoreError>;

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        requester_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ApprovalRequest>, StepUpStoreError>;
}

/// Verifies MFA proofs; the concrete provider is an external collaborator
#[async_trait]
pub trait MfaProvider: Send + Sync {
    async fn verify(
        &self,
        tenant: &TenantId,
        user_id: &str,
        challenge_id: Uuid,
        proof: &str,
    ) -> Result<bool, StepUpStoreError>;
}

/// Accepts a fixed proof; for tests and local development
pub struct StaticMfaProvider {
    accepted_proof: String,
}

impl StaticMfaProvider {
    pub fn accepting(proof: impl Into<String>) -> Self {
        Self {
            accepted_proof: proof.into(),
        }
    }
}

#[async_trait]
impl MfaProvider for StaticMfaProvider {
    async fn verify(
        &self,
        _tenant: &TenantId,
        _user_id: &str,
        _challenge_id: Uuid,
        proof: &str,
    ) -> Result<bool, StepUpStoreError> {
        Ok(proof == self.accepted_proof)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryChallengeStore {
    rows: DashMap<(TenantId, Uuid), StepUpChallenge>,
}

impl InMemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn put(&self, challenge: StepUpChallenge) -> Result<(), StepUpStoreError> {
        self.rows
            .insert((challenge.tenant.clone(), challenge.id), challenge);
        Ok(())
    }

    async fn get(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<Option<StepUpChallenge>, StepUpStoreError> {
        Ok(self.rows.get(&(tenant.clone(), id)).map(|row| row.clone()))
    }

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<StepUpChallenge>, StepUpStoreError> {
        Ok(self
            .rows
            .iter()
            .find(|row| {
                &row.tenant == tenant
                    && row.user_id == user_id
                    && row.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .map(|row| row.clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    rows: DashMap<String, StepUpTicket>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn put(&self, ticket: StepUpTicket) -> Result<(), StepUpStoreError> {
        self.rows.insert(ticket.token.clone(), ticket);
        Ok(())
    }

    async fn find_active(
        &self,
        tenant: &TenantId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StepUpTicket>, StepUpStoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                &row.tenant == tenant && row.user_id == user_id && row.is_active_at(now)
            })
            .max_by_key(|row| row.expires_at)
            .map(|row| row.clone()))
    }

    async fn revoke(&self, token: &str) -> Result<bool, StepUpStoreError> {
        Ok(self.rows.remove(token).is_some())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryApprovalStore {
    rows: DashMap<(TenantId, Uuid), ApprovalRequest>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn put(&self, request: ApprovalRequest) -> Result<(), StepUpStoreError> {
        self.rows
            .insert((request.tenant.clone(), request.id), request);
        Ok(())
    }

    async fn get(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<Option<ApprovalRequest>, StepUpStoreError> {
        Ok(self.rows.get(&(tenant.clone(), id)).map(|row| row.clone()))
    }

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        requester_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ApprovalRequest>, StepUpStoreError> {
        Ok(self
            .rows
            .iter()
            .find(|row| {
                &row.tenant == tenant
                    && row.requester_id == requester_id
                    && row.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .map(|row| row.clone()))
    }
}
