//! Step-up authentication: MFA challenges, elevation tickets, two-person
//! approvals, break-glass

mod service;
mod store;

pub use service::{StepUpConfig, StepUpService};
pub use store::{
    ApprovalStore, ChallengeStore, InMemoryApprovalStore, InMemoryChallengeStore,
    InMemoryTicketStore, MfaProvider, StaticMfaProvider, StepUpStoreError, TicketStore,
};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MfaStrength {
    Weak,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeState {
    Pending,
    Consumed,
    Expired,
}

/// An open MFA challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpChallenge {
    pub id: Uuid,
    pub tenant: TenantId,
    pub user_id: String,
    pub strength: MfaStrength,
    pub reason: String,
    pub state: ChallengeState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    attributes: BTreeMap<String, String>,
}

impl StepUpChallenge {
    /// Attribute maps are defensively copied on the way in and out
    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.attributes.clone()
    }
}

/// A granted elevation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpTicket {
    /// Opaque server-side token
    pub token: String,
    pub tenant: TenantId,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// `mfa` or `break-glass`
    pub granted_by: String,
    attributes: BTreeMap<String, String>,
}

impl StepUpTicket {
    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.attributes.clone()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.issued_at <= now && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// A two-person approval request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub tenant: TenantId,
    pub requester_id: String,
    pub action: String,
    pub reason: String,
    pub required_approver_id: Option<String>,
    pub state: ApprovalState,
    pub decided_by: Option<String>,
    pub decision_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}
