//! ABAC request and decision types

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Vendor,
    Buyer,
    Support,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    ApprovePriceOverride,
    ManageSecrets,
    ExportPii,
    ManageTenantConfig,
}

impl Action {
    /// Anything that is not a plain read mutates state
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MfaLevel {
    None,
    Weak,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
    RestrictedPii,
}

/// The authenticated caller
#[derive(Debug, Clone)]
pub struct Subject {
    pub user_id: String,
    pub tenant_id: TenantId,
    pub roles: BTreeSet<Role>,
    pub vendor_id: Option<String>,
    pub mfa_level: MfaLevel,
    /// End of an active elevation window, when one exists
    pub elevation_until: Option<DateTime<Utc>>,
}

impl Subject {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// The resource being acted on
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub tenant_id: TenantId,
    pub vendor_owner_id: Option<String>,
    pub sensitivity: Sensitivity,
    pub resource_type: String,
}

/// Request environment signals
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Clamped to 0..=100 at evaluation
    pub risk_score: i32,
    pub break_glass: bool,
    pub second_approver: Option<String>,
}

/// One authorization question
#[derive(Debug, Clone)]
pub struct AbacRequest {
    pub tenant_id: Option<TenantId>,
    pub subject: Subject,
    pub action: Action,
    pub resource: Option<ResourceRef>,
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Effect {
    Permit,
    Deny,
    Challenge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObligationKind {
    RequireMfa,
    RequireTwoPerson,
    RequireElevation,
}

/// Something the caller must satisfy before the action can proceed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    pub kind: ObligationKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Obligation {
    pub fn require_mfa(strength: &str) -> Self {
        Self {
            kind: ObligationKind::RequireMfa,
            params: [("strength".to_string(), strength.to_string())]
                .into_iter()
                .collect(),
        }
    }

    pub fn require_two_person() -> Self {
        Self {
            kind: ObligationKind::RequireTwoPerson,
            params: BTreeMap::new(),
        }
    }

    pub fn require_elevation() -> Self {
        Self {
            kind: ObligationKind::RequireElevation,
            params: BTreeMap::new(),
        }
    }
}

/// The engine's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbacDecision {
    pub effect: Effect,
    pub reason: String,
    pub obligations: Vec<Obligation>,
}

impl AbacDecision {
    pub fn permit() -> Self {
        Self {
            effect: Effect::Permit,
            reason: "Permitted".to_string(),
            obligations: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            effect: Effect::Deny,
            reason: reason.into(),
            obligations: Vec::new(),
        }
    }

    pub fn challenge(reason: impl Into<String>, obligation: Obligation) -> Self {
        Self {
            effect: Effect::Challenge,
            reason: reason.into(),
            obligations: vec![obligation],
        }
    }

    pub fn is_permit(&self) -> bool {
        self.effect == Effect::Permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_write_classification() {
        assert!(!Action::Read.is_write());
        for action in [
            Action::Create,
            Action::Update,
            Action::Delete,
            Action::ApprovePriceOverride,
            Action::ManageSecrets,
            Action::ExportPii,
            Action::ManageTenantConfig,
        ] {
            assert!(action.is_write(), "{action:?}");
        }
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&Action::ApprovePriceOverride).unwrap(),
            "\"APPROVE_PRICE_OVERRIDE\""
        );
        assert_eq!(
            serde_json::to_string(&Sensitivity::RestrictedPii).unwrap(),
            "\"RESTRICTED_PII\""
        );
        assert_eq!(
            serde_json::to_string(&ObligationKind::RequireMfa).unwrap(),
            "\"REQUIRE_MFA\""
        );
    }

    #[test]
    fn test_obligation_constructors() {
        let mfa = Obligation::require_mfa("strong");
        assert_eq!(mfa.kind, ObligationKind::RequireMfa);
        assert_eq!(mfa.params["strength"], "strong");
        assert!(Obligation::require_two_person().params.is_empty());
    }
}
