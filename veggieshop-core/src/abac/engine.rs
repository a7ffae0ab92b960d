//! Gate-ordered ABAC evaluation
//!
//! Gates run in a fixed order and the first matching gate decides:
//! tenant isolation, coarse RBAC, vendor ownership, sensitivity, action risk,
//! environment risk, elevation, support read-only, then permit.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::WallClock;

use super::types::{
    AbacDecision, AbacRequest, Action, MfaLevel, Obligation, Role, Sensitivity, Subject,
};

/// Intrinsic risk of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionRisk {
    Low,
    Medium,
    High,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbacConfig {
    /// Risk score at or above which a challenge is raised without strong MFA
    #[serde(default = "default_environment_risk_mfa_threshold")]
    pub environment_risk_mfa_threshold: i32,

    /// Overrides of the built-in action risk map
    #[serde(default)]
    pub action_risk_overrides: HashMap<Action, ActionRisk>,
}

fn default_environment_risk_mfa_threshold() -> i32 {
    70
}

impl Default for AbacConfig {
    fn default() -> Self {
        Self {
            environment_risk_mfa_threshold: default_environment_risk_mfa_threshold(),
            action_risk_overrides: HashMap::new(),
        }
    }
}

impl AbacConfig {
    fn action_risk(&self, action: Action) -> ActionRisk {
        if let Some(risk) = self.action_risk_overrides.get(&action) {
            return *risk;
        }
        match action {
            Action::ManageSecrets | Action::ExportPii | Action::ApprovePriceOverride => {
                ActionRisk::High
            }
            Action::Delete | Action::ManageTenantConfig => ActionRisk::Medium,
            Action::Read | Action::Create | Action::Update => ActionRisk::Low,
        }
    }
}

/// Actions that additionally require an active elevation window
const ELEVATION_GATED: &[Action] = &[
    Action::ManageSecrets,
    Action::ManageTenantConfig,
    Action::ApprovePriceOverride,
];

pub struct AbacEngine {
    config: AbacConfig,
    clock: Arc<dyn WallClock>,
}

impl AbacEngine {
    pub fn new(config: AbacConfig, clock: Arc<dyn WallClock>) -> Self {
        Self { config, clock }
    }

    /// Evaluate one request; the first matching gate decides
    pub fn authorize(&self, request: &AbacRequest) -> AbacDecision {
        let decision = self.evaluate(request);
        tracing::debug!(
            action = ?request.action,
            effect = ?decision.effect,
            reason = decision.reason.as_str(),
            "abac decision"
        );
        decision
    }

    fn evaluate(&self, request: &AbacRequest) -> AbacDecision {
        let subject = &request.subject;
        let strong_mfa = self.has_strong_mfa(subject);
        let break_glass = request.environment.break_glass;

        // 1. Tenant isolation
        let tenant = match request.tenant_id {
            Some(ref tenant) => tenant,
            None => return AbacDecision::deny("Missing tenant context"),
        };
        if &subject.tenant_id != tenant {
            return AbacDecision::deny("Tenant mismatch");
        }
        if let Some(ref resource) = request.resource {
            if &resource.tenant_id != tenant {
                return AbacDecision::deny("Resource not in caller tenant");
            }
        }

        // 2. Coarse RBAC
        if !subject.has_role(Role::Admin) {
            let allowed = match request.action {
                Action::Read => {
                    subject.has_role(Role::Buyer)
                        || subject.has_role(Role::Vendor)
                        || subject.has_role(Role::Support)
                }
                Action::Create | Action::Update => subject.has_role(Role::Vendor),
                Action::Delete
                | Action::ApprovePriceOverride
                | Action::ManageSecrets
                | Action::ExportPii
                | Action::ManageTenantConfig => false,
            };
            if !allowed {
                return AbacDecision::deny("Role not permitted for action");
            }
        }

        // 3. Vendor ownership
        if let Some(ref resource) = request.resource {
            if let Some(ref owner) = resource.vendor_owner_id {
                if !subject.has_role(Role::Admin)
                    && subject.vendor_id.as_deref() != Some(owner.as_str())
                {
                    return AbacDecision::deny("Resource owned by another vendor");
                }
            }
        }

        // 4. Sensitivity
        if let Some(ref resource) = request.resource {
            match resource.sensitivity {
                Sensitivity::RestrictedPii => {
                    if !subject.has_role(Role::Admin) {
                        return AbacDecision::deny("Restricted data requires ADMIN");
                    }
                    if !strong_mfa {
                        return AbacDecision::challenge(
                            "Restricted data requires strong MFA",
                            Obligation::require_mfa("strong"),
                        );
                    }
                }
                Sensitivity::Confidential if request.action.is_write() => {
                    if !subject.has_role(Role::Admin) {
                        return AbacDecision::deny("Confidential writes require ADMIN");
                    }
                    if !strong_mfa {
                        return AbacDecision::challenge(
                            "Confidential writes require strong MFA",
                            Obligation::require_mfa("strong"),
                        );
                    }
                }
                _ => {}
            }
        }

        // 5. Action risk
        let risk = self.config.action_risk(request.action);
        if risk >= ActionRisk::Medium && !break_glass {
            if !strong_mfa {
                return AbacDecision::challenge(
                    "High-risk action requires strong MFA",
                    Obligation::require_mfa("strong"),
                );
            }
            if risk == ActionRisk::High {
                if !subject.has_role(Role::Admin) {
                    return AbacDecision::deny("High-risk action requires ADMIN");
                }
                match request.environment.second_approver {
                    None => {
                        return AbacDecision::challenge(
                            "High-risk action requires a second approver",
                            Obligation::require_two_person(),
                        )
                    }
                    Some(ref approver) if approver == &subject.user_id => {
                        return AbacDecision::deny("Approver must differ from subject");
                    }
                    Some(_) => {}
                }
            }
        }

        // 6. Environment risk
        let risk_score = request.environment.risk_score.clamp(0, 100);
        if risk_score >= self.config.environment_risk_mfa_threshold
            && !break_glass
            && !strong_mfa
        {
            return AbacDecision::challenge(
                "Environment risk requires strong MFA",
                Obligation::require_mfa("strong"),
            );
        }

        // 7. Elevation
        if ELEVATION_GATED.contains(&request.action) && !self.has_active_elevation(subject) {
            return AbacDecision::challenge(
                "Action requires an active elevation window",
                Obligation::require_elevation(),
            );
        }

        // 8. Support is read-only
        if subject.has_role(Role::Support)
            && !subject.has_role(Role::Admin)
            && request.action.is_write()
        {
            return AbacDecision::deny("Support role is read-only");
        }

        // 9. Default
        AbacDecision::permit()
    }

    fn has_strong_mfa(&self, subject: &Subject) -> bool {
        subject.mfa_level == MfaLevel::Strong || self.has_active_elevation(subject)
    }

    fn has_active_elevation(&self, subject: &Subject) -> bool {
        subject
            .elevation_until
            .map(|until| until.timestamp_millis() > self.clock.now_millis())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abac::types::{Effect, Environment, ObligationKind, ResourceRef};
    use crate::clock::ManualClock;
    use crate::tenant::TenantId;
    use std::collections::BTreeSet;

    const NOW: i64 = 1_700_000_000_000;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn engine() -> AbacEngine {
        AbacEngine::new(AbacConfig::default(), ManualClock::new(NOW))
    }

    fn subject(roles: &[Role], mfa: MfaLevel) -> Subject {
        Subject {
            user_id: "u1".to_string(),
            tenant_id: tenant(),
            roles: roles.iter().copied().collect::<BTreeSet<_>>(),
            vendor_id: Some("v1".to_string()),
            mfa_level: mfa,
            elevation_until: None,
        }
    }

    fn resource(sensitivity: Sensitivity) -> ResourceRef {
        ResourceRef {
            tenant_id: tenant(),
            vendor_owner_id: Some("v1".to_string()),
            sensitivity,
            resource_type: "order".to_string(),
        }
    }

    fn request(subject: Subject, action: Action, resource: Option<ResourceRef>) -> AbacRequest {
        AbacRequest {
            tenant_id: Some(tenant()),
            subject,
            action,
            resource,
            environment: Environment::default(),
        }
    }

    #[test]
    fn test_missing_tenant_denied() {
        let mut req = request(subject(&[Role::Admin], MfaLevel::Strong), Action::Read, None);
        req.tenant_id = None;
        let decision = engine().authorize(&req);
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.reason, "Missing tenant context");
    }

    #[test]
    fn test_cross_tenant_subject_denied() {
        let mut sub = subject(&[Role::Admin], MfaLevel::Strong);
        sub.tenant_id = TenantId::parse("globex").unwrap();
        let decision = engine().authorize(&request(sub, Action::Read, None));
        assert_eq!(decision.reason, "Tenant mismatch");
    }

    #[test]
    fn test_cross_tenant_resource_denied() {
        let mut res = resource(Sensitivity::Internal);
        res.tenant_id = TenantId::parse("globex").unwrap();
        let decision = engine().authorize(&request(
            subject(&[Role::Admin], MfaLevel::Strong),
            Action::Read,
            Some(res),
        ));
        assert_eq!(decision.reason, "Resource not in caller tenant");
    }

    #[test]
    fn test_rbac_matrix() {
        let engine = engine();
        // Buyer can read, cannot create
        let decision = engine.authorize(&request(
            subject(&[Role::Buyer], MfaLevel::Weak),
            Action::Read,
            Some(resource(Sensitivity::Public)),
        ));
        assert!(decision.is_permit());
        let decision = engine.authorize(&request(
            subject(&[Role::Buyer], MfaLevel::Weak),
            Action::Create,
            None,
        ));
        assert_eq!(decision.reason, "Role not permitted for action");

        // Vendor can update
        let decision = engine.authorize(&request(
            subject(&[Role::Vendor], MfaLevel::Weak),
            Action::Update,
            Some(resource(Sensitivity::Internal)),
        ));
        assert!(decision.is_permit());

        // Delete requires admin
        let decision = engine.authorize(&request(
            subject(&[Role::Vendor], MfaLevel::Strong),
            Action::Delete,
            None,
        ));
        assert_eq!(decision.reason, "Role not permitted for action");
    }

    #[test]
    fn test_vendor_ownership() {
        let engine = engine();
        let mut res = resource(Sensitivity::Internal);
        res.vendor_owner_id = Some("v2".to_string());
        let decision = engine.authorize(&request(
            subject(&[Role::Vendor], MfaLevel::Weak),
            Action::Update,
            Some(res.clone()),
        ));
        assert_eq!(decision.reason, "Resource owned by another vendor");

        // Admin bypasses ownership
        let decision = engine.authorize(&request(
            subject(&[Role::Admin], MfaLevel::Strong),
            Action::Read,
            Some(res),
        ));
        assert!(decision.is_permit());
    }

    #[test]
    fn test_confidential_write_scenarios() {
        let engine = engine();
        // Vendor with weak MFA on an owned confidential resource: deny
        let decision = engine.authorize(&request(
            subject(&[Role::Vendor], MfaLevel::Weak),
            Action::Update,
            Some(resource(Sensitivity::Confidential)),
        ));
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.reason, "Confidential writes require ADMIN");

        // Admin with weak MFA: challenge for strong MFA
        let decision = engine.authorize(&request(
            subject(&[Role::Admin], MfaLevel::Weak),
            Action::Update,
            Some(resource(Sensitivity::Confidential)),
        ));
        assert_eq!(decision.effect, Effect::Challenge);
        assert_eq!(decision.obligations[0].kind, ObligationKind::RequireMfa);
        assert_eq!(decision.obligations[0].params["strength"], "strong");

        // Confidential reads are not write-gated
        let decision = engine.authorize(&request(
            subject(&[Role::Vendor], MfaLevel::Weak),
            Action::Read,
            Some(resource(Sensitivity::Confidential)),
        ));
        assert!(decision.is_permit());
    }

    #[test]
    fn test_restricted_pii() {
        let engine = engine();
        let decision = engine.authorize(&request(
            subject(&[Role::Vendor], MfaLevel::Strong),
            Action::Read,
            Some(resource(Sensitivity::RestrictedPii)),
        ));
        assert_eq!(decision.reason, "Restricted data requires ADMIN");

        let decision = engine.authorize(&request(
            subject(&[Role::Admin], MfaLevel::Weak),
            Action::Read,
            Some(resource(Sensitivity::RestrictedPii)),
        ));
        assert_eq!(decision.effect, Effect::Challenge);
        assert_eq!(decision.obligations[0].kind, ObligationKind::RequireMfa);
    }

    #[test]
    fn test_high_risk_two_person() {
        let engine = engine();
        let sub = subject(&[Role::Admin], MfaLevel::Strong);

        // Missing approver: challenge (elevation also required later, but the
        // two-person gate fires first)
        let mut req = request(sub.clone(), Action::ManageSecrets, None);
        let decision = engine.authorize(&req);
        assert_eq!(decision.effect, Effect::Challenge);
        assert_eq!(
            decision.obligations[0].kind,
            ObligationKind::RequireTwoPerson
        );

        // Self-approval: deny
        req.environment.second_approver = Some("u1".to_string());
        let decision = engine.authorize(&req);
        assert_eq!(decision.reason, "Approver must differ from subject");

        // Distinct approver plus elevation: permit
        req.environment.second_approver = Some("u2".to_string());
        req.subject.elevation_until =
            Some(chrono::DateTime::from_timestamp_millis(NOW + 60_000).unwrap());
        let decision = engine.authorize(&req);
        assert!(decision.is_permit());
    }

    #[test]
    fn test_medium_risk_requires_strong_mfa() {
        let engine = engine();
        let decision = engine.authorize(&request(
            subject(&[Role::Admin], MfaLevel::Weak),
            Action::Delete,
            None,
        ));
        assert_eq!(decision.effect, Effect::Challenge);
        assert_eq!(decision.obligations[0].kind, ObligationKind::RequireMfa);

        // Break-glass bypasses the action risk gate
        let mut req = request(subject(&[Role::Admin], MfaLevel::Weak), Action::Delete, None);
        req.environment.break_glass = true;
        assert!(engine.authorize(&req).is_permit());
    }

    #[test]
    fn test_environment_risk_gate() {
        let engine = engine();
        let mut req = request(subject(&[Role::Vendor], MfaLevel::Weak), Action::Read, None);
        req.environment.risk_score = 85;
        let decision = engine.authorize(&req);
        assert_eq!(decision.effect, Effect::Challenge);

        // Out-of-range scores clamp into 0..=100
        req.environment.risk_score = 1_000;
        assert_eq!(engine.authorize(&req).effect, Effect::Challenge);

        req.environment.risk_score = 30;
        assert!(engine.authorize(&req).is_permit());
    }

    #[test]
    fn test_elevation_gate() {
        let engine = engine();
        let mut req = request(
            subject(&[Role::Admin], MfaLevel::Strong),
            Action::ManageTenantConfig,
            None,
        );
        let decision = engine.authorize(&req);
        assert_eq!(decision.effect, Effect::Challenge);
        assert_eq!(
            decision.obligations[0].kind,
            ObligationKind::RequireElevation
        );

        // Expired elevation does not count
        req.subject.elevation_until =
            Some(chrono::DateTime::from_timestamp_millis(NOW - 1).unwrap());
        assert_eq!(engine.authorize(&req).effect, Effect::Challenge);

        req.subject.elevation_until =
            Some(chrono::DateTime::from_timestamp_millis(NOW + 60_000).unwrap());
        assert!(engine.authorize(&req).is_permit());
    }

    #[test]
    fn test_elevation_satisfies_strong_mfa() {
        let engine = engine();
        let mut sub = subject(&[Role::Admin], MfaLevel::Weak);
        sub.elevation_until = Some(chrono::DateTime::from_timestamp_millis(NOW + 60_000).unwrap());
        let decision = engine.authorize(&request(
            sub,
            Action::Update,
            Some(resource(Sensitivity::Confidential)),
        ));
        assert!(decision.is_permit());
    }

    #[test]
    fn test_support_read_only() {
        let engine = engine();
        // Support who is also a vendor passes RBAC for update, but gate 8 denies
        let decision = engine.authorize(&request(
            subject(&[Role::Support, Role::Vendor], MfaLevel::Strong),
            Action::Update,
            Some(resource(Sensitivity::Internal)),
        ));
        assert_eq!(decision.reason, "Support role is read-only");

        let decision = engine.authorize(&request(
            subject(&[Role::Support], MfaLevel::Weak),
            Action::Read,
            Some(resource(Sensitivity::Internal)),
        ));
        assert!(decision.is_permit());
    }
}
