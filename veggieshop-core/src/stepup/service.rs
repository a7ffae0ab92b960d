//! Step-up workflows
//!
//! Every state transition emits an audit event through the injected sink.
//! Audit payloads carry identifiers and codes only, never personal data.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Duration as ChronoDuration;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::clock::WallClock;
use crate::problem::{Problem, ProblemKind};
use crate::tenant::TenantId;

use super::store::{
    ApprovalStore, ChallengeStore, MfaProvider, StepUpStoreError, TicketStore,
};
use super::{
    ApprovalRequest, ApprovalState, ChallengeState, MfaStrength, StepUpChallenge, StepUpTicket,
};

/// Step-up tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUpConfig {
    /// Challenge lifetime in seconds
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,

    /// Elevation minutes are clamped to this floor
    #[serde(default = "default_min_elevation_minutes")]
    pub min_elevation_minutes: u32,

    /// Elevation minutes are clamped to this ceiling
    #[serde(default = "default_max_elevation_minutes")]
    pub max_elevation_minutes: u32,

    /// Approval request lifetime in seconds
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,
}

fn default_challenge_ttl_secs() -> u64 {
    300
}
fn default_min_elevation_minutes() -> u32 {
    15
}
fn default_max_elevation_minutes() -> u32 {
    60
}
fn default_approval_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for StepUpConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: default_challenge_ttl_secs(),
            min_elevation_minutes: default_min_elevation_minutes(),
            max_elevation_minutes: default_max_elevation_minutes(),
            approval_ttl_secs: default_approval_ttl_secs(),
        }
    }
}

const MIN_BREAK_GLASS_JUSTIFICATION: usize = 20;

pub struct StepUpService {
    challenges: Arc<dyn ChallengeStore>,
    tickets: Arc<dyn TicketStore>,
    approvals: Arc<dyn ApprovalStore>,
    mfa: Arc<dyn MfaProvider>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn WallClock>,
    config: StepUpConfig,
}

impl StepUpService {
    pub fn new(
        challenges: Arc<dyn ChallengeStore>,
        tickets: Arc<dyn TicketStore>,
        approvals: Arc<dyn ApprovalStore>,
        mfa: Arc<dyn MfaProvider>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn WallClock>,
        config: StepUpConfig,
    ) -> Self {
        Self {
            challenges,
            tickets,
            approvals,
            mfa,
            audit,
            clock,
            config,
        }
    }

    /// Open an MFA challenge
    ///
    /// With an idempotency key, an existing unexpired pending challenge for
    /// the same `(tenant, user, key)` is returned instead of a new one.
    pub async fn initiate_challenge(
        &self,
        tenant: &TenantId,
        user_id: &str,
        strength: MfaStrength,
        reason: &str,
        idempotency_key: Option<&str>,
        attributes: &BTreeMap<String, String>,
    ) -> Result<StepUpChallenge, Problem> {
        let now = self.clock.now();
        if let Some(key) = idempotency_key {
            if let Some(existing) = self
                .challenges
                .find_by_idempotency_key(tenant, user_id, key)
                .await
                .map_err(store_problem)?
            {
                if existing.state == ChallengeState::Pending && existing.expires_at > now {
                    return Ok(existing);
                }
            }
        }

        let challenge = StepUpChallenge {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            user_id: user_id.to_string(),
            strength,
            reason: reason.to_string(),
            state: ChallengeState::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.config.challenge_ttl_secs as i64),
            idempotency_key: idempotency_key.map(str::to_string),
            attributes: attributes.clone(),
        };
        self.challenges
            .put(challenge.clone())
            .await
            .map_err(store_problem)?;
        self.emit(
            tenant,
            user_id,
            "stepup.challenge.initiated",
            [("challenge-id", challenge.id.to_string())],
        );
        Ok(challenge)
    }

    /// Verify a challenge and grant an elevation ticket
    pub async fn verify_challenge(
        &self,
        tenant: &TenantId,
        user_id: &str,
        challenge_id: Uuid,
        proof: &str,
        requested_minutes: u32,
    ) -> Result<StepUpTicket, Problem> {
        let now = self.clock.now();
        let mut challenge = self
            .challenges
            .get(tenant, challenge_id)
            .await
            .map_err(store_problem)?
            .ok_or_else(|| {
                Problem::with_detail(ProblemKind::ResourceNotFound, "Unknown challenge")
            })?;

        if challenge.user_id != user_id {
            return Err(Problem::with_detail(
                ProblemKind::AuthorizationDenied,
                "Challenge belongs to another user",
            ));
        }
        if challenge.state == ChallengeState::Consumed {
            return Err(Problem::with_detail(
                ProblemKind::AuthenticationFailed,
                "Challenge already consumed",
            ));
        }
        if challenge.state == ChallengeState::Expired || challenge.expires_at <= now {
            if challenge.state == ChallengeState::Pending {
                challenge.state = ChallengeState::Expired;
                self.challenges
                    .put(challenge.clone())
                    .await
                    .map_err(store_problem)?;
            }
            return Err(Problem::with_detail(
                ProblemKind::AuthenticationFailed,
                "Challenge expired",
            ));
        }

        let verified = self
            .mfa
            .verify(tenant, user_id, challenge_id, proof)
            .await
            .map_err(store_problem)?;
        if !verified {
            self.emit(
                tenant,
                user_id,
                "stepup.challenge.failed",
                [("challenge-id", challenge_id.to_string())],
            );
            return Err(Problem::with_detail(
                ProblemKind::AuthenticationFailed,
                "MFA verification failed",
            ));
        }

        challenge.state = ChallengeState::Consumed;
        self.challenges
            .put(challenge.clone())
            .await
            .map_err(store_problem)?;

        let ticket = self
            .grant_ticket(tenant, user_id, requested_minutes, "mfa", &challenge.attributes)
            .await?;
        self.emit(
            tenant,
            user_id,
            "stepup.ticket.granted",
            [
                ("challenge-id", challenge_id.to_string()),
                ("granted-by", "mfa".to_string()),
            ],
        );
        Ok(ticket)
    }

    /// Active elevation for a user, when one exists
    pub async fn find_active_elevation(
        &self,
        tenant: &TenantId,
        user_id: &str,
    ) -> Result<Option<StepUpTicket>, Problem> {
        self.tickets
            .find_active(tenant, user_id, self.clock.now())
            .await
            .map_err(store_problem)
    }

    /// Revoke a ticket by its opaque token
    pub async fn revoke_ticket(&self, tenant: &TenantId, token: &str) -> Result<bool, Problem> {
        let revoked = self.tickets.revoke(token).await.map_err(store_problem)?;
        if revoked {
            self.emit(tenant, "-", "stepup.ticket.revoked", []);
        }
        Ok(revoked)
    }

    /// Open a two-person approval request; idempotent per key
    #[allow(clippy::too_many_arguments)]
    pub async fn request_approval(
        &self,
        tenant: &TenantId,
        requester_id: &str,
        action: &str,
        reason: &str,
        required_approver_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<ApprovalRequest, Problem> {
        if required_approver_id == Some(requester_id) {
            return Err(Problem::with_detail(
                ProblemKind::ValidationFailed,
                "Requester cannot be the required approver",
            ));
        }
        let now = self.clock.now();
        if let Some(key) = idempotency_key {
            if let Some(existing) = self
                .approvals
                .find_by_idempotency_key(tenant, requester_id, key)
                .await
                .map_err(store_problem)?
            {
                return Ok(existing);
            }
        }

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            requester_id: requester_id.to_string(),
            action: action.to_string(),
            reason: reason.to_string(),
            required_approver_id: required_approver_id.map(str::to_string),
            state: ApprovalState::Pending,
            decided_by: None,
            decision_comment: None,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.config.approval_ttl_secs as i64),
            idempotency_key: idempotency_key.map(str::to_string),
        };
        self.approvals
            .put(request.clone())
            .await
            .map_err(store_problem)?;
        self.emit(
            tenant,
            requester_id,
            "stepup.approval.requested",
            [
                ("approval-id", request.id.to_string()),
                ("action", action.to_string()),
            ],
        );
        Ok(request)
    }

    /// Decide an approval request
    ///
    /// Already-decided requests are returned unchanged; requesters cannot
    /// approve their own requests; expired requests flip to `Expired`.
    pub async fn approve_or_deny(
        &self,
        tenant: &TenantId,
        approval_id: Uuid,
        approver_id: &str,
        approve: bool,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, Problem> {
        let now = self.clock.now();
        let mut request = self
            .approvals
            .get(tenant, approval_id)
            .await
            .map_err(store_problem)?
            .ok_or_else(|| {
                Problem::with_detail(ProblemKind::ResourceNotFound, "Unknown approval request")
            })?;

        if request.state != ApprovalState::Pending {
            return Ok(request);
        }
        if request.requester_id == approver_id {
            return Err(Problem::with_detail(
                ProblemKind::AuthorizationDenied,
                "Requester cannot decide their own request",
            ));
        }
        if let Some(ref required) = request.required_approver_id {
            if required != approver_id {
                return Err(Problem::with_detail(
                    ProblemKind::AuthorizationDenied,
                    "A different approver is required",
                ));
            }
        }
        if request.expires_at <= now {
            request.state = ApprovalState::Expired;
            self.approvals
                .put(request.clone())
                .await
                .map_err(store_problem)?;
            return Ok(request);
        }

        request.state = if approve {
            ApprovalState::Approved
        } else {
            ApprovalState::Denied
        };
        request.decided_by = Some(approver_id.to_string());
        request.decision_comment = comment.map(str::to_string);
        self.approvals
            .put(request.clone())
            .await
            .map_err(store_problem)?;
        self.emit(
            tenant,
            approver_id,
            if approve {
                "stepup.approval.approved"
            } else {
                "stepup.approval.denied"
            },
            [("approval-id", approval_id.to_string())],
        );
        Ok(request)
    }

    /// Emergency elevation without a challenge, under strict audit
    pub async fn break_glass(
        &self,
        tenant: &TenantId,
        user_id: &str,
        justification: &str,
        requested_minutes: u32,
    ) -> Result<StepUpTicket, Problem> {
        if justification.trim().chars().count() < MIN_BREAK_GLASS_JUSTIFICATION {
            return Err(Problem::with_detail(
                ProblemKind::ValidationFailed,
                format!(
                    "Break-glass justification must be at least {MIN_BREAK_GLASS_JUSTIFICATION} characters"
                ),
            ));
        }
        let attributes: BTreeMap<String, String> =
            [("justification".to_string(), justification.trim().to_string())]
                .into_iter()
                .collect();
        let ticket = self
            .grant_ticket(tenant, user_id, requested_minutes, "break-glass", &attributes)
            .await?;
        self.emit(
            tenant,
            user_id,
            "stepup.breakglass.granted",
            [("justification", justification.trim().to_string())],
        );
        Ok(ticket)
    }

    async fn grant_ticket(
        &self,
        tenant: &TenantId,
        user_id: &str,
        requested_minutes: u32,
        granted_by: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<StepUpTicket, Problem> {
        let minutes = requested_minutes.clamp(
            self.config.min_elevation_minutes,
            self.config.max_elevation_minutes,
        );
        let now = self.clock.now();
        let ticket = StepUpTicket {
            token: opaque_token(),
            tenant: tenant.clone(),
            user_id: user_id.to_string(),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(minutes as i64),
            granted_by: granted_by.to_string(),
            attributes: attributes.clone(),
        };
        self.tickets
            .put(ticket.clone())
            .await
            .map_err(store_problem)?;
        Ok(ticket)
    }

    fn emit<const N: usize>(
        &self,
        tenant: &TenantId,
        actor: &str,
        event_type: &str,
        data: [(&str, String); N],
    ) {
        self.audit.emit(AuditEvent {
            tenant: tenant.clone(),
            actor: actor.to_string(),
            event_type: event_type.to_string(),
            data: data
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            at: self.clock.now(),
        });
    }
}

/// 32 random bytes, base64url
fn opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn store_problem(err: StepUpStoreError) -> Problem {
    Problem::with_detail(ProblemKind::DependencyUnavailable, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::clock::ManualClock;
    use crate::stepup::store::{
        InMemoryApprovalStore, InMemoryChallengeStore, InMemoryTicketStore, StaticMfaProvider,
    };

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    struct Fixture {
        service: StepUpService,
        audit: Arc<RecordingAuditSink>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(RecordingAuditSink::new());
        let clock = ManualClock::new(1_700_000_000_000);
        let service = StepUpService::new(
            Arc::new(InMemoryChallengeStore::new()),
            Arc::new(InMemoryTicketStore::new()),
            Arc::new(InMemoryApprovalStore::new()),
            Arc::new(StaticMfaProvider::accepting("123456")),
            audit.clone(),
            clock.clone(),
            StepUpConfig::default(),
        );
        Fixture {
            service,
            audit,
            clock,
        }
    }

    #[tokio::test]
    async fn test_challenge_lifecycle() {
        let f = fixture();
        let challenge = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "manage-secrets",
                None,
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(challenge.state, ChallengeState::Pending);

        let ticket = f
            .service
            .verify_challenge(&tenant(), "u1", challenge.id, "123456", 30)
            .await
            .unwrap();
        assert_eq!(ticket.granted_by, "mfa");
        assert!(ticket.is_active_at(f.clock.now()));

        // Consumed challenges cannot be replayed
        let err = f
            .service
            .verify_challenge(&tenant(), "u1", challenge.id, "123456", 30)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::AuthenticationFailed);

        assert_eq!(
            f.audit.event_types(),
            vec!["stepup.challenge.initiated", "stepup.ticket.granted"]
        );
    }

    #[tokio::test]
    async fn test_challenge_idempotency_key() {
        let f = fixture();
        let first = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "reason",
                Some("idem-1"),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        let second = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "reason",
                Some("idem-1"),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        // After expiry the same key opens a fresh challenge
        f.clock.advance_millis(301_000);
        let third = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "reason",
                Some("idem-1"),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn test_challenge_expiry() {
        let f = fixture();
        let challenge = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "reason",
                None,
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        f.clock.advance_millis(300_001);
        let err = f
            .service
            .verify_challenge(&tenant(), "u1", challenge.id, "123456", 30)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_wrong_proof_fails_and_audits() {
        let f = fixture();
        let challenge = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "reason",
                None,
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        let err = f
            .service
            .verify_challenge(&tenant(), "u1", challenge.id, "000000", 30)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::AuthenticationFailed);
        assert!(f
            .audit
            .event_types()
            .contains(&"stepup.challenge.failed".to_string()));
    }

    #[tokio::test]
    async fn test_elevation_minutes_clamped() {
        let f = fixture();
        let challenge = f
            .service
            .initiate_challenge(
                &tenant(),
                "u1",
                MfaStrength::Strong,
                "reason",
                None,
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        let ticket = f
            .service
            .verify_challenge(&tenant(), "u1", challenge.id, "123456", 500)
            .await
            .unwrap();
        let minutes = (ticket.expires_at - ticket.issued_at).num_minutes();
        assert_eq!(minutes, 60);
    }

    #[tokio::test]
    async fn test_find_active_and_revoke() {
        let f = fixture();
        let ticket = f
            .service
            .break_glass(&tenant(), "u1", "production incident INC-1234 mitigation", 30)
            .await
            .unwrap();

        let active = f
            .service
            .find_active_elevation(&tenant(), "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.token, ticket.token);
        assert_eq!(active.granted_by, "break-glass");

        assert!(f.service.revoke_ticket(&tenant(), &ticket.token).await.unwrap());
        assert!(f
            .service
            .find_active_elevation(&tenant(), "u1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_break_glass_requires_justification() {
        let f = fixture();
        let err = f
            .service
            .break_glass(&tenant(), "u1", "too short", 30)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_break_glass_ticket_carries_justification() {
        let f = fixture();
        let ticket = f
            .service
            .break_glass(&tenant(), "u1", "production incident INC-1234 mitigation", 30)
            .await
            .unwrap();
        assert_eq!(
            ticket.attributes()["justification"],
            "production incident INC-1234 mitigation"
        );
    }

    #[tokio::test]
    async fn test_approval_flow() {
        let f = fixture();
        let request = f
            .service
            .request_approval(
                &tenant(),
                "u1",
                "price-override",
                "vendor discount",
                Some("u2"),
                Some("idem-a"),
            )
            .await
            .unwrap();
        assert_eq!(request.state, ApprovalState::Pending);

        // Idempotent re-request
        let again = f
            .service
            .request_approval(
                &tenant(),
                "u1",
                "price-override",
                "vendor discount",
                Some("u2"),
                Some("idem-a"),
            )
            .await
            .unwrap();
        assert_eq!(request.id, again.id);

        // Requester cannot self-approve
        let err = f
            .service
            .approve_or_deny(&tenant(), request.id, "u1", true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::AuthorizationDenied);

        // Wrong approver when one is required
        let err = f
            .service
            .approve_or_deny(&tenant(), request.id, "u3", true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::AuthorizationDenied);

        let decided = f
            .service
            .approve_or_deny(&tenant(), request.id, "u2", true, Some("approved"))
            .await
            .unwrap();
        assert_eq!(decided.state, ApprovalState::Approved);
        assert_eq!(decided.decided_by.as_deref(), Some("u2"));

        // Deciding again returns the decision unchanged
        let repeat = f
            .service
            .approve_or_deny(&tenant(), request.id, "u2", false, None)
            .await
            .unwrap();
        assert_eq!(repeat.state, ApprovalState::Approved);
    }

    #[tokio::test]
    async fn test_approval_expiry() {
        let f = fixture();
        let request = f
            .service
            .request_approval(&tenant(), "u1", "export", "audit export", None, None)
            .await
            .unwrap();
        f.clock.advance_millis(24 * 3600 * 1000 + 1);
        let expired = f
            .service
            .approve_or_deny(&tenant(), request.id, "u2", true, None)
            .await
            .unwrap();
        assert_eq!(expired.state, ApprovalState::Expired);
    }

    #[tokio::test]
    async fn test_requester_cannot_be_required_approver() {
        let f = fixture();
        let err = f
            .service
            .request_approval(&tenant(), "u1", "export", "reason", Some("u1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::ValidationFailed);
    }
}
