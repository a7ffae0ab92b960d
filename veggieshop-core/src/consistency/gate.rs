//! Request consistency scope and the read-your-writes gate

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::WallClock;
use crate::problem::{Problem, ProblemKind};
use crate::tenant::TenantId;

use super::token::{self, ConsistencyToken, TokenSigner};
use super::watermark::{WatermarkStore, WatermarkStoreError};

/// Consistency engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Token validity window in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Allowed clock skew in seconds when validating token age
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    /// First read-your-writes poll sleep in milliseconds
    #[serde(default = "default_ryw_initial_poll_ms")]
    pub ryw_initial_poll_ms: u64,

    /// Poll sleep cap in milliseconds
    #[serde(default = "default_ryw_max_poll_ms")]
    pub ryw_max_poll_ms: u64,

    /// Total read-your-writes wait budget in milliseconds
    #[serde(default = "default_ryw_max_wait_ms")]
    pub ryw_max_wait_ms: u64,
}

fn default_token_ttl_secs() -> u64 {
    300
}
fn default_clock_skew_secs() -> u64 {
    30
}
fn default_ryw_initial_poll_ms() -> u64 {
    20
}
fn default_ryw_max_poll_ms() -> u64 {
    150
}
fn default_ryw_max_wait_ms() -> u64 {
    2_000
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            ryw_initial_poll_ms: default_ryw_initial_poll_ms(),
            ryw_max_poll_ms: default_ryw_max_poll_ms(),
            ryw_max_wait_ms: default_ryw_max_wait_ms(),
        }
    }
}

/// Per-request consistency scope
#[derive(Debug, Clone)]
pub struct RequestConsistency {
    tenant: TenantId,
    required_watermark: Option<i64>,
}

impl RequestConsistency {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Watermark the caller's reads must observe; 0 when no token was supplied
    pub fn required_watermark_or_zero(&self) -> i64 {
        self.required_watermark.unwrap_or(0)
    }
}

/// Result of waiting on the read-your-writes gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The watermark reached the required value in time
    Fresh,
    /// The wait budget elapsed with the watermark still short; the read may
    /// observe stale data
    Stale { current: i64, required: i64 },
}

impl GateOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    /// Map a stale outcome to `search-index-stale` for routes that fail
    /// rather than serve stale reads
    pub fn require_fresh(&self) -> Result<(), Problem> {
        match self {
            Self::Fresh => Ok(()),
            Self::Stale { current, required } => Err(Problem::with_detail(
                ProblemKind::SearchIndexStale,
                "Read-your-writes wait budget exhausted",
            )
            .extension("current-watermark", *current)
            .extension("required-watermark", *required)),
        }
    }
}

/// Watermarks plus token issue/verify plus the read gate
pub struct ConsistencyEngine {
    store: Arc<dyn WatermarkStore>,
    signer: Arc<dyn TokenSigner>,
    clock: Arc<dyn WallClock>,
    config: ConsistencyConfig,
}

impl ConsistencyEngine {
    pub fn new(
        store: Arc<dyn WatermarkStore>,
        signer: Arc<dyn TokenSigner>,
        clock: Arc<dyn WallClock>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            store,
            signer,
            clock,
            config,
        }
    }

    /// Current watermark for a tenant (0 when unknown)
    pub async fn current(&self, tenant: &TenantId) -> Result<i64, WatermarkStoreError> {
        self.store.current(tenant).await
    }

    pub async fn advance_at_least(
        &self,
        tenant: &TenantId,
        watermark_ms: i64,
    ) -> Result<i64, WatermarkStoreError> {
        self.store.advance_at_least(tenant, watermark_ms).await
    }

    /// Advance the tenant's watermark to the injected clock's now
    pub async fn advance_to_now(&self, tenant: &TenantId) -> Result<i64, WatermarkStoreError> {
        self.store
            .advance_at_least(tenant, self.clock.now_millis())
            .await
    }

    /// Open the consistency scope for a request
    ///
    /// Both tokens are parsed and verified; invalid or expired tokens are
    /// treated as absent. A valid `prior_token` seeds read-your-writes by
    /// advancing the watermark to at least its value.
    pub async fn open_request(
        &self,
        tenant: &TenantId,
        if_consistent_with: Option<&str>,
        prior_token: Option<&str>,
    ) -> Result<RequestConsistency, WatermarkStoreError> {
        let gate_token = if_consistent_with.and_then(|raw| self.verify_token(tenant, raw));
        let prior = prior_token.and_then(|raw| self.verify_token(tenant, raw));

        if let Some(prior) = prior {
            self.store
                .advance_at_least(tenant, prior.watermark_ms)
                .await?;
        }

        Ok(RequestConsistency {
            tenant: tenant.clone(),
            required_watermark: gate_token.map(|t| t.watermark_ms),
        })
    }

    /// Parse and validate a token for `tenant`; anything invalid is `None`
    pub fn verify_token(&self, tenant: &TenantId, raw: &str) -> Option<ConsistencyToken> {
        let parsed = match token::decode(raw, self.signer.as_ref()) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(error = %err, "discarding unverifiable consistency token");
                return None;
            }
        };
        if &parsed.tenant != tenant {
            tracing::debug!("discarding consistency token for another tenant");
            return None;
        }
        let age_ms = self.clock.now_millis() - parsed.issued_at_ms;
        let budget_ms = (self.config.token_ttl_secs + self.config.clock_skew_secs) as i64 * 1_000;
        if age_ms > budget_ms {
            tracing::debug!(age_ms, "discarding expired consistency token");
            return None;
        }
        Some(parsed)
    }

    /// Block until the tenant's watermark reaches `required`, within budget
    ///
    /// Sleeps exponentially from `ryw_initial_poll_ms` doubling up to
    /// `ryw_max_poll_ms`, rechecking after each sleep, until `ryw_max_wait_ms`
    /// has elapsed. Exhausting the budget yields `Stale`, not an error; the
    /// route decides whether stale reads surface.
    pub async fn await_watermark(
        &self,
        tenant: &TenantId,
        required: i64,
    ) -> Result<GateOutcome, WatermarkStoreError> {
        let mut current = self.store.current(tenant).await?;
        if current >= required {
            return Ok(GateOutcome::Fresh);
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.ryw_max_wait_ms);
        let mut poll = Duration::from_millis(self.config.ryw_initial_poll_ms.max(1));
        let max_poll = Duration::from_millis(self.config.ryw_max_poll_ms.max(1));

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(
                    tenant_id = %tenant.obfuscate(),
                    current,
                    required,
                    "read-your-writes wait exhausted"
                );
                return Ok(GateOutcome::Stale { current, required });
            }
            let sleep = poll.min(deadline - now);
            tokio::time::sleep(sleep).await;
            poll = (poll * 2).min(max_poll);

            current = self.store.current(tenant).await?;
            if current >= required {
                return Ok(GateOutcome::Fresh);
            }
        }
    }

    /// Gate a request scope's reads
    pub async fn gate(
        &self,
        scope: &RequestConsistency,
    ) -> Result<GateOutcome, WatermarkStoreError> {
        let required = scope.required_watermark_or_zero();
        if required == 0 {
            return Ok(GateOutcome::Fresh);
        }
        self.await_watermark(&scope.tenant, required).await
    }

    /// Issue a token bound to the tenant's current watermark
    pub async fn emit_token(
        &self,
        tenant: &TenantId,
        entity_version: Option<i64>,
    ) -> Result<String, WatermarkStoreError> {
        let watermark_ms = self.store.current(tenant).await?;
        let token = ConsistencyToken {
            tenant: tenant.clone(),
            issued_at_ms: self.clock.now_millis(),
            watermark_ms,
            entity_version,
        };
        Ok(token::encode(&token, self.signer.as_ref()))
    }
}
