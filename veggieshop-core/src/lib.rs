//! # veggieshop-core
//!
//! Multi-tenant platform core for VeggieShop backend services: the
//! cross-cutting runtime that enforces tenant isolation, idempotency,
//! read-your-writes consistency, ABAC with step-up authorization, reliable
//! event production and consumption, and request-scoped rate limiting.
//!
//! ## Subsystems
//!
//! - **Tenant context & resolver**: validated [`tenant::TenantId`], explicit
//!   [`tenant::TenantContext`] propagation, carrier precedence resolution
//! - **Consistency engine**: per-tenant monotonic watermarks, signed
//!   consistency tokens, a read-your-writes gate
//! - **Idempotency & dedupe**: first-writer-wins request snapshots, event
//!   triplet acceptance with replay fences, fail-closed store semantics
//! - **Reliable events**: retrying trace-propagating producer, transactional
//!   outbox drain, consumer error classification with DLQ routing
//! - **ABAC + step-up**: gate-ordered permit/deny/challenge decisions, MFA
//!   challenges, elevation tickets, two-person approval, break-glass
//! - **Edge contracts**: RFC 7807 problems, RFC 9239 rate-limit headers,
//!   HMAC partner verification, audit hash chains
//!
//! Stores and transports are SPIs with in-memory defaults; durable Postgres
//! implementations live behind the `database` feature, Redis-backed caches
//! behind `cache`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use veggieshop_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Problem> {
//!     let config = PlatformConfig::load().expect("config loads");
//!     let clock: Arc<SystemClock> = Arc::new(SystemClock);
//!
//!     let engine = ConsistencyEngine::new(
//!         Arc::new(InMemoryWatermarkStore::new()),
//!         Arc::new(HmacTokenSigner::new("k1", b"secret".to_vec())),
//!         clock,
//!         config.consistency.clone(),
//!     );
//!
//!     let tenant = TenantId::parse("acme").expect("valid tenant");
//!     engine.advance_to_now(&tenant).await.map_err(|e| {
//!         Problem::with_detail(ProblemKind::DependencyUnavailable, e.to_string())
//!     })?;
//!     let token = engine.emit_token(&tenant, None).await.map_err(|e| {
//!         Problem::with_detail(ProblemKind::DependencyUnavailable, e.to_string())
//!     })?;
//!     println!("X-Consistency-Token: {token}");
//!     Ok(())
//! }
//! ```

pub mod abac;
pub mod audit;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod crypto;
pub mod dedupe;
pub mod events;
pub mod headers;
pub mod idempotency;
pub mod observability;
pub mod partnerauth;
pub mod problem;
pub mod ratelimit;
pub mod stepup;
pub mod tenant;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::abac::{
        AbacConfig, AbacDecision, AbacEngine, AbacRequest, Action, Effect, Environment, MfaLevel,
        Obligation, ObligationKind, ResourceRef, Role, Sensitivity, Subject,
    };
    pub use crate::audit::{
        AuditEvent, AuditHash, AuditMetadata, AuditMetadataDraft, AuditSink, TracingAuditSink,
    };
    pub use crate::clock::{ManualClock, MonotonicClock, SystemClock, WallClock};
    pub use crate::config::{ConfigError, PlatformConfig, ServiceConfig};
    pub use crate::consistency::{
        ConsistencyConfig, ConsistencyEngine, ConsistencyToken, GateOutcome, HmacTokenSigner,
        InMemoryWatermarkStore, RequestConsistency, TokenSigner, WatermarkStore,
    };
    pub use crate::dedupe::{
        DedupeConfig, DedupeOutcome, DedupeService, DedupeStore, InMemoryDedupeCache,
        InMemoryDedupeStore, ReplayPolicy, ReplayPolicyProvider, StaticReplayPolicyProvider,
    };
    pub use crate::events::{
        Backoff, ConsumerConfig, ConsumerErrorClass, ConsumerErrorHandler, ConsumerFailure,
        Disposition, EventTransport, InMemoryOutboxStore, NewOutboxRecord, OutboxConfig,
        OutboxDrain, OutboxHousekeeper, OutboxRecord, OutboxStatus, OutboxStore, ProducerConfig,
        PublishOptions, PublishReceipt, ReliableProducer, TransportError, TransportRecord,
    };
    pub use crate::headers::{
        attach_envelope, copy as copy_headers, is_safe_to_propagate,
        propagate_w3c_trace_context, Envelope, EventHeaders,
    };
    pub use crate::idempotency::{
        BeginOutcome, IdempotencyConfig, IdempotencyRecord, IdempotencyService, IdempotencyStore,
        InMemoryIdempotencyStore,
    };
    pub use crate::observability::init_tracing;
    pub use crate::partnerauth::{
        HmacConfig, HmacKey, HmacKeyResolver, HmacRequest, HmacVerifier, InMemoryNonceStore,
        NonceStore, PartnerIdentity, StaticHmacKeyResolver,
    };
    pub use crate::problem::{Problem, ProblemBody, ProblemKind};
    pub use crate::ratelimit::{
        RateLimitConfig, RateLimitDecision, RateLimitRequest, RatePolicy, TokenBucketLimiter,
    };
    pub use crate::stepup::{
        ApprovalRequest, ApprovalState, ChallengeState, MfaStrength, StepUpChallenge,
        StepUpConfig, StepUpService, StepUpTicket,
    };
    pub use crate::tenant::{
        ResolvedTenant, TenantCarriers, TenantContext, TenantId, TenantResolver,
        TenantResolverConfig, TenantSource,
    };

    #[cfg(feature = "database")]
    pub use crate::dedupe::PgDedupeStore;
    #[cfg(feature = "database")]
    pub use crate::events::PgOutboxStore;
    #[cfg(feature = "database")]
    pub use crate::idempotency::PgIdempotencyStore;

    #[cfg(feature = "cache")]
    pub use crate::dedupe::RedisDedupeCache;
    #[cfg(feature = "cache")]
    pub use crate::partnerauth::RedisNonceStore;
}
