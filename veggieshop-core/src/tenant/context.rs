//! Request-scoped tenant context
//!
//! The context is an explicit value threaded through the call graph rather
//! than ambient thread-local state. Fan-out captures the context (and its
//! tracing span, which mirrors the tenant to structured logs) and restores it
//! on the worker task.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::Instrument;

use crate::problem::{Problem, ProblemKind};

use super::TenantId;

/// The active tenant plus request correlation metadata
///
/// Cheap to clone; clone it into any task that continues work for the same
/// request.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant: TenantId,
    correlation_id: Option<String>,
    span: tracing::Span,
}

impl TenantContext {
    /// Open a context for `tenant`
    ///
    /// Creates the span that mirrors the (obfuscated) tenant into structured
    /// logs under `tenant_id`.
    pub fn open(tenant: TenantId) -> Self {
        let span = tracing::info_span!("tenant", tenant_id = %tenant.obfuscate());
        Self {
            tenant,
            correlation_id: None,
            span,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Run sync work inside the context's span
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }

    /// Capture the context for execution on another task
    ///
    /// The returned future carries the tenant span, so logs emitted by the
    /// child task keep the `tenant_id` field.
    pub fn wrap<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }

    /// Build a problem pre-populated with this context's tenant and correlation id
    pub fn problem(&self, kind: ProblemKind) -> Problem {
        let mut problem = Problem::new(kind).tenant(self.tenant.as_str());
        if let Some(ref id) = self.correlation_id {
            problem = problem.correlation_id(id.clone());
        }
        problem
    }
}

/// Require a context to be present, failing with `tenant-required` otherwise
pub fn require(context: Option<&TenantContext>) -> Result<&TenantContext, Problem> {
    context.ok_or_else(|| {
        Problem::with_detail(ProblemKind::TenantRequired, "No tenant context for request")
    })
}
