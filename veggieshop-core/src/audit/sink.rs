//! Audit event sink
//!
//! Authorization and step-up decisions emit audit events through an injected
//! sink. Payloads are small string maps and must stay PII-free; callers put
//! identifiers, never personal data, in `data`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::tenant::TenantId;

/// One audit event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub tenant: TenantId,
    pub actor: String,
    pub event_type: String,
    pub data: BTreeMap<String, String>,
    pub at: DateTime<Utc>,
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Default sink: structured log line under the `veggieshop::audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "veggieshop::audit",
            tenant_id = %event.tenant.obfuscate(),
            actor = %event.actor,
            event_type = %event.event_type,
            at = %event.at.to_rfc3339(),
            data = ?event.data,
            "audit"
        );
    }
}

/// Capturing sink for tests and local development
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink lock").clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink lock").push(event);
    }
}
