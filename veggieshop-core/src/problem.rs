//! RFC 7807 problem model
//!
//! A stable, process-wide taxonomy of failure kinds. Every error the platform
//! surfaces to a caller renders as `application/problem+json` with a stable
//! `type` URI. Kinds in the 4xx range log at `warn` without backtrace capture;
//! 5xx kinds log at `error`.

use std::collections::BTreeMap;
use std::fmt;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{header, HeaderName, HeaderValue, StatusCode};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Host under which problem type URIs are published
pub const PROBLEM_HOST: &str = "problems.veggieshop.io";

/// Maximum length of a string extension value before truncation
const MAX_EXTENSION_LEN: usize = 512;

/// Maximum length of a detail message before sanitization truncates it
const MAX_DETAIL_LEN: usize = 256;

/// The fixed taxonomy of failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProblemKind {
    ValidationFailed,
    UnsupportedMediaType,
    PayloadTooLarge,
    TenantRequired,
    TenantMismatch,
    AuthenticationFailed,
    AuthorizationDenied,
    StepUpRequired,
    HmacSignatureInvalid,
    JwtInvalid,
    SchemaValidationFailed,
    EndpointSunset,
    ConsistencyPreconditionFailed,
    ConsistencyTokenRequired,
    IdempotencyKeyConflict,
    IdempotencyReplayRejected,
    ResourceNotFound,
    Conflict,
    TransactionSerializationFailure,
    TransactionTimeout,
    RateLimited,
    QuotaExceeded,
    DependencyUnavailable,
    DependencyTimeout,
    SearchIndexStale,
    PaymentScaRequired,
    PaymentAuthorizationDeclined,
    PaymentCaptureFailed,
    WebhookSignatureInvalid,
    WebhookReplayDetected,
    InternalError,
}

/// Static description of a problem kind: slug, title, default status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemType {
    pub slug: &'static str,
    pub title: &'static str,
    pub status: u16,
}

impl ProblemType {
    /// Stable type URI: `https://problems.<host>/<slug>`
    pub fn uri(&self) -> String {
        format!("https://{}/{}", PROBLEM_HOST, self.slug)
    }
}

impl ProblemKind {
    /// All kinds, in registry order
    pub const ALL: &'static [ProblemKind] = &[
        Self::ValidationFailed,
        Self::UnsupportedMediaType,
        Self::PayloadTooLarge,
        Self::TenantRequired,
        Self::TenantMismatch,
        Self::AuthenticationFailed,
        Self::AuthorizationDenied,
        Self::StepUpRequired,
        Self::HmacSignatureInvalid,
        Self::JwtInvalid,
        Self::SchemaValidationFailed,
        Self::EndpointSunset,
        Self::ConsistencyPreconditionFailed,
        Self::ConsistencyTokenRequired,
        Self::IdempotencyKeyConflict,
        Self::IdempotencyReplayRejected,
        Self::ResourceNotFound,
        Self::Conflict,
        Self::TransactionSerializationFailure,
        Self::TransactionTimeout,
        Self::RateLimited,
        Self::QuotaExceeded,
        Self::DependencyUnavailable,
        Self::DependencyTimeout,
        Self::SearchIndexStale,
        Self::PaymentScaRequired,
        Self::PaymentAuthorizationDeclined,
        Self::PaymentCaptureFailed,
        Self::WebhookSignatureInvalid,
        Self::WebhookReplayDetected,
        Self::InternalError,
    ];

    pub fn descriptor(&self) -> &'static ProblemType {
        match self {
            Self::ValidationFailed => &ProblemType {
                slug: "validation-failed",
                title: "Request validation failed",
                status: 400,
            },
            Self::UnsupportedMediaType => &ProblemType {
                slug: "unsupported-media-type",
                title: "Unsupported media type",
                status: 415,
            },
            Self::PayloadTooLarge => &ProblemType {
                slug: "payload-too-large",
                title: "Payload too large",
                status: 413,
            },
            Self::TenantRequired => &ProblemType {
                slug: "tenant-required",
                title: "Tenant context is required",
                status: 400,
            },
            Self::TenantMismatch => &ProblemType {
                slug: "tenant-mismatch",
                title: "Tenant carriers disagree",
                status: 403,
            },
            Self::AuthenticationFailed => &ProblemType {
                slug: "authentication-failed",
                title: "Authentication failed",
                status: 401,
            },
            Self::AuthorizationDenied => &ProblemType {
                slug: "authorization-denied",
                title: "Authorization denied",
                status: 403,
            },
            Self::StepUpRequired => &ProblemType {
                slug: "step-up-required",
                title: "Step-up authentication required",
                status: 403,
            },
            Self::HmacSignatureInvalid => &ProblemType {
                slug: "hmac-signature-invalid",
                title: "HMAC signature invalid",
                status: 401,
            },
            Self::JwtInvalid => &ProblemType {
                slug: "jwt-invalid",
                title: "JWT invalid",
                status: 401,
            },
            Self::SchemaValidationFailed => &ProblemType {
                slug: "schema-validation-failed",
                title: "Schema validation failed",
                status: 422,
            },
            Self::EndpointSunset => &ProblemType {
                slug: "endpoint-sunset",
                title: "Endpoint has been sunset",
                status: 410,
            },
            Self::ConsistencyPreconditionFailed => &ProblemType {
                slug: "consistency-precondition-failed",
                title: "Consistency precondition failed",
                status: 412,
            },
            Self::ConsistencyTokenRequired => &ProblemType {
                slug: "consistency-token-required",
                title: "Consistency token required",
                status: 428,
            },
            Self::IdempotencyKeyConflict => &ProblemType {
                slug: "idempotency-key-conflict",
                title: "Idempotency key conflict",
                status: 409,
            },
            Self::IdempotencyReplayRejected => &ProblemType {
                slug: "idempotency-replay-rejected",
                title: "Idempotent replay rejected",
                status: 422,
            },
            Self::ResourceNotFound => &ProblemType {
                slug: "resource-not-found",
                title: "Resource not found",
                status: 404,
            },
            Self::Conflict => &ProblemType {
                slug: "conflict",
                title: "Conflict",
                status: 409,
            },
            Self::TransactionSerializationFailure => &ProblemType {
                slug: "transaction-serialization-failure",
                title: "Transaction serialization failure",
                status: 409,
            },
            Self::TransactionTimeout => &ProblemType {
                slug: "transaction-timeout",
                title: "Transaction timed out",
                status: 504,
            },
            Self::RateLimited => &ProblemType {
                slug: "rate-limited",
                title: "Rate limit exceeded",
                status: 429,
            },
            Self::QuotaExceeded => &ProblemType {
                slug: "quota-exceeded",
                title: "Quota exceeded",
                status: 429,
            },
            Self::DependencyUnavailable => &ProblemType {
                slug: "dependency-unavailable",
                title: "Dependency unavailable",
                status: 503,
            },
            Self::DependencyTimeout => &ProblemType {
                slug: "dependency-timeout",
                title: "Dependency timed out",
                status: 504,
            },
            Self::SearchIndexStale => &ProblemType {
                slug: "search-index-stale",
                title: "Search index is stale",
                status: 503,
            },
            Self::PaymentScaRequired => &ProblemType {
                slug: "payment-sca-required",
                title: "Payment requires strong customer authentication",
                status: 402,
            },
            Self::PaymentAuthorizationDeclined => &ProblemType {
                slug: "payment-authorization-declined",
                title: "Payment authorization declined",
                status: 402,
            },
            Self::PaymentCaptureFailed => &ProblemType {
                slug: "payment-capture-failed",
                title: "Payment capture failed",
                status: 402,
            },
            Self::WebhookSignatureInvalid => &ProblemType {
                slug: "webhook-signature-invalid",
                title: "Webhook signature invalid",
                status: 401,
            },
            Self::WebhookReplayDetected => &ProblemType {
                slug: "webhook-replay-detected",
                title: "Webhook replay detected",
                status: 409,
            },
            Self::InternalError => &ProblemType {
                slug: "internal-error",
                title: "Internal error",
                status: 500,
            },
        }
    }

    pub fn slug(&self) -> &'static str {
        self.descriptor().slug
    }

    pub fn title(&self) -> &'static str {
        self.descriptor().title
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.descriptor().status).expect("registry statuses are valid")
    }

    pub fn uri(&self) -> String {
        self.descriptor().uri()
    }

    /// Whether this kind is eligible for caller retry per the propagation policy
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransactionSerializationFailure
                | Self::TransactionTimeout
                | Self::DependencyTimeout
                | Self::DependencyUnavailable
        )
    }
}

/// Process-wide registry, slug → kind
static REGISTRY: Lazy<BTreeMap<&'static str, ProblemKind>> = Lazy::new(|| {
    ProblemKind::ALL.iter().map(|k| (k.slug(), *k)).collect()
});

/// Look up a problem kind by its slug
pub fn kind_for_slug(slug: &str) -> Option<ProblemKind> {
    REGISTRY.get(slug).copied()
}

/// A concrete failure: a kind plus request-scoped detail and extensions
#[derive(Debug, Clone)]
pub struct Problem {
    kind: ProblemKind,
    detail: Option<String>,
    instance: Option<String>,
    tenant_id: Option<String>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    extensions: BTreeMap<String, serde_json::Value>,
    headers: Vec<(HeaderName, String)>,
}

impl Problem {
    pub fn new(kind: ProblemKind) -> Self {
        Self {
            kind,
            detail: None,
            instance: None,
            tenant_id: None,
            correlation_id: None,
            trace_id: None,
            extensions: BTreeMap::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_detail(kind: ProblemKind, detail: impl Into<String>) -> Self {
        Self::new(kind).detail(detail)
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(sanitize_detail(&detail.into()));
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Attach an extension field
    ///
    /// Keys must be kebab-case; string values longer than 512 chars are
    /// truncated with an ellipsis. Non-conforming keys are dropped with a
    /// warning rather than poisoning the payload.
    pub fn extension(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !is_kebab_case(key) {
            tracing::warn!(key, "dropping non-kebab-case problem extension key");
            return self;
        }
        let value = match value.into() {
            serde_json::Value::String(s) if s.chars().count() > MAX_EXTENSION_LEN => {
                serde_json::Value::String(truncate_with_ellipsis(&s, MAX_EXTENSION_LEN))
            }
            other => other,
        };
        self.extensions.insert(key.to_string(), value);
        self
    }

    /// Attach a response header to emit alongside the problem body
    /// (e.g. `Retry-After`, `WWW-Authenticate`)
    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn kind(&self) -> ProblemKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn detail_message(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn extensions(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extensions
    }

    pub fn response_headers(&self) -> &[(HeaderName, String)] {
        &self.headers
    }

    /// Render the RFC 7807 body
    pub fn body(&self) -> ProblemBody {
        ProblemBody {
            r#type: self.kind.uri(),
            title: self.kind.title().to_string(),
            status: self.kind.descriptor().status,
            detail: self.detail.clone(),
            instance: self.instance.clone(),
            tenant_id: self.tenant_id.clone(),
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.slug())?;
        if let Some(ref detail) = self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for Problem {}

/// Wire shape of `application/problem+json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemBody {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(
                kind = self.kind.slug(),
                detail = self.detail.as_deref(),
                trace_id = self.trace_id.as_deref(),
                correlation_id = self.correlation_id.as_deref(),
                "problem"
            );
        } else {
            tracing::warn!(
                kind = self.kind.slug(),
                detail = self.detail.as_deref(),
                "problem"
            );
        }

        let mut response = (status, Json(self.body())).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        for (name, value) in &self.headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                response.headers_mut().insert(name.clone(), value);
            }
        }
        response
    }
}

/// Sanitize an internal message for external surfacing: single line, capped length
pub fn sanitize_detail(message: &str) -> String {
    let single_line: String = message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    truncate_with_ellipsis(single_line.trim(), MAX_DETAIL_LEN)
}

fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{truncated}\u{2026}")
}

fn is_kebab_case(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 80
        && !key.starts_with('-')
        && !key.ends_with('-')
        && !key.contains("--")
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
