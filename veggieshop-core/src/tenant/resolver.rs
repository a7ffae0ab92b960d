//! Tenant extraction from request carriers
//!
//! A request may carry its tenant in several places at once: an explicit
//! override, an HTTP header, a JWT claim, or a message header. The resolver
//! applies a fixed precedence and, by default, insists that every carrier
//! that names a tenant agrees.

use serde::{Deserialize, Serialize};

use crate::headers::EventHeaders;
use crate::problem::{Problem, ProblemKind};

use super::TenantId;

/// Where a tenant value was found, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TenantSource {
    Explicit,
    HttpHeader,
    JwtClaim,
    MessageHeader,
}

impl TenantSource {
    fn label(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::HttpHeader => "http-header",
            Self::JwtClaim => "jwt-claim",
            Self::MessageHeader => "message-header",
        }
    }
}

/// A resolved tenant and the carrier it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTenant {
    pub tenant: TenantId,
    pub source: TenantSource,
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantResolverConfig {
    /// HTTP header names checked in order
    #[serde(default = "default_header_aliases")]
    pub header_aliases: Vec<String>,

    /// JWT claim names checked in order
    #[serde(default = "default_claim_aliases")]
    pub claim_aliases: Vec<String>,

    /// When true, carriers that both name a tenant must agree
    #[serde(default = "default_true")]
    pub enforce_consistency: bool,
}

fn default_header_aliases() -> Vec<String> {
    vec!["X-Tenant-Id".to_string(), "tenant-id".to_string()]
}

fn default_claim_aliases() -> Vec<String> {
    vec!["tenant_id".to_string(), "tid".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for TenantResolverConfig {
    fn default() -> Self {
        Self {
            header_aliases: default_header_aliases(),
            claim_aliases: default_claim_aliases(),
            enforce_consistency: true,
        }
    }
}

/// The carriers available for one request
#[derive(Debug, Default)]
pub struct TenantCarriers<'a> {
    pub explicit: Option<TenantId>,
    pub http_headers: Option<&'a http::HeaderMap>,
    pub jwt_claims: Option<&'a serde_json::Value>,
    pub message_headers: Option<&'a EventHeaders>,
}

/// Precedence-based tenant resolver
#[derive(Debug, Clone, Default)]
pub struct TenantResolver {
    config: TenantResolverConfig,
}

impl TenantResolver {
    pub fn new(config: TenantResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve the tenant for a request
    ///
    /// Precedence: explicit > HTTP header > JWT claim > message header. With
    /// `enforce_consistency` (the default), any two carriers that name
    /// different tenants fail the request with `tenant-mismatch`. No carrier
    /// at all fails with `tenant-required`.
    pub fn resolve(&self, carriers: &TenantCarriers<'_>) -> Result<ResolvedTenant, Problem> {
        let mut candidates: Vec<ResolvedTenant> = Vec::with_capacity(4);

        if let Some(ref tenant) = carriers.explicit {
            candidates.push(ResolvedTenant {
                tenant: tenant.clone(),
                source: TenantSource::Explicit,
            });
        }
        if let Some(headers) = carriers.http_headers {
            if let Some(raw) = self.first_header(headers) {
                candidates.push(self.parse(raw, TenantSource::HttpHeader)?);
            }
        }
        if let Some(claims) = carriers.jwt_claims {
            if let Some(raw) = self.first_claim(claims) {
                candidates.push(self.parse(raw, TenantSource::JwtClaim)?);
            }
        }
        if let Some(headers) = carriers.message_headers {
            if let Ok(Some(raw)) = headers.get_str(crate::headers::keys::TENANT_ID) {
                candidates.push(self.parse(&raw, TenantSource::MessageHeader)?);
            }
        }

        let strongest = match candidates.first() {
            Some(first) => first.clone(),
            None => {
                return Err(Problem::with_detail(
                    ProblemKind::TenantRequired,
                    "No carrier supplied a tenant",
                ))
            }
        };

        if self.config.enforce_consistency {
            if let Some(conflicting) = candidates
                .iter()
                .find(|c| c.tenant != strongest.tenant)
            {
                return Err(Problem::with_detail(
                    ProblemKind::TenantMismatch,
                    "Tenant carriers disagree",
                )
                .extension("strongest-source", strongest.source.label())
                .extension("conflicting-source", conflicting.source.label()));
            }
        }

        tracing::debug!(
            tenant_id = %strongest.tenant.obfuscate(),
            source = strongest.source.label(),
            "tenant resolved"
        );
        Ok(strongest)
    }

    fn first_header<'h>(&self, headers: &'h http::HeaderMap) -> Option<&'h str> {
        self.config
            .header_aliases
            .iter()
            .find_map(|name| headers.get(name.as_str()).and_then(|v| v.to_str().ok()))
    }

    fn first_claim<'c>(&self, claims: &'c serde_json::Value) -> Option<&'c str> {
        self.config
            .claim_aliases
            .iter()
            .find_map(|name| claims.get(name).and_then(|v| v.as_str()))
    }

    fn parse(&self, raw: &str, source: TenantSource) -> Result<ResolvedTenant, Problem> {
        let tenant = TenantId::parse(raw).map_err(|e| {
            Problem::with_detail(ProblemKind::ValidationFailed, e.to_string())
                .extension("carrier", source.label())
        })?;
        Ok(ResolvedTenant { tenant, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn resolver() -> TenantResolver {
        TenantResolver::default()
    }

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_no_carrier_is_tenant_required() {
        let err = resolver().resolve(&TenantCarriers::default()).unwrap_err();
        assert_eq!(err.kind(), ProblemKind::TenantRequired);
    }

    #[test]
    fn test_http_header_resolution_with_alias() {
        let headers = headers_with("x-tenant-id", "acme");
        let resolved = resolver()
            .resolve(&TenantCarriers {
                http_headers: Some(&headers),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.tenant.as_str(), "acme");
        assert_eq!(resolved.source, TenantSource::HttpHeader);

        let headers = headers_with("tenant-id", "acme");
        let resolved = resolver()
            .resolve(&TenantCarriers {
                http_headers: Some(&headers),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.source, TenantSource::HttpHeader);
    }

    #[test]
    fn test_explicit_beats_header() {
        let headers = headers_with("x-tenant-id", "acme");
        let resolved = resolver()
            .resolve(&TenantCarriers {
                explicit: Some(TenantId::parse("acme").unwrap()),
                http_headers: Some(&headers),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.source, TenantSource::Explicit);
    }

    #[test]
    fn test_claim_resolution() {
        let claims = serde_json::json!({"sub": "u1", "tid": "acme"});
        let resolved = resolver()
            .resolve(&TenantCarriers {
                jwt_claims: Some(&claims),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.source, TenantSource::JwtClaim);
        assert_eq!(resolved.tenant.as_str(), "acme");
    }

    #[test]
    fn test_message_header_resolution() {
        let mut msg = EventHeaders::new();
        msg.insert_str(crate::headers::keys::TENANT_ID, "acme").unwrap();
        let resolved = resolver()
            .resolve(&TenantCarriers {
                message_headers: Some(&msg),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.source, TenantSource::MessageHeader);
    }

    #[test]
    fn test_disagreeing_carriers_mismatch() {
        let headers = headers_with("x-tenant-id", "acme");
        let claims = serde_json::json!({"tenant_id": "globex"});
        let err = resolver()
            .resolve(&TenantCarriers {
                http_headers: Some(&headers),
                jwt_claims: Some(&claims),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::TenantMismatch);
    }

    #[test]
    fn test_disagreement_allowed_when_not_enforced() {
        let resolver = TenantResolver::new(TenantResolverConfig {
            enforce_consistency: false,
            ..Default::default()
        });
        let headers = headers_with("x-tenant-id", "acme");
        let claims = serde_json::json!({"tenant_id": "globex"});
        let resolved = resolver
            .resolve(&TenantCarriers {
                http_headers: Some(&headers),
                jwt_claims: Some(&claims),
                ..Default::default()
            })
            .unwrap();
        // Strongest carrier wins
        assert_eq!(resolved.tenant.as_str(), "acme");
    }

    #[test]
    fn test_malformed_carrier_value_fails_validation() {
        let headers = headers_with("x-tenant-id", "-bad-");
        let err = resolver()
            .resolve(&TenantCarriers {
                http_headers: Some(&headers),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ProblemKind::ValidationFailed);
    }
}
