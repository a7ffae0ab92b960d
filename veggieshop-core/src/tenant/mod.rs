//! Tenant identity, context, and carrier resolution

mod context;
mod resolver;

pub use context::TenantContext;
pub use resolver::{
    ResolvedTenant, TenantCarriers, TenantResolver, TenantResolverConfig, TenantSource,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Validated tenant identifier
///
/// Lowercase ASCII letters, digits, and single hyphens; 3 to 63 chars; no
/// leading or trailing hyphen; no `--`. Input is normalized (trimmed,
/// lowercased) at construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

pub const TENANT_MIN_LEN: usize = 3;
pub const TENANT_MAX_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantIdError {
    #[error("tenant id must be {TENANT_MIN_LEN}..={TENANT_MAX_LEN} chars, got {0}")]
    Length(usize),
    #[error("tenant id contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("tenant id must not start or end with a hyphen")]
    EdgeHyphen,
    #[error("tenant id must not contain consecutive hyphens")]
    DoubleHyphen,
}

impl TenantId {
    /// Parse and normalize a tenant id
    pub fn parse(input: &str) -> Result<Self, TenantIdError> {
        let normalized = input.trim().to_ascii_lowercase();
        Self::check(&normalized)?;
        Ok(Self(normalized))
    }

    /// Whether `input` is already a valid, normalized tenant id
    pub fn is_valid(input: &str) -> bool {
        Self::parse(input).map(|t| t.0 == input).unwrap_or(false)
    }

    fn check(s: &str) -> Result<(), TenantIdError> {
        if s.len() < TENANT_MIN_LEN || s.len() > TENANT_MAX_LEN {
            return Err(TenantIdError::Length(s.len()));
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(TenantIdError::InvalidChar(bad));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(TenantIdError::EdgeHyphen);
        }
        if s.contains("--") {
            return Err(TenantIdError::DoubleHyphen);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Obfuscated form for logs: first 3 and last 2 chars retained
    pub fn obfuscate(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let head: String = chars.iter().take(3).collect();
        let tail: String = chars[chars.len().saturating_sub(2)..].iter().collect();
        format!("{head}***{tail}")
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Naming conventions for per-tenant downstream resources
///
/// Search indexes, queues, and similar collaborators derive their names from
/// the tenant: a `tenant-{id}-{domain}` alias, a `-000001` first index, and
/// dated `-YYYY.MM.DD` rollover suffixes. Storage ids accepted here are the
/// looser `[a-z0-9_-]{1,64}` shape some engines use.
pub mod naming {
    use chrono::{DateTime, Datelike, Utc};

    use super::TenantId;

    /// `tenant-{tenantId}-{domain}`
    pub fn alias(tenant: &TenantId, domain: &str) -> String {
        format!("tenant-{}-{}", tenant.as_str(), domain)
    }

    /// First concrete index behind an alias
    pub fn first_index(alias: &str) -> String {
        format!("{alias}-000001")
    }

    /// Dated rollover index behind an alias
    pub fn dated_index(alias: &str, date: DateTime<Utc>) -> String {
        format!(
            "{alias}-{:04}.{:02}.{:02}",
            date.year(),
            date.month(),
            date.day()
        )
    }

    /// The storage-id shape downstream engines accept: `[a-z0-9_-]{1,64}`
    pub fn is_valid_storage_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 64
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TenantId {
    type Err = TenantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TenantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
