//! Canonical audit metadata
//!
//! The hash input for an audit record is a canonical ASCII, line-oriented
//! rendering with a fixed field order. Fields are validated once, in a single
//! normalize-and-check pass from the draft struct; absent optional fields
//! render as `-`.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::audit::hash::{self, AuditHash};
use crate::tenant::TenantId;

const CODE_MIN: usize = 2;
const CODE_MAX: usize = 80;
const ATTR_KEY_MAX: usize = 40;
const ATTR_VALUE_MAX: usize = 120;

/// Unvalidated audit metadata input
///
/// Populate the fields, then call [`AuditMetadata::from_draft`].
#[derive(Debug, Clone, Default)]
pub struct AuditMetadataDraft {
    pub schema: String,
    pub tenant: Option<TenantId>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: String,
    pub occurred_at_millis: i64,
    pub entity_version: Option<i64>,
    pub roles: Vec<String>,
    pub risk: String,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub client: Option<String>,
    pub reason: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Validated audit metadata with a canonical rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditMetadata {
    schema: String,
    tenant: TenantId,
    action: String,
    resource_type: String,
    resource_id: String,
    actor: String,
    occurred_at_millis: i64,
    entity_version: Option<i64>,
    roles: BTreeSet<String>,
    risk: String,
    trace_id: Option<String>,
    correlation_id: Option<String>,
    client: Option<String>,
    reason: Option<String>,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditMetadataError {
    #[error("field {field} must match [A-Za-z0-9._:-]+ with length {CODE_MIN}..={CODE_MAX}: {value:?}")]
    BadCode { field: &'static str, value: String },
    #[error("tenant is required")]
    MissingTenant,
    #[error("attribute key {0:?} must be lower-kebab-case, at most {ATTR_KEY_MAX} chars")]
    BadAttributeKey(String),
    #[error("attribute value for {0:?} must be ASCII, at most {ATTR_VALUE_MAX} chars")]
    BadAttributeValue(String),
    #[error("field {0} must be printable ASCII")]
    NonAscii(&'static str),
}

impl AuditMetadata {
    /// Single normalize-and-check pass over a draft
    pub fn from_draft(draft: AuditMetadataDraft) -> Result<Self, AuditMetadataError> {
        let tenant = draft.tenant.ok_or(AuditMetadataError::MissingTenant)?;
        check_code("schema", &draft.schema)?;
        check_code("action", &draft.action)?;
        check_code("resourceType", &draft.resource_type)?;
        check_code("actor", &draft.actor)?;
        check_code("risk", &draft.risk)?;
        check_ascii("resourceId", &draft.resource_id)?;
        if let Some(ref client) = draft.client {
            check_ascii("client", client)?;
        }
        if let Some(ref reason) = draft.reason {
            check_ascii("reason", reason)?;
        }

        let mut roles = BTreeSet::new();
        for role in draft.roles {
            check_code("roles", &role)?;
            roles.insert(role);
        }

        let mut attributes = BTreeMap::new();
        for (key, value) in draft.attributes {
            if !is_attr_key(&key) {
                return Err(AuditMetadataError::BadAttributeKey(key));
            }
            if !value.is_ascii() || value.len() > ATTR_VALUE_MAX {
                return Err(AuditMetadataError::BadAttributeValue(key));
            }
            attributes.insert(key, value);
        }

        Ok(Self {
            schema: draft.schema,
            tenant,
            action: draft.action,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            actor: draft.actor,
            occurred_at_millis: draft.occurred_at_millis,
            entity_version: draft.entity_version,
            roles,
            risk: draft.risk,
            trace_id: draft.trace_id,
            correlation_id: draft.correlation_id,
            client: draft.client,
            reason: draft.reason,
            attributes,
        })
    }

    /// Canonical line-oriented rendering, the audit hash input
    pub fn canonical(&self) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(15);
        lines.push(self.schema.clone());
        lines.push(self.tenant.as_str().to_string());
        lines.push(self.action.clone());
        lines.push(self.resource_type.clone());
        lines.push(self.resource_id.clone());
        lines.push(self.actor.clone());
        lines.push(self.occurred_at_millis.to_string());
        lines.push(opt_i64(self.entity_version));
        lines.push(if self.roles.is_empty() {
            "-".to_string()
        } else {
            self.roles.iter().cloned().collect::<Vec<_>>().join(",")
        });
        lines.push(self.risk.clone());
        lines.push(opt_str(self.trace_id.as_deref()));
        lines.push(opt_str(self.correlation_id.as_deref()));
        lines.push(opt_str(self.client.as_deref()));
        lines.push(opt_str(self.reason.as_deref()));
        lines.push(if self.attributes.is_empty() {
            "-".to_string()
        } else {
            self.attributes
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";")
        });
        lines.join("\n")
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.canonical().into_bytes()
    }

    /// Chained audit hash over the canonical rendering
    pub fn hash_chained(&self, prev: Option<&AuditHash>) -> AuditHash {
        hash::compute_chained(prev, &self.canonical_bytes())
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn occurred_at_millis(&self) -> i64 {
        self.occurred_at_millis
    }
}

fn opt_str(value: Option<&str>) -> String {
    value.map(str::to_string).unwrap_or_else(|| "-".to_string())
}

fn opt_i64(value: Option<i64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn check_code(field: &'static str, value: &str) -> Result<(), AuditMetadataError> {
    let ok = (CODE_MIN..=CODE_MAX).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if ok {
        Ok(())
    } else {
        Err(AuditMetadataError::BadCode {
            field,
            value: value.to_string(),
        })
    }
}

fn check_ascii(field: &'static str, value: &str) -> Result<(), AuditMetadataError> {
    if value.is_ascii() && value.len() <= ATTR_VALUE_MAX {
        Ok(())
    } else {
        Err(AuditMetadataError::NonAscii(field))
    }
}

fn is_attr_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= ATTR_KEY_MAX
        && !key.starts_with('-')
        && !key.ends_with('-')
        && !key.contains("--")
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> AuditMetadataDraft {
        AuditMetadataDraft {
            schema: "audit.v1".to_string(),
            tenant: Some(TenantId::parse("acme").unwrap()),
            action: "order.create".to_string(),
            resource_type: "order".to_string(),
            resource_id: "o-123".to_string(),
            actor: "user:u1".to_string(),
            occurred_at_millis: 1_700_000_000_000,
            entity_version: Some(3),
            roles: vec!["VENDOR".to_string(), "ADMIN".to_string()],
            risk: "LOW".to_string(),
            trace_id: Some("trace-1".to_string()),
            correlation_id: None,
            client: None,
            reason: None,
            attributes: [("order-total".to_string(), "12.50".to_string())]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_canonical_field_order_and_placeholders() {
        let meta = AuditMetadata::from_draft(draft()).unwrap();
        let canonical = meta.canonical();
        let lines: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(lines.len(), 15);
        assert_eq!(lines[0], "audit.v1");
        assert_eq!(lines[1], "acme");
        assert_eq!(lines[2], "order.create");
        assert_eq!(lines[6], "1700000000000");
        assert_eq!(lines[7], "3");
        // Roles sorted alphabetically
        assert_eq!(lines[8], "ADMIN,VENDOR");
        assert_eq!(lines[9], "LOW");
        assert_eq!(lines[10], "trace-1");
        assert_eq!(lines[11], "-");
        assert_eq!(lines[14], "order-total=12.50");
    }

    #[test]
    fn test_attributes_sorted_by_key() {
        let mut d = draft();
        d.attributes = [
            ("zeta".to_string(), "1".to_string()),
            ("alpha".to_string(), "2".to_string()),
        ]
        .into_iter()
        .collect();
        let meta = AuditMetadata::from_draft(d).unwrap();
        assert!(meta.canonical().ends_with("alpha=2;zeta=1"));
    }

    #[test]
    fn test_missing_tenant_rejected() {
        let mut d = draft();
        d.tenant = None;
        assert_eq!(
            AuditMetadata::from_draft(d),
            Err(AuditMetadataError::MissingTenant)
        );
    }

    #[test]
    fn test_code_validation() {
        let mut d = draft();
        d.action = "a".to_string();
        assert!(matches!(
            AuditMetadata::from_draft(d),
            Err(AuditMetadataError::BadCode { field: "action", .. })
        ));

        let mut d = draft();
        d.risk = "has space".to_string();
        assert!(matches!(
            AuditMetadata::from_draft(d),
            Err(AuditMetadataError::BadCode { field: "risk", .. })
        ));
    }

    #[test]
    fn test_attribute_validation() {
        let mut d = draft();
        d.attributes.insert("Bad_Key".to_string(), "v".to_string());
        assert!(matches!(
            AuditMetadata::from_draft(d),
            Err(AuditMetadataError::BadAttributeKey(_))
        ));

        let mut d = draft();
        d.attributes
            .insert("long-value".to_string(), "x".repeat(121));
        assert!(matches!(
            AuditMetadata::from_draft(d),
            Err(AuditMetadataError::BadAttributeValue(_))
        ));
    }

    #[test]
    fn test_hash_is_stable_and_chainable() {
        let meta = AuditMetadata::from_draft(draft()).unwrap();
        let first = meta.hash_chained(None);
        assert_eq!(meta.hash_chained(None), first);

        let second = meta.hash_chained(Some(&first));
        assert_ne!(first, second);
        assert!(hash::verify_chained(
            Some(&first),
            &meta.canonical_bytes(),
            &second
        ));
    }
}
