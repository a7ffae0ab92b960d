//! Typed, binary-safe message-header codec
//!
//! Message headers are named byte arrays. Names are canonical ASCII
//! lower-kebab-case; values are length-bounded. Typed accessors cover the
//! envelope's wire formats: UTF-8 strings, UUIDs as 16 big-endian bytes,
//! big-endian `i32`/`i64`, and millisecond timestamps.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

/// Reserved envelope and trace header names
pub mod keys {
    pub const TENANT_ID: &str = "x-tenant-id";
    pub const TRACE_ID: &str = "x-trace-id";
    pub const SCHEMA_FINGERPRINT: &str = "x-schema-fingerprint";
    pub const ENTITY_VERSION: &str = "x-entity-version";
    pub const EVENT_ID: &str = "x-event-id";
    pub const REQUEST_ID: &str = "x-request-id";
    pub const AGGREGATE_ID: &str = "x-aggregate-id";
    pub const EVENT_FAMILY: &str = "x-event-family";
    pub const PRODUCER_ATTEMPT: &str = "x-producer-attempt";
    pub const TRACEPARENT: &str = "traceparent";
    pub const BAGGAGE: &str = "baggage";

    // Quarantine routing additions
    pub const ERROR_CLASS: &str = "x-error-class";
    pub const ERROR_ROOT_CLASS: &str = "x-error-root-class";
    pub const ERROR_MESSAGE: &str = "x-error-message";
    pub const ERROR_STACK_HASH: &str = "x-error-stack-hash";
    pub const RETRY_ATTEMPT: &str = "x-retry-attempt";
    pub const QUARANTINED_AT: &str = "x-quarantined-at";
}

/// Default bound on a single header value
pub const DEFAULT_MAX_VALUE_BYTES: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderCodecError {
    #[error("header name {0:?} is not lower-kebab ascii")]
    InvalidName(String),
    #[error("header {name} value of {actual} bytes exceeds limit {limit}")]
    ValueTooLarge {
        name: String,
        actual: usize,
        limit: usize,
    },
    #[error("header {0} is not valid UTF-8")]
    InvalidUtf8(String),
    #[error("header {name} has wrong length: expected {expected} bytes, got {actual}")]
    WrongLength {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Ordered, binary-safe header map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeaders {
    entries: BTreeMap<String, Vec<u8>>,
    max_value_bytes: usize,
}

impl Default for EventHeaders {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHeaders {
    pub fn new() -> Self {
        Self::with_value_limit(DEFAULT_MAX_VALUE_BYTES)
    }

    pub fn with_value_limit(max_value_bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_value_bytes,
        }
    }

    /// Insert raw bytes, replacing any existing value
    pub fn insert(&mut self, name: &str, value: Vec<u8>) -> Result<(), HeaderCodecError> {
        if !is_valid_name(name) {
            return Err(HeaderCodecError::InvalidName(name.to_string()));
        }
        if value.len() > self.max_value_bytes {
            return Err(HeaderCodecError::ValueTooLarge {
                name: name.to_string(),
                actual: value.len(),
                limit: self.max_value_bytes,
            });
        }
        self.entries.insert(name.to_string(), value);
        Ok(())
    }

    /// Insert only when the name is absent; returns whether the value was written
    pub fn insert_if_absent(
        &mut self,
        name: &str,
        value: Vec<u8>,
    ) -> Result<bool, HeaderCodecError> {
        if self.entries.contains_key(name) {
            return Ok(false);
        }
        self.insert(name, value)?;
        Ok(true)
    }

    pub fn insert_str(&mut self, name: &str, value: &str) -> Result<(), HeaderCodecError> {
        self.insert(name, value.as_bytes().to_vec())
    }

    pub fn insert_uuid(&mut self, name: &str, value: Uuid) -> Result<(), HeaderCodecError> {
        self.insert(name, value.as_bytes().to_vec())
    }

    pub fn insert_i32(&mut self, name: &str, value: i32) -> Result<(), HeaderCodecError> {
        self.insert(name, value.to_be_bytes().to_vec())
    }

    pub fn insert_i64(&mut self, name: &str, value: i64) -> Result<(), HeaderCodecError> {
        self.insert(name, value.to_be_bytes().to_vec())
    }

    /// Timestamp as big-endian `i64` epoch milliseconds
    pub fn insert_timestamp_millis(
        &mut self,
        name: &str,
        millis: i64,
    ) -> Result<(), HeaderCodecError> {
        self.insert_i64(name, millis)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|v| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.entries.remove(name)
    }

    pub fn get_str(&self, name: &str) -> Result<Option<String>, HeaderCodecError> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes.clone())
                .map(Some)
                .map_err(|_| HeaderCodecError::InvalidUtf8(name.to_string())),
        }
    }

    pub fn get_uuid(&self, name: &str) -> Result<Option<Uuid>, HeaderCodecError> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 16] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| HeaderCodecError::WrongLength {
                            name: name.to_string(),
                            expected: 16,
                            actual: bytes.len(),
                        })?;
                Ok(Some(Uuid::from_bytes(raw)))
            }
        }
    }

    pub fn get_i32(&self, name: &str) -> Result<Option<i32>, HeaderCodecError> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 4] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| HeaderCodecError::WrongLength {
                            name: name.to_string(),
                            expected: 4,
                            actual: bytes.len(),
                        })?;
                Ok(Some(i32::from_be_bytes(raw)))
            }
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>, HeaderCodecError> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| HeaderCodecError::WrongLength {
                            name: name.to_string(),
                            expected: 8,
                            actual: bytes.len(),
                        })?;
                Ok(Some(i64::from_be_bytes(raw)))
            }
        }
    }

    pub fn get_timestamp_millis(&self, name: &str) -> Result<Option<i64>, HeaderCodecError> {
        self.get_i64(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Envelope fields attached to every produced record
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub tenant_id: Option<String>,
    pub trace_id: Option<String>,
    pub schema_fingerprint: Option<String>,
    pub entity_version: Option<i64>,
    pub event_id: Option<Uuid>,
    pub request_id: Option<String>,
}

/// Attach envelope headers, put-if-absent
///
/// Idempotent: a second attach never overwrites what the first wrote.
pub fn attach_envelope(
    headers: &mut EventHeaders,
    envelope: &Envelope,
) -> Result<(), HeaderCodecError> {
    if let Some(ref tenant) = envelope.tenant_id {
        headers.insert_if_absent(keys::TENANT_ID, tenant.as_bytes().to_vec())?;
    }
    if let Some(ref trace) = envelope.trace_id {
        headers.insert_if_absent(keys::TRACE_ID, trace.as_bytes().to_vec())?;
    }
    if let Some(ref fingerprint) = envelope.schema_fingerprint {
        headers.insert_if_absent(keys::SCHEMA_FINGERPRINT, fingerprint.as_bytes().to_vec())?;
    }
    if let Some(version) = envelope.entity_version {
        headers.insert_if_absent(keys::ENTITY_VERSION, version.to_be_bytes().to_vec())?;
    }
    if let Some(event_id) = envelope.event_id {
        headers.insert_if_absent(keys::EVENT_ID, event_id.as_bytes().to_vec())?;
    }
    if let Some(ref request_id) = envelope.request_id {
        headers.insert_if_absent(keys::REQUEST_ID, request_id.as_bytes().to_vec())?;
    }
    Ok(())
}

/// Copy `traceparent` and `baggage` verbatim from `src` to `dst`
pub fn propagate_w3c_trace_context(src: &EventHeaders, dst: &mut EventHeaders) {
    for key in [keys::TRACEPARENT, keys::BAGGAGE] {
        if let Some(value) = src.get(key) {
            // Values came from a validated map, re-insert cannot fail on name
            let _ = dst.insert(key, value.to_vec());
        }
    }
}

/// Whether a header is safe to forward across a boundary
///
/// `x-` prefixed platform headers and the W3C trace pair are; everything else
/// is dropped at the edge.
pub fn is_safe_to_propagate(name: &str) -> bool {
    name.starts_with("x-") || name == keys::TRACEPARENT || name == keys::BAGGAGE
}

/// Copy headers matching `predicate` from `src` to `dst`
pub fn copy(
    src: &EventHeaders,
    dst: &mut EventHeaders,
    predicate: impl Fn(&str) -> bool,
) -> Result<(), HeaderCodecError> {
    for (name, value) in src.iter() {
        if predicate(name) {
            dst.insert(name, value.to_vec())?;
        }
    }
    Ok(())
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
}
