//! HMAC partner-request verification
//!
//! Partners sign requests with a shared secret over a canonical
//! newline-delimited string covering timestamp, nonce, method, path,
//! canonical query, body digest, and tenant. Nonces are single-use within a
//! TTL window; timestamps are bounded by clock skew; signature comparison is
//! constant-time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::WallClock;
use crate::crypto;
use crate::problem::{Problem, ProblemKind};
use crate::tenant::TenantId;

/// Carrier header names
pub mod header_names {
    pub const KEY_ID: &str = "x-hmac-key-id";
    pub const TIMESTAMP: &str = "x-hmac-timestamp";
    pub const NONCE: &str = "x-hmac-nonce";
    pub const SIGNATURE: &str = "x-hmac-signature";
    pub const DIGEST: &str = "digest";
}

const MIN_NONCE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HmacAlgorithm {
    Sha256,
    Sha512,
}

impl HmacAlgorithm {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sha256 => "VEGGIESHOP-HMAC-SHA256",
            Self::Sha512 => "VEGGIESHOP-HMAC-SHA512",
        }
    }

    fn mac(&self, secret: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => crypto::hmac_sha256(secret, data),
            Self::Sha512 => crypto::hmac_sha512(secret, data),
        }
    }
}

/// One partner signing key
#[derive(Debug, Clone)]
pub struct HmacKey {
    pub key_id: String,
    pub secret: Vec<u8>,
    pub active: bool,
    /// Empty set means any tenant
    pub allowed_tenants: BTreeSet<TenantId>,
    pub partner_id: Option<String>,
    pub scopes: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub algorithm: HmacAlgorithm,
}

/// Key lookup SPI; key management itself is external
#[async_trait]
pub trait HmacKeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &str) -> Option<HmacKey>;
}

/// Fixed key set for tests and static deployments
#[derive(Debug, Default)]
pub struct StaticHmacKeyResolver {
    keys: HashMap<String, HmacKey>,
}

impl StaticHmacKeyResolver {
    pub fn new(keys: impl IntoIterator<Item = HmacKey>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|key| (key.key_id.clone(), key))
                .collect(),
        }
    }
}

#[async_trait]
impl HmacKeyResolver for StaticHmacKeyResolver {
    async fn resolve(&self, key_id: &str) -> Option<HmacKey> {
        self.keys.get(key_id).cloned()
    }
}

#[derive(Debug, Error)]
pub enum NonceStoreError {
    #[error("nonce store unavailable: {0}")]
    Unavailable(String),
}

/// Single-use nonce registry
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Returns true when the nonce was fresh and is now registered for `ttl`
    async fn register(&self, key: &str, ttl: Duration) -> Result<bool, NonceStoreError>;
}

/// In-memory nonce store with lazy expiry
pub struct InMemoryNonceStore {
    entries: DashMap<String, i64>,
    clock: Arc<dyn WallClock>,
}

impl InMemoryNonceStore {
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn register(&self, key: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        let now = self.clock.now_millis();
        let expires_at = now + ttl.as_millis() as i64;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if *existing.get() <= now {
                    existing.insert(expires_at);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }
}

/// Redis nonce store (`SET key 1 NX EX ttl`)
#[cfg(feature = "cache")]
pub struct RedisNonceStore {
    pool: deadpool_redis::Pool,
}

#[cfg(feature = "cache")]
impl RedisNonceStore {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl NonceStore for RedisNonceStore {
    async fn register(&self, key: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        use redis::AsyncCommands;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;
        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1)));
        let reply: Option<String> = conn
            .set_options(key, 1, options)
            .await
            .map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;
        Ok(reply.is_some())
    }
}

/// Verifier tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmacConfig {
    /// Allowed clock skew for `X-Hmac-Timestamp`, in seconds
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    /// Nonce single-use window in seconds
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Require and verify the `Digest: SHA-256=<b64>` header
    #[serde(default = "default_true")]
    pub enforce_body_sha256: bool,
}

fn default_clock_skew_secs() -> u64 {
    300
}
fn default_nonce_ttl_secs() -> u64 {
    900
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_true() -> bool {
    true
}

impl Default for HmacConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew_secs(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
            max_body_bytes: default_max_body_bytes(),
            enforce_body_sha256: default_true(),
        }
    }
}

/// The request parts covered by the signature
#[derive(Debug)]
pub struct HmacRequest<'a> {
    pub method: &'a str,
    /// Raw (undecoded) path
    pub path: &'a str,
    pub raw_query: Option<&'a str>,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

/// Who signed the request, for downstream authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerIdentity {
    pub key_id: String,
    pub partner_id: Option<String>,
    pub tenant: TenantId,
    pub scopes: BTreeSet<String>,
    pub roles: BTreeSet<String>,
}

pub struct HmacVerifier {
    keys: Arc<dyn HmacKeyResolver>,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn WallClock>,
    config: HmacConfig,
}

impl HmacVerifier {
    pub fn new(
        keys: Arc<dyn HmacKeyResolver>,
        nonces: Arc<dyn NonceStore>,
        clock: Arc<dyn WallClock>,
        config: HmacConfig,
    ) -> Self {
        Self {
            keys,
            nonces,
            clock,
            config,
        }
    }

    /// Whether the request opted into HMAC auth
    pub fn is_activated(headers: &http::HeaderMap) -> bool {
        headers.contains_key(header_names::KEY_ID)
            || headers.contains_key(header_names::SIGNATURE)
    }

    /// Verify a request for an already-resolved tenant
    pub async fn verify(
        &self,
        tenant: &TenantId,
        request: &HmacRequest<'_>,
    ) -> Result<PartnerIdentity, Problem> {
        let key_id = required_header(request.headers, header_names::KEY_ID)?;
        let timestamp = required_header(request.headers, header_names::TIMESTAMP)?;
        let nonce = required_header(request.headers, header_names::NONCE)?;
        let signature = required_header(request.headers, header_names::SIGNATURE)?;

        if nonce.len() < MIN_NONCE_LEN {
            return Err(auth_failed("Nonce too short"));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| auth_failed("Malformed timestamp"))?;
        let now_secs = self.clock.now_millis() / 1_000;
        if (now_secs - ts).unsigned_abs() > self.config.clock_skew_secs {
            return Err(auth_failed("Timestamp outside allowed skew"));
        }

        let key = self
            .keys
            .resolve(&key_id)
            .await
            .ok_or_else(|| auth_failed("Unknown key id"))?;
        if !key.active {
            return Err(auth_failed("Key is disabled"));
        }
        if !key.allowed_tenants.is_empty() && !key.allowed_tenants.contains(tenant) {
            return Err(auth_failed("Key not allowed for tenant"));
        }

        let nonce_key = format!("hmac:{key_id}|{}|{nonce}", tenant.as_str());
        let fresh = self
            .nonces
            .register(&nonce_key, Duration::from_secs(self.config.nonce_ttl_secs))
            .await
            .map_err(|e| {
                Problem::with_detail(ProblemKind::DependencyUnavailable, e.to_string())
            })?;
        if !fresh {
            return Err(auth_failed("Replay detected"));
        }

        if request.body.len() > self.config.max_body_bytes {
            return Err(Problem::with_detail(
                ProblemKind::PayloadTooLarge,
                format!("Body exceeds {} bytes", self.config.max_body_bytes),
            ));
        }
        let digest = if request.body.is_empty() {
            None
        } else {
            Some(STANDARD.encode(crypto::sha256(request.body)))
        };
        if self.config.enforce_body_sha256 {
            if let Some(ref computed) = digest {
                let header = required_header(request.headers, header_names::DIGEST)?;
                let claimed = header
                    .strip_prefix("SHA-256=")
                    .ok_or_else(|| auth_failed("Digest header must be SHA-256=<base64>"))?;
                if !crypto::constant_time_eq(claimed.as_bytes(), computed.as_bytes()) {
                    return Err(auth_failed("Body digest mismatch"));
                }
            }
        }

        let string_to_sign = string_to_sign(
            key.algorithm,
            ts,
            &nonce,
            request.method,
            request.path,
            request.raw_query,
            digest.as_deref(),
            tenant,
        );
        let expected = key.algorithm.mac(&key.secret, string_to_sign.as_bytes());
        let presented = decode_signature(&signature)
            .ok_or_else(|| auth_failed("Signature is not valid base64"))?;
        if !crypto::constant_time_eq(&expected, &presented) {
            return Err(auth_failed("Signature mismatch"));
        }

        Ok(PartnerIdentity {
            key_id: key.key_id,
            partner_id: key.partner_id,
            tenant: tenant.clone(),
            scopes: key.scopes,
            roles: key.roles,
        })
    }
}

/// Canonical newline-delimited signing payload
#[allow(clippy::too_many_arguments)]
pub fn string_to_sign(
    algorithm: HmacAlgorithm,
    timestamp: i64,
    nonce: &str,
    method: &str,
    path: &str,
    raw_query: Option<&str>,
    digest: Option<&str>,
    tenant: &TenantId,
) -> String {
    format!(
        "{alg}\nts:{timestamp}\nnonce:{nonce}\nmeth:{method}\npath:{path}\nquery:{query}\ndigest:{digest}\ntenant:{tenant}",
        alg = algorithm.label(),
        method = method.to_ascii_uppercase(),
        query = canonical_query(raw_query),
        digest = digest.unwrap_or("-"),
        tenant = tenant.as_str(),
    )
}

/// Decode, sort by `(key, value)`, re-encode with the unreserved allowlist
pub fn canonical_query(raw: Option<&str>) -> String {
    let raw = match raw {
        Some(raw) if !raw.is_empty() => raw,
        _ => return String::new(),
    };
    let mut pairs: Vec<(String, String)> = raw
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(((hi << 4) | lo) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        let unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~');
        if unreserved {
            out.push(byte as char);
        } else {
            use std::fmt::Write;
            write!(out, "%{:02X}", byte).expect("writing to a String cannot fail");
        }
    }
    out
}

fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(signature)
        .ok()
        .or_else(|| URL_SAFE_NO_PAD.decode(signature).ok())
}

fn required_header(headers: &http::HeaderMap, name: &str) -> Result<String, Problem> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| auth_failed(&format!("Missing header {name}")))
}

fn auth_failed(description: &str) -> Problem {
    Problem::with_detail(ProblemKind::AuthenticationFailed, description)
        .header(
            http::header::WWW_AUTHENTICATE,
            format!("HMAC error=\"invalid_token\", error_description=\"{description}\""),
        )
}
