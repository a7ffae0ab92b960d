//! Signed consistency tokens
//!
//! A token binds `(tenant, issued-at, watermark, optional entity version)` to
//! a signer key id. The wire form is a base64url-nopad JSON container
//! `{v, tenant, iat_ms, wm_ms, ev?, kid, sig}`; the signature covers a
//! length-prefixed frame of the payload fields, so no field can be moved or
//! truncated into another.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto;
use crate::tenant::TenantId;

/// Current wire format version
pub const TOKEN_FORMAT_VERSION: u8 = 1;

/// Decoded token claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyToken {
    pub tenant: TenantId,
    pub issued_at_ms: i64,
    pub watermark_ms: i64,
    pub entity_version: Option<i64>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is not valid base64url")]
    BadEncoding,
    #[error("token container is malformed")]
    BadContainer,
    #[error("unsupported token version {0}")]
    UnsupportedVersion(u8),
    #[error("token signature invalid")]
    BadSignature,
    #[error("token tenant is invalid")]
    BadTenant,
}

/// Signs and verifies token payloads; key management is the caller's concern
pub trait TokenSigner: Send + Sync {
    fn key_id(&self) -> &str;

    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    /// Verify `sig` over `payload` for `key_id`; unknown key ids verify false
    fn verify(&self, key_id: &str, payload: &[u8], sig: &[u8]) -> bool;
}

/// HMAC-SHA256 signer over a single injected secret
pub struct HmacTokenSigner {
    key_id: String,
    secret: Vec<u8>,
}

impl HmacTokenSigner {
    pub fn new(key_id: impl Into<String>, secret: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            secret,
        }
    }
}

impl TokenSigner for HmacTokenSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        crypto::hmac_sha256(&self.secret, payload)
    }

    fn verify(&self, key_id: &str, payload: &[u8], sig: &[u8]) -> bool {
        if key_id != self.key_id {
            return false;
        }
        crypto::constant_time_eq(&self.sign(payload), sig)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenContainer {
    v: u8,
    tenant: String,
    iat_ms: i64,
    wm_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ev: Option<i64>,
    kid: String,
    sig: String,
}

fn signing_payload(token: &ConsistencyToken) -> Vec<u8> {
    let ev = token
        .entity_version
        .map(|v| v.to_be_bytes().to_vec())
        .unwrap_or_default();
    crypto::length_prefixed(&[
        token.tenant.as_str().as_bytes(),
        &token.issued_at_ms.to_be_bytes(),
        &token.watermark_ms.to_be_bytes(),
        &ev,
    ])
}

/// Sign and serialize a token to its wire form
pub fn encode(token: &ConsistencyToken, signer: &dyn TokenSigner) -> String {
    let sig = signer.sign(&signing_payload(token));
    let container = TokenContainer {
        v: TOKEN_FORMAT_VERSION,
        tenant: token.tenant.as_str().to_string(),
        iat_ms: token.issued_at_ms,
        wm_ms: token.watermark_ms,
        ev: token.entity_version,
        kid: signer.key_id().to_string(),
        sig: URL_SAFE_NO_PAD.encode(sig),
    };
    let json = serde_json::to_vec(&container).expect("token container serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode and verify a wire token
///
/// Verifies the signature only; TTL and tenant-match checks belong to the
/// engine, which knows the clock and the request tenant.
pub fn decode(raw: &str, signer: &dyn TokenSigner) -> Result<ConsistencyToken, TokenError> {
    let json = URL_SAFE_NO_PAD
        .decode(raw.trim())
        .map_err(|_| TokenError::BadEncoding)?;
    let container: TokenContainer =
        serde_json::from_slice(&json).map_err(|_| TokenError::BadContainer)?;
    if container.v != TOKEN_FORMAT_VERSION {
        return Err(TokenError::UnsupportedVersion(container.v));
    }
    let tenant = TenantId::parse(&container.tenant).map_err(|_| TokenError::BadTenant)?;
    let token = ConsistencyToken {
        tenant,
        issued_at_ms: container.iat_ms,
        watermark_ms: container.wm_ms,
        entity_version: container.ev,
    };
    let sig = URL_SAFE_NO_PAD
        .decode(&container.sig)
        .map_err(|_| TokenError::BadEncoding)?;
    if !signer.verify(&container.kid, &signing_payload(&token), &sig) {
        return Err(TokenError::BadSignature);
    }
    Ok(token)
}
