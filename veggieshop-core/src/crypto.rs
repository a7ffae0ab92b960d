//! Hashing and HMAC helpers
//!
//! Pure utilities shared by the audit chain, consistency tokens, request
//! hashing, and the partner-auth verifier: SHA-2 digests, HMAC, canonical
//! JSON, length-prefixed framing, constant-time comparison, and fingerprint
//! parsing.

use std::collections::BTreeMap;
use std::io::Read;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// SHA-256 over raw bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over a string, NFKC-normalized first
///
/// Normalization keeps visually-equivalent inputs from producing distinct
/// digests when callers hash user-entered text.
pub fn sha256_nfkc(text: &str) -> [u8; 32] {
    let normalized: String = text.nfkc().collect();
    sha256(normalized.as_bytes())
}

/// SHA-256 over a reader, streaming in 8 KiB chunks
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Lowercase hex encoding of a SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&sha256(data))
}

/// HMAC-SHA256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// HMAC-SHA512
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time equality over byte slices
///
/// Differing lengths compare unequal without leaking a timing signal about
/// the shared prefix.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Serialize a JSON value with deterministic (sorted) object key order
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).expect("canonical map serializes")
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&canonicalize(value)).expect("canonical value serializes")
}

/// SHA-256 over the canonical JSON form of a value
pub fn canonical_json_digest(value: &serde_json::Value) -> [u8; 32] {
    sha256(canonical_json(value).as_bytes())
}

/// Length-prefixed framing: `[u32-be len(x)][x]` per part
///
/// Unambiguous concatenation for multi-part hash inputs; without the prefix,
/// `("ab", "c")` and `("a", "bc")` would collide.
pub fn length_prefixed(parts: &[&[u8]]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len() + 4).sum();
    let mut framed = Vec::with_capacity(total);
    for part in parts {
        framed.extend_from_slice(&(part.len() as u32).to_be_bytes());
        framed.extend_from_slice(part);
    }
    framed
}

/// Canonical request hash: `sha256(frame(method, path, sorted-headers-json, body))`
pub fn request_hash(
    method: &str,
    path: &str,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) -> String {
    let headers_json =
        canonical_json(&serde_json::to_value(headers).expect("string map serializes"));
    let framed = length_prefixed(&[
        method.as_bytes(),
        path.as_bytes(),
        headers_json.as_bytes(),
        body,
    ]);
    hex_encode(&sha256(&framed))
}

/// A parsed `scheme:hex` fingerprint (e.g. a schema fingerprint header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub scheme: FingerprintScheme,
    pub hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintScheme {
    Sha256,
    Sha512,
}

impl FingerprintScheme {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha-256",
            Self::Sha512 => "sha-512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint must be <scheme>:<hex>")]
    MissingSeparator,
    #[error("unsupported fingerprint scheme: {0}")]
    UnsupportedScheme(String),
    #[error("fingerprint hex must be {expected} lowercase hex chars, got {actual}")]
    BadHex { expected: usize, actual: usize },
}

impl Fingerprint {
    pub fn parse(input: &str) -> Result<Self, FingerprintError> {
        let (scheme, hex) = input
            .split_once(':')
            .ok_or(FingerprintError::MissingSeparator)?;
        let scheme = match scheme {
            "sha-256" | "sha256" => FingerprintScheme::Sha256,
            "sha-512" | "sha512" => FingerprintScheme::Sha512,
            other => return Err(FingerprintError::UnsupportedScheme(other.to_string())),
        };
        let valid_hex = hex.len() == scheme.hex_len()
            && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid_hex {
            return Err(FingerprintError::BadHex {
                expected: scheme.hex_len(),
                actual: hex.len(),
            });
        }
        Ok(Self {
            scheme,
            hex: hex.to_string(),
        })
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme.label(), self.hex)
    }
}

/// Lowercase hex encoding
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        write!(out, "{:02x}", b).expect("writing to a String cannot fail");
    }
    out
}

/// Decode lowercase or uppercase hex
pub fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(input.len() / 2);
    let bytes = input.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}
