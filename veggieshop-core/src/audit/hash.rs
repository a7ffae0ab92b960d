//! Domain-separated chained digests
//!
//! Each audit record's hash covers the previous record's hash, forming an
//! ordered chain: any modification to a past record invalidates every
//! subsequent hash. A domain separator and a chain/no-chain marker byte keep
//! these digests from colliding with any other SHA-256 use in the platform.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto;

/// Domain separator prefixed to every audit digest input
pub const DOMAIN_SEPARATOR: &[u8] = b"veggieshop.audit.v1";

const MARKER_UNCHAINED: u8 = 0x00;
const MARKER_CHAINED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha-256",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "sha-256" | "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// An audit digest: algorithm plus raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditHash {
    pub algorithm: HashAlgorithm,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditHashError {
    #[error("audit hash must be <algo>:<encoded>")]
    MissingSeparator,
    #[error("unsupported audit hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("audit hash payload is neither hex nor base64url")]
    BadEncoding,
    #[error("audit hash has {actual} bytes, algorithm requires {expected}")]
    WrongLength { expected: usize, actual: usize },
}

impl AuditHash {
    /// Emit as `<algo>:<base64url-nopad>`
    pub fn encode(&self) -> String {
        format!(
            "{}:{}",
            self.algorithm.label(),
            URL_SAFE_NO_PAD.encode(&self.bytes)
        )
    }

    /// Parse `<algo>:<payload>` where the payload is hex or base64url
    pub fn parse(input: &str) -> Result<Self, AuditHashError> {
        let (label, payload) = input
            .split_once(':')
            .ok_or(AuditHashError::MissingSeparator)?;
        let algorithm = HashAlgorithm::from_label(label)
            .ok_or_else(|| AuditHashError::UnsupportedAlgorithm(label.to_string()))?;
        let bytes = crypto::hex_decode(payload)
            .or_else(|| URL_SAFE_NO_PAD.decode(payload).ok())
            .ok_or(AuditHashError::BadEncoding)?;
        if bytes.len() != algorithm.digest_len() {
            return Err(AuditHashError::WrongLength {
                expected: algorithm.digest_len(),
                actual: bytes.len(),
            });
        }
        Ok(Self { algorithm, bytes })
    }
}

impl std::fmt::Display for AuditHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Non-chained digest: `H(SEP || 0x00 || payload)`
pub fn compute(payload: &[u8]) -> AuditHash {
    digest(MARKER_UNCHAINED, None, payload)
}

/// Chained digest: `H(SEP || 0x01 || prev?.bytes || payload)`
pub fn compute_chained(prev: Option<&AuditHash>, payload: &[u8]) -> AuditHash {
    digest(MARKER_CHAINED, prev, payload)
}

fn digest(marker: u8, prev: Option<&AuditHash>, payload: &[u8]) -> AuditHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_SEPARATOR);
    hasher.update([marker]);
    if let Some(prev) = prev {
        hasher.update(&prev.bytes);
    }
    hasher.update(payload);
    AuditHash {
        algorithm: HashAlgorithm::Sha256,
        bytes: hasher.finalize().to_vec(),
    }
}

/// Constant-time verification of a non-chained digest
pub fn verify(payload: &[u8], expected: &AuditHash) -> bool {
    crypto::constant_time_eq(&compute(payload).bytes, &expected.bytes)
}

/// Constant-time verification of one chain link
pub fn verify_chained(prev: Option<&AuditHash>, payload: &[u8], expected: &AuditHash) -> bool {
    crypto::constant_time_eq(&compute_chained(prev, payload).bytes, &expected.bytes)
}

/// Verify a whole chain of `(payload, hash)` links in order
///
/// Returns the zero-based index of the first broken link, or `Ok(())`.
pub fn verify_chain(links: &[(Vec<u8>, AuditHash)]) -> Result<(), usize> {
    let mut prev: Option<&AuditHash> = None;
    for (index, (payload, hash)) in links.iter().enumerate() {
        if !verify_chained(prev, payload, hash) {
            return Err(index);
        }
        prev = Some(hash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chained_and_unchained_differ() {
        let unchained = compute(b"payload");
        let chained = compute_chained(None, b"payload");
        assert_ne!(unchained.bytes, chained.bytes);
        assert_eq!(unchained.bytes.len(), 32);
    }

    #[test]
    fn test_verify_roundtrip() {
        let hash = compute(b"payload");
        assert!(verify(b"payload", &hash));
        assert!(!verify(b"payloae", &hash));
    }

    #[test]
    fn test_chain_links_depend_on_previous() {
        let first = compute_chained(None, b"one");
        let second_a = compute_chained(Some(&first), b"two");
        let second_b = compute_chained(None, b"two");
        assert_ne!(second_a.bytes, second_b.bytes);
        assert!(verify_chained(Some(&first), b"two", &second_a));
        assert!(!verify_chained(None, b"two", &second_a));
    }

    #[test]
    fn test_verify_chain_detects_tamper() {
        let payloads: Vec<Vec<u8>> = (0..5).map(|i| format!("event-{i}").into_bytes()).collect();
        let mut links = Vec::new();
        let mut prev: Option<AuditHash> = None;
        for payload in &payloads {
            let hash = compute_chained(prev.as_ref(), payload);
            links.push((payload.clone(), hash.clone()));
            prev = Some(hash);
        }
        assert_eq!(verify_chain(&links), Ok(()));

        // Any byte change invalidates from that link onward
        links[2].0[0] ^= 0x01;
        assert_eq!(verify_chain(&links), Err(2));
    }

    #[test]
    fn test_verify_chain_empty() {
        assert_eq!(verify_chain(&[]), Ok(()));
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let hash = compute(b"abc");
        let encoded = hash.encode();
        assert!(encoded.starts_with("sha-256:"));
        assert!(!encoded.contains('='));
        assert_eq!(AuditHash::parse(&encoded).unwrap(), hash);
    }

    #[test]
    fn test_parse_accepts_hex() {
        let hash = compute(b"abc");
        let hex_form = format!("sha-256:{}", crypto::hex_encode(&hash.bytes));
        assert_eq!(AuditHash::parse(&hex_form).unwrap(), hash);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            AuditHash::parse("sha-256"),
            Err(AuditHashError::MissingSeparator)
        );
        assert!(matches!(
            AuditHash::parse("blake3:abcd"),
            Err(AuditHashError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            AuditHash::parse("sha-256:!!!"),
            Err(AuditHashError::BadEncoding)
        ));
        assert!(matches!(
            AuditHash::parse("sha-256:abcd"),
            Err(AuditHashError::WrongLength { .. })
        ));
    }
}
