//! Audit primitives: chained hashes, canonical metadata, event sink

mod hash;
mod metadata;
mod sink;

pub use hash::{
    compute, compute_chained, verify, verify_chain, verify_chained, AuditHash, AuditHashError,
    HashAlgorithm, DOMAIN_SEPARATOR,
};
pub use metadata::{AuditMetadata, AuditMetadataDraft, AuditMetadataError};
pub use sink::{AuditEvent, AuditSink, RecordingAuditSink, TracingAuditSink};
