//! Consistency engine: per-tenant watermarks, signed tokens, read-your-writes

mod gate;
mod token;
mod watermark;

pub use gate::{ConsistencyConfig, ConsistencyEngine, GateOutcome, RequestConsistency};
pub use token::{
    ConsistencyToken, HmacTokenSigner, TokenError, TokenSigner, TOKEN_FORMAT_VERSION,
};
pub use watermark::{InMemoryWatermarkStore, WatermarkStore, WatermarkStoreError};
