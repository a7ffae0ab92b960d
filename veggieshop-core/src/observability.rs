//! Tracing initialization

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ServiceConfig;

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. Returns an error when a
/// subscriber is already installed.
pub fn init_tracing(config: &ServiceConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| e.to_string())
}
