//! Consumer error handling: classification, retry schedule, quarantine routing

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::clock::WallClock;
use crate::crypto;
use crate::headers::{self, keys, EventHeaders};

use super::backoff::Backoff;
use super::TransportRecord;

/// Error message header is truncated to this many chars
pub const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Consumer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Appended to the source topic to form the quarantine topic
    #[serde(default = "default_dlq_suffix")]
    pub dlq_suffix: String,
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_dlq_suffix() -> String {
    ".DLQ".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
            dlq_suffix: default_dlq_suffix(),
        }
    }
}

/// Per-record failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerErrorClass {
    /// Record can never succeed: quarantine immediately
    Deserialization,
    Authorization,
    UnsupportedVersion,
    InvalidTopic,
    SchemaContract,
    /// Network or broker transient: retry with backoff
    Transient,
}

impl ConsumerErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Deserialization => "deserialization",
            Self::Authorization => "authorization",
            Self::UnsupportedVersion => "unsupported-version",
            Self::InvalidTopic => "invalid-topic",
            Self::SchemaContract => "schema-contract",
            Self::Transient => "transient",
        }
    }
}

/// A processing failure, as reported by the record handler
#[derive(Debug, Clone)]
pub struct ConsumerFailure {
    pub class: ConsumerErrorClass,
    /// Error type name, e.g. `serde_json::Error`
    pub error_type: String,
    /// Root-cause type name when a cause chain exists
    pub root_type: Option<String>,
    /// Human-readable message; must not contain payload data
    pub message: String,
    /// Backtrace or stack rendering, hashed (never forwarded verbatim)
    pub stack: Option<String>,
}

/// What to do with a failed record
#[derive(Debug)]
pub enum Disposition {
    /// Schedule another attempt after the delay
    Retry { after: Duration, attempt: u32 },
    /// Route to the quarantine topic and commit the offset
    Quarantine(TransportRecord),
}

/// Decides retry vs quarantine and builds DLQ records
pub struct ConsumerErrorHandler {
    config: ConsumerConfig,
    backoff: Backoff,
    clock: Arc<dyn WallClock>,
    rng: Mutex<StdRng>,
}

impl ConsumerErrorHandler {
    pub fn new(config: ConsumerConfig, clock: Arc<dyn WallClock>) -> Self {
        Self::with_rng(config, clock, StdRng::from_os_rng())
    }

    pub fn with_rng(config: ConsumerConfig, clock: Arc<dyn WallClock>, rng: StdRng) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.initial_backoff_ms),
            2.0,
            Duration::from_millis(config.max_backoff_ms),
            config.jitter_ratio,
        );
        Self {
            config,
            backoff,
            clock,
            rng: Mutex::new(rng),
        }
    }

    /// Decide the disposition for attempt `attempt` (1-based) of a record
    pub fn handle(
        &self,
        record: &TransportRecord,
        failure: &ConsumerFailure,
        attempt: u32,
    ) -> Disposition {
        if failure.class.is_retryable() && attempt <= self.config.max_retries {
            let delay = {
                let mut rng = self.rng.lock().expect("consumer rng lock");
                self.backoff.delay(attempt, &mut *rng)
            };
            tracing::warn!(
                topic = record.topic.as_str(),
                class = failure.class.label(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "record processing failed, retrying"
            );
            return Disposition::Retry {
                after: delay,
                attempt: attempt + 1,
            };
        }

        tracing::error!(
            topic = record.topic.as_str(),
            class = failure.class.label(),
            attempt,
            "record quarantined"
        );
        Disposition::Quarantine(self.build_dlq_record(record, failure, attempt))
    }

    /// Quarantine topic for a source topic
    pub fn dlq_topic(&self, topic: &str) -> String {
        format!("{topic}{}", self.config.dlq_suffix)
    }

    fn build_dlq_record(
        &self,
        record: &TransportRecord,
        failure: &ConsumerFailure,
        attempt: u32,
    ) -> TransportRecord {
        let mut dlq_headers = EventHeaders::new();
        // Safe-to-propagate headers (which include the envelope keys) carry over
        let _ = headers::copy(&record.headers, &mut dlq_headers, headers::is_safe_to_propagate);
        headers::propagate_w3c_trace_context(&record.headers, &mut dlq_headers);

        let _ = dlq_headers.insert_str(keys::ERROR_CLASS, &failure.error_type);
        let root = failure
            .root_type
            .as_deref()
            .unwrap_or(&failure.error_type);
        let _ = dlq_headers.insert_str(keys::ERROR_ROOT_CLASS, root);
        let _ = dlq_headers.insert_str(keys::ERROR_MESSAGE, &sanitize_message(&failure.message));
        let stack_input = failure.stack.as_deref().unwrap_or(&failure.message);
        let stack_hash = &crypto::sha256_hex(stack_input.as_bytes())[..16];
        let _ = dlq_headers.insert_str(keys::ERROR_STACK_HASH, stack_hash);
        let _ = dlq_headers.insert_str(keys::RETRY_ATTEMPT, &attempt.to_string());
        let _ = dlq_headers.insert_timestamp_millis(keys::QUARANTINED_AT, self.clock.now_millis());

        TransportRecord {
            topic: self.dlq_topic(&record.topic),
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers: dlq_headers,
        }
    }
}

/// Single line, bounded length; callers keep payload data out of messages
fn sanitize_message(message: &str) -> String {
    let single_line: String = message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    single_line.trim().chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn record() -> TransportRecord {
        let mut headers = EventHeaders::new();
        headers.insert_str(keys::TENANT_ID, "acme").unwrap();
        headers.insert_str(keys::TRACEPARENT, "00-abc-def-01").unwrap();
        headers.insert_str("internal-note", "not forwarded").unwrap();
        TransportRecord {
            topic: "orders".to_string(),
            key: Some("k1".to_string()),
            payload: b"{}".to_vec(),
            headers,
        }
    }

    fn failure(class: ConsumerErrorClass) -> ConsumerFailure {
        ConsumerFailure {
            class,
            error_type: "serde_json::Error".to_string(),
            root_type: Some("io::Error".to_string()),
            message: "expected value at line 1".to_string(),
            stack: Some("frame-a\nframe-b".to_string()),
        }
    }

    fn handler() -> ConsumerErrorHandler {
        ConsumerErrorHandler::with_rng(
            ConsumerConfig {
                jitter_ratio: 0.0,
                ..Default::default()
            },
            ManualClock::new(1_700_000_000_000),
            StdRng::seed_from_u64(1),
        )
    }

    #[test]
    fn test_transient_retries_with_growing_delay() {
        let handler = handler();
        let rec = record();
        let transient = failure(ConsumerErrorClass::Transient);

        let first = handler.handle(&rec, &transient, 1);
        let second = handler.handle(&rec, &transient, 2);
        match (first, second) {
            (Disposition::Retry { after: a, attempt: 2 }, Disposition::Retry { after: b, attempt: 3 }) => {
                assert!(b > a);
            }
            other => panic!("expected retries, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_exhaustion_quarantines() {
        let handler = handler();
        let rec = record();
        let transient = failure(ConsumerErrorClass::Transient);
        match handler.handle(&rec, &transient, 6) {
            Disposition::Quarantine(dlq) => assert_eq!(dlq.topic, "orders.DLQ"),
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[test]
    fn test_non_retryable_quarantines_immediately() {
        let handler = handler();
        let rec = record();
        for class in [
            ConsumerErrorClass::Deserialization,
            ConsumerErrorClass::Authorization,
            ConsumerErrorClass::UnsupportedVersion,
            ConsumerErrorClass::InvalidTopic,
            ConsumerErrorClass::SchemaContract,
        ] {
            match handler.handle(&rec, &failure(class), 1) {
                Disposition::Quarantine(_) => {}
                other => panic!("{class:?} should quarantine, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_dlq_headers() {
        let handler = handler();
        let rec = record();
        let dlq = match handler.handle(&rec, &failure(ConsumerErrorClass::Deserialization), 3) {
            Disposition::Quarantine(dlq) => dlq,
            other => panic!("expected quarantine, got {other:?}"),
        };

        // Envelope and trace headers preserved; unsafe header dropped
        assert_eq!(dlq.headers.get_str(keys::TENANT_ID).unwrap().unwrap(), "acme");
        assert_eq!(
            dlq.headers.get_str(keys::TRACEPARENT).unwrap().unwrap(),
            "00-abc-def-01"
        );
        assert!(!dlq.headers.contains("internal-note"));

        assert_eq!(
            dlq.headers.get_str(keys::ERROR_CLASS).unwrap().unwrap(),
            "serde_json::Error"
        );
        assert_eq!(
            dlq.headers.get_str(keys::ERROR_ROOT_CLASS).unwrap().unwrap(),
            "io::Error"
        );
        assert_eq!(
            dlq.headers.get_str(keys::ERROR_MESSAGE).unwrap().unwrap(),
            "expected value at line 1"
        );
        assert_eq!(
            dlq.headers
                .get_str(keys::ERROR_STACK_HASH)
                .unwrap()
                .unwrap()
                .len(),
            16
        );
        assert_eq!(dlq.headers.get_str(keys::RETRY_ATTEMPT).unwrap().unwrap(), "3");
        assert_eq!(
            dlq.headers
                .get_timestamp_millis(keys::QUARANTINED_AT)
                .unwrap()
                .unwrap(),
            1_700_000_000_000
        );
        // Payload and key carried verbatim
        assert_eq!(dlq.payload, rec.payload);
        assert_eq!(dlq.key, rec.key);
    }

    #[test]
    fn test_message_sanitization() {
        let long = "m".repeat(1_000);
        assert_eq!(sanitize_message(&long).len(), MAX_ERROR_MESSAGE_LEN);
        assert_eq!(sanitize_message("a\nb\r\nc"), "a b  c");
    }

    #[test]
    fn test_custom_dlq_suffix() {
        let handler = ConsumerErrorHandler::with_rng(
            ConsumerConfig {
                dlq_suffix: ".quarantine".to_string(),
                ..Default::default()
            },
            ManualClock::new(0),
            StdRng::seed_from_u64(1),
        );
        assert_eq!(handler.dlq_topic("orders"), "orders.quarantine");
    }
}
