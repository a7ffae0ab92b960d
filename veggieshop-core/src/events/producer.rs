//! Retrying, trace-propagating publisher

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::headers::{self, keys, Envelope, EventHeaders};
use crate::problem::{Problem, ProblemKind};
use crate::tenant::TenantId;

use super::backoff::Backoff;
use super::{EventTransport, TransportRecord};

/// Producer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt send timeout in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jitter ratio, clamped to `[0, 0.9]`
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            send_timeout_ms: default_send_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Per-publish envelope inputs
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub tenant: Option<TenantId>,
    /// Generated when absent
    pub event_id: Option<Uuid>,
    pub aggregate_id: Option<String>,
    pub event_family: Option<String>,
    pub entity_version: Option<i64>,
    pub schema_fingerprint: Option<String>,
    /// Inbound carrier headers; safe-to-propagate entries and the W3C trace
    /// pair are forwarded
    pub inbound: Option<EventHeaders>,
}

/// What a successful publish reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("send to {topic} failed after {attempts} attempt(s): {message}")]
    Exhausted {
        topic: String,
        attempts: u32,
        message: String,
    },
    #[error("send to {topic} timed out after {attempts} attempt(s)")]
    Timeout { topic: String, attempts: u32 },
    #[error("header assembly failed: {0}")]
    Headers(#[from] crate::headers::HeaderCodecError),
}

impl ProducerError {
    pub fn to_problem(&self) -> Problem {
        match self {
            Self::Timeout { .. } => {
                Problem::with_detail(ProblemKind::DependencyTimeout, self.to_string())
            }
            _ => Problem::with_detail(ProblemKind::DependencyUnavailable, self.to_string()),
        }
    }
}

struct Inner {
    transport: Arc<dyn EventTransport>,
    config: ProducerConfig,
    backoff: Backoff,
    rng: Mutex<StdRng>,
}

/// At-least-once publisher with bounded retries
#[derive(Clone)]
pub struct ReliableProducer {
    inner: Arc<Inner>,
}

impl ReliableProducer {
    pub fn new(transport: Arc<dyn EventTransport>, config: ProducerConfig) -> Self {
        Self::with_rng(transport, config, StdRng::from_os_rng())
    }

    /// Deterministic jitter for tests
    pub fn with_rng(
        transport: Arc<dyn EventTransport>,
        config: ProducerConfig,
        rng: StdRng,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.initial_backoff_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.max_backoff_ms),
            config.jitter_ratio,
        );
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                backoff,
                rng: Mutex::new(rng),
            }),
        }
    }

    /// Publish one record, retrying transient failures
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishReceipt, ProducerError> {
        let event_id = options.event_id.unwrap_or_else(Uuid::new_v4);
        let mut record = TransportRecord {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
            headers: self.build_headers(event_id, &options)?,
        };

        let max_attempts = self.inner.config.max_attempts.max(1);
        let send_timeout = Duration::from_millis(self.inner.config.send_timeout_ms);

        for attempt in 1..=max_attempts {
            record
                .headers
                .insert_str(keys::PRODUCER_ATTEMPT, &attempt.to_string())?;

            let span = tracing::info_span!(
                "produce",
                otel.kind = "producer",
                topic = record.topic.as_str(),
                attempt
            );
            let started = tokio::time::Instant::now();
            let outcome = tracing::Instrument::instrument(
                tokio::time::timeout(send_timeout, self.inner.transport.send(&record)),
                span,
            )
            .await;

            match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(
                        topic = record.topic.as_str(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "record published"
                    );
                    return Ok(PublishReceipt { event_id, attempts: attempt });
                }
                Ok(Err(err)) if err.retriable && attempt < max_attempts => {
                    let delay = self.next_delay(attempt);
                    tracing::warn!(
                        topic = record.topic.as_str(),
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retriable send failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => {
                    tracing::error!(topic = record.topic.as_str(), attempt, error = %err, "send failed");
                    return Err(ProducerError::Exhausted {
                        topic: record.topic,
                        attempts: attempt,
                        message: err.message,
                    });
                }
                Err(_) => {
                    tracing::error!(topic = record.topic.as_str(), attempt, "send timed out");
                    return Err(ProducerError::Timeout {
                        topic: record.topic,
                        attempts: attempt,
                    });
                }
            }
        }
        unreachable!("loop returns on the final attempt")
    }

    /// Publish on a spawned task; the send outlives caller cancellation
    pub fn publish_async(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> tokio::task::JoinHandle<Result<PublishReceipt, ProducerError>> {
        let producer = self.clone();
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        tokio::spawn(async move {
            producer
                .publish(&topic, key.as_deref(), payload, options)
                .await
        })
    }

    fn build_headers(
        &self,
        event_id: Uuid,
        options: &PublishOptions,
    ) -> Result<EventHeaders, crate::headers::HeaderCodecError> {
        let mut assembled = EventHeaders::new();
        if let Some(ref inbound) = options.inbound {
            headers::copy(inbound, &mut assembled, headers::is_safe_to_propagate)?;
            headers::propagate_w3c_trace_context(inbound, &mut assembled);
        }
        headers::attach_envelope(
            &mut assembled,
            &Envelope {
                tenant_id: options.tenant.as_ref().map(|t| t.as_str().to_string()),
                trace_id: None,
                schema_fingerprint: options.schema_fingerprint.clone(),
                entity_version: options.entity_version,
                event_id: Some(event_id),
                request_id: None,
            },
        )?;
        if let Some(ref aggregate) = options.aggregate_id {
            assembled.insert_if_absent(keys::AGGREGATE_ID, aggregate.as_bytes().to_vec())?;
        }
        if let Some(ref family) = options.event_family {
            assembled.insert_if_absent(keys::EVENT_FAMILY, family.as_bytes().to_vec())?;
        }
        Ok(assembled)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.inner.rng.lock().expect("producer rng lock");
        self.inner.backoff.delay(attempt, &mut *rng)
    }
}
