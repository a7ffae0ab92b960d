//! Reliable event pipeline: producer, outbox, consumer error handling
//!
//! The concrete broker lives behind the [`EventTransport`] SPI; the pipeline
//! owns retries, trace propagation, the transactional-outbox state machine,
//! and quarantine routing.

mod backoff;
mod consumer;
mod outbox;
mod producer;

pub use backoff::Backoff;
pub use consumer::{
    ConsumerConfig, ConsumerErrorClass, ConsumerErrorHandler, ConsumerFailure, Disposition,
};
pub use outbox::{
    DrainStats, InMemoryOutboxStore, NewOutboxRecord, OutboxConfig, OutboxDrain,
    OutboxHousekeeper, OutboxRecord, OutboxStatus, OutboxStore, OutboxStoreError,
};
#[cfg(feature = "database")]
pub use outbox::PgOutboxStore;
pub use producer::{
    ProducerConfig, ProducerError, PublishOptions, PublishReceipt, ReliableProducer,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::headers::EventHeaders;

/// One record handed to the transport
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub topic: String,
    /// Partitioning key; records sharing a key preserve relative order
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: EventHeaders,
}

/// Transport failure with a retriability classification
#[derive(Debug, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
    /// Transient broker errors are retried; terminal errors propagate
    pub retriable: bool,
}

impl TransportError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Broker client SPI
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send(&self, record: &TransportRecord) -> Result<(), TransportError>;
}
