//! Broker abstraction.
//!
//! The pipeline only talks to the broker through [`Broker`], which captures
//! the JetStream capabilities it relies on: idempotent declarations, acked
//! publish, pull fetch with explicit ack, a durable advisory subscription and
//! positional reads.
//!
//! - [`JetStreamBroker`] talks to a real NATS cluster.
//! - [`InMemoryBroker`] reproduces the same delivery semantics in-process.

mod jetstream;
mod memory;

pub use jetstream::JetStreamBroker;
pub use memory::InMemoryBroker;

use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::borrow::Cow;
use std::time::Duration;

/// Header used by JetStream to drop duplicate publishes inside the stream's
/// duplicate window.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Ordered header list. Repeated names are allowed.
pub type Headers = Vec<(String, String)>;

/// Storage durability class of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    File,
    Memory,
}

/// Retention policy of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep everything until limits are hit.
    Limits,
    /// Keep a message only while some consumer still has interest in it.
    Interest,
}

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    All,
    New,
}

/// Declarative stream definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageClass,
    pub retention: RetentionPolicy,
    pub replicas: usize,
    /// Maximum message age; `None` keeps messages forever.
    pub max_age: Option<Duration>,
}

impl StreamSpec {
    /// File-backed, limits-retention, single replica stream.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            storage: StorageClass::File,
            retention: RetentionPolicy::Limits,
            replicas: 1,
            max_age: None,
        }
    }

    pub fn with_storage(mut self, storage: StorageClass) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Declarative durable pull consumer definition. The ack policy is always
/// explicit: every delivery must be acknowledged on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: Option<String>,
    pub deliver_policy: DeliverPolicy,
    /// Total deliveries per message, first attempt included. Non-positive
    /// means unlimited.
    pub max_deliver: i64,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
}

/// Result of an idempotent declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declared {
    Created,
    AlreadyExists,
}

/// Opaque handle identifying one delivery for ack/nak.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Acknowledgement kinds the pipeline sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processing succeeded; never redeliver.
    Ack,
    /// Processing failed; redeliver without waiting for the ack timeout.
    Nak,
}

/// A message handed to the application by a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Position of the message in its stream.
    pub stream_sequence: u64,
    /// Delivery attempt counter, 1 on first delivery.
    pub delivered: u64,
    ack: AckToken,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        headers: Headers,
        stream_sequence: u64,
        delivered: u64,
        ack: AckToken,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            stream_sequence,
            delivered,
            ack,
        }
    }

    pub fn ack_token(&self) -> &AckToken {
        &self.ack
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }

    /// Payload as text, lossy for non UTF-8 bytes.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message read back from a stream by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub stream: String,
    pub subject: String,
    pub sequence: u64,
    pub payload: Bytes,
    pub headers: Headers,
}

impl StoredMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Broker confirmation of a durably stored publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
    /// The broker recognised the message id and kept the earlier copy.
    pub duplicate: bool,
}

/// Stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState {
    pub messages: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Durable subscription over a stream, used for the advisory feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: String,
}

/// Push-style feed of deliveries produced by [`Broker::subscribe`].
pub type InboundStream = BoxStream<'static, Delivery>;

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Capability set the pipeline needs from the message broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the stream unless one with the same name exists.
    async fn declare_stream(&self, spec: &StreamSpec) -> Result<Declared, BrokerError>;

    /// Create the durable consumer unless it exists.
    async fn declare_consumer(&self, spec: &ConsumerSpec) -> Result<Declared, BrokerError>;

    /// Publish and wait until the broker has stored the message.
    async fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt, BrokerError>;

    /// Pull up to `batch` messages, waiting at most `wait`. An empty result
    /// means nothing was available in time.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Acknowledge or reject a delivery.
    async fn acknowledge(&self, token: &AckToken, kind: AckKind) -> Result<(), BrokerError>;

    /// Open a long-lived durable subscription.
    async fn subscribe(&self, subscription: &Subscription) -> Result<InboundStream, BrokerError>;

    /// Read the message stored at `sequence`.
    async fn get_message(&self, stream: &str, sequence: u64) -> Result<StoredMessage, BrokerError>;

    /// Current stream counters.
    async fn stream_info(&self, stream: &str) -> Result<StreamState, BrokerError>;
}
