//! Error types for the dead-letter pipeline.

use thiserror::Error;

/// Error returned by a [`Broker`](crate::Broker) implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// JetStream API error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Consumer (fetch) error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement error
    #[error("Ack error: {0}")]
    Ack(String),

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Consumer not found
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// No message stored at the requested position
    #[error("Message {sequence} not found in stream {stream}")]
    MessageNotFound { stream: String, sequence: u64 },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl BrokerError {
    /// Whether the same call could succeed if repeated later.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Connection(_) | BrokerError::Timeout(_) => true,
            BrokerError::JetStream(msg) | BrokerError::Publish(msg) | BrokerError::Consumer(msg) => {
                mentions_timeout(msg)
            }
            BrokerError::StreamNotFound(_)
            | BrokerError::ConsumerNotFound(_)
            | BrokerError::MessageNotFound { .. } => false,
            BrokerError::Ack(_) | BrokerError::Subscription(_) => true,
        }
    }

    /// Whether the error only means "nothing arrived before the wait expired".
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::StreamNotFound(_)
                | BrokerError::ConsumerNotFound(_)
                | BrokerError::MessageNotFound { .. }
        )
    }

    /// Classify a pull failure. An expired pull request maps to `Timeout`.
    pub fn from_fetch(error: impl std::fmt::Display) -> Self {
        let text = error.to_string();
        if text.to_lowercase().contains("heartbeat") {
            Self::Timeout(text)
        } else {
            Self::Consumer(text)
        }
    }

    /// Create a JetStream error from an async_nats error.
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    /// Create a publish error.
    pub fn publish_error(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a consumer error.
    pub fn consumer_error(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }

    /// Classify a positional-read failure. The server reports a missing
    /// sequence as "no message found".
    pub fn from_get_message(stream: &str, sequence: u64, error: impl std::fmt::Display) -> Self {
        let text = error.to_string();
        let lowered = text.to_lowercase();
        if lowered.contains("no message found") || lowered.contains("not found") {
            Self::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            }
        } else {
            Self::JetStream(text)
        }
    }
}

fn mentions_timeout(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("timeout") || lowered.contains("timed out")
}

/// Error raised by the pipeline components.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// Broker call failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Advisory payload could not be decoded
    #[error("Invalid advisory: {0}")]
    Advisory(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Processor failure surfaced to the caller
    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

/// Failure returned by a [`Processor`](crate::Processor).
///
/// Expected during normal operation: it drives redelivery and, eventually,
/// dead-lettering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Processing failed: {message}")]
pub struct ProcessingError {
    pub message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type Result<T, E = DeadLetterError> = std::result::Result<T, E>;
