//! Pipeline configuration.

use crate::advisory::{max_deliveries_subject, ADVISORY_SUBJECTS};
use crate::broker::{
    ConsumerSpec, DeliverPolicy, RetentionPolicy, StorageClass, StreamSpec, Subscription,
};
use crate::error::DeadLetterError;
use crate::subject::captured_by;
use std::time::Duration;
use tracing::warn;

/// Stream configuration trait (type-safe constants).
///
/// # Example
///
/// ```rust
/// use dead_letter::{PipelineConfig, StreamConfig};
///
/// struct InvoiceStream;
///
/// impl StreamConfig for InvoiceStream {
///     const STREAM_NAME: &'static str = "INVOICES";
///     const SUBJECT: &'static str = "invoices.*";
///     const PUBLISH_SUBJECT: &'static str = "invoices.new";
///     const CONSUMER_NAME: &'static str = "invoice-processor";
///     const DLQ_STREAM: &'static str = "INVOICES_DLQ";
///     const DLQ_SUBJECT: &'static str = "dlq.invoices";
/// }
///
/// let config = PipelineConfig::from_stream::<InvoiceStream>();
/// assert_eq!(config.consumer.max_deliver, 3);
/// ```
pub trait StreamConfig {
    /// Primary stream name (e.g., "ORDERS")
    const STREAM_NAME: &'static str;

    /// Subject pattern stored by the primary stream (e.g., "orders.*")
    const SUBJECT: &'static str;

    /// Subject the producer publishes on (e.g., "orders.new")
    const PUBLISH_SUBJECT: &'static str;

    /// Durable consumer name (e.g., "order-processor")
    const CONSUMER_NAME: &'static str;

    /// Dead-letter stream name (e.g., "DLQ")
    const DLQ_STREAM: &'static str;

    /// Dead-letter subject (e.g., "dlq.orders")
    const DLQ_SUBJECT: &'static str;

    /// Advisory stream name
    const ADVISORY_STREAM: &'static str = "ADVISORY";

    /// Total deliveries before a message is exhausted (default: 3)
    const MAX_DELIVER: i64 = 3;

    /// Ack wait timeout in milliseconds (default: 1s, shorter than the fetch wait)
    const ACK_WAIT_MS: u64 = 1_000;
}

/// What the delivery loop does with a message the processor rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureAction {
    /// Leave it unacknowledged; the broker redelivers after `ack_wait`.
    #[default]
    Withhold,
    /// Negative-ack it so the broker redelivers right away.
    Nak,
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stream holding application messages.
    pub primary: StreamSpec,
    /// Stream holding relocated failures.
    pub dead_letter: StreamSpec,
    /// Stream capturing broker advisories.
    pub advisory: StreamSpec,
    /// Subject the producer publishes on; must be captured by `primary`.
    pub publish_subject: String,
    /// Subject dead-letter entries are published on.
    pub dead_letter_subject: String,
    /// Durable pull consumer over `primary`.
    pub consumer: ConsumerSpec,
    /// Durable name of the relocator's consumer on the advisory stream.
    pub relocator_durable: String,
    /// Maximum messages per fetch.
    pub batch_size: usize,
    /// How long a single fetch waits for messages.
    pub fetch_wait: Duration,
    pub failure_action: FailureAction,
    /// Pause between empty fetches in continuous mode.
    pub idle_pause: Duration,
    /// Capacity of the channel between the advisory feed and the relocator.
    pub relocator_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("ORDERS", "orders.*", "orders.new").with_consumer_name("order-processor")
    }
}

impl PipelineConfig {
    /// Configuration for a primary stream; the dead-letter side defaults to
    /// `DLQ` / `dlq.<stream lowercase>`.
    pub fn new(
        stream_name: impl Into<String>,
        subject: impl Into<String>,
        publish_subject: impl Into<String>,
    ) -> Self {
        let stream_name = stream_name.into();
        let dead_letter_subject = format!("dlq.{}", stream_name.to_lowercase());
        let consumer_name = format!("{}-processor", stream_name.to_lowercase());

        Self {
            primary: StreamSpec::new(stream_name.clone(), vec![subject.into()]),
            dead_letter: StreamSpec::new("DLQ", vec![dead_letter_subject.clone()]),
            advisory: StreamSpec::new("ADVISORY", vec![ADVISORY_SUBJECTS.to_string()])
                .with_storage(StorageClass::File)
                .with_retention(RetentionPolicy::Interest),
            publish_subject: publish_subject.into(),
            dead_letter_subject,
            consumer: ConsumerSpec {
                stream: stream_name,
                durable_name: consumer_name,
                filter_subject: None,
                deliver_policy: DeliverPolicy::All,
                max_deliver: 3,
                ack_wait: Duration::from_secs(1),
            },
            relocator_durable: "dlq-relocator".to_string(),
            batch_size: 5,
            fetch_wait: Duration::from_secs(2),
            failure_action: FailureAction::Withhold,
            idle_pause: Duration::from_millis(100),
            relocator_channel_capacity: 64,
        }
    }

    /// Create from a StreamConfig trait.
    pub fn from_stream<S: StreamConfig>() -> Self {
        Self::new(S::STREAM_NAME, S::SUBJECT, S::PUBLISH_SUBJECT)
            .with_consumer_name(S::CONSUMER_NAME)
            .with_dead_letter(S::DLQ_STREAM, S::DLQ_SUBJECT)
            .with_advisory_stream(S::ADVISORY_STREAM)
            .with_max_deliver(S::MAX_DELIVER)
            .with_ack_wait(Duration::from_millis(S::ACK_WAIT_MS))
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer.durable_name = name.into();
        self
    }

    pub fn with_dead_letter(mut self, stream: impl Into<String>, subject: impl Into<String>) -> Self {
        let subject = subject.into();
        self.dead_letter.name = stream.into();
        self.dead_letter.subjects = vec![subject.clone()];
        self.dead_letter_subject = subject;
        self
    }

    pub fn with_advisory_stream(mut self, name: impl Into<String>) -> Self {
        self.advisory.name = name.into();
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.consumer.max_deliver = max_deliver;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.consumer.ack_wait = ack_wait;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn with_failure_action(mut self, action: FailureAction) -> Self {
        self.failure_action = action;
        self
    }

    pub fn with_primary_replicas(mut self, replicas: usize) -> Self {
        self.primary.replicas = replicas;
        self
    }

    pub fn with_storage(mut self, storage: StorageClass) -> Self {
        self.primary.storage = storage;
        self.dead_letter.storage = storage;
        self.advisory.storage = storage;
        self
    }

    pub fn with_relocator_channel_capacity(mut self, capacity: usize) -> Self {
        self.relocator_channel_capacity = capacity;
        self
    }

    pub fn with_idle_pause(mut self, pause: Duration) -> Self {
        self.idle_pause = pause;
        self
    }

    /// Subscription the relocator opens on the advisory stream.
    pub fn advisory_subscription(&self) -> Subscription {
        Subscription {
            stream: self.advisory.name.clone(),
            durable_name: self.relocator_durable.clone(),
            filter_subject: max_deliveries_subject(&self.primary.name, &self.consumer.durable_name),
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), DeadLetterError> {
        if self.consumer.max_deliver < 1 {
            return Err(DeadLetterError::Config(
                "max_deliver must be at least 1 for messages to ever be dead-lettered".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(DeadLetterError::Config("batch_size must be positive".to_string()));
        }
        if self.fetch_wait.is_zero() {
            return Err(DeadLetterError::Config("fetch_wait must be positive".to_string()));
        }
        if self.relocator_channel_capacity == 0 {
            return Err(DeadLetterError::Config(
                "relocator_channel_capacity must be positive".to_string(),
            ));
        }
        if self.consumer.stream != self.primary.name {
            return Err(DeadLetterError::Config(format!(
                "consumer reads {} but the primary stream is {}",
                self.consumer.stream, self.primary.name
            )));
        }
        if !captured_by(&self.primary.subjects, &self.publish_subject) {
            return Err(DeadLetterError::Config(format!(
                "publish subject {} is not stored by stream {}",
                self.publish_subject, self.primary.name
            )));
        }
        if captured_by(&self.primary.subjects, &self.dead_letter_subject) {
            return Err(DeadLetterError::Config(format!(
                "dead-letter subject {} would be stored back into {}",
                self.dead_letter_subject, self.primary.name
            )));
        }
        if !captured_by(&self.dead_letter.subjects, &self.dead_letter_subject) {
            return Err(DeadLetterError::Config(format!(
                "dead-letter subject {} is not stored by stream {}",
                self.dead_letter_subject, self.dead_letter.name
            )));
        }
        if self.consumer.ack_wait >= self.fetch_wait {
            warn!(
                ack_wait_ms = self.consumer.ack_wait.as_millis() as u64,
                fetch_wait_ms = self.fetch_wait.as_millis() as u64,
                "ack_wait is not shorter than fetch_wait; drain mode stops before withheld messages are redelivered"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStream;

    impl StreamConfig for TestStream {
        const STREAM_NAME: &'static str = "TEST_ORDERS";
        const SUBJECT: &'static str = "test.orders.*";
        const PUBLISH_SUBJECT: &'static str = "test.orders.new";
        const CONSUMER_NAME: &'static str = "test-processor";
        const DLQ_STREAM: &'static str = "TEST_DLQ";
        const DLQ_SUBJECT: &'static str = "test.dlq.orders";
        const MAX_DELIVER: i64 = 5;
    }

    #[test]
    fn test_default_matches_reference_topology() {
        let config = PipelineConfig::default();
        assert_eq!(config.primary.name, "ORDERS");
        assert_eq!(config.primary.subjects, vec!["orders.*".to_string()]);
        assert_eq!(config.dead_letter.name, "DLQ");
        assert_eq!(config.dead_letter_subject, "dlq.orders");
        assert_eq!(config.advisory.subjects, vec!["$JS.EVENT.ADVISORY.>".to_string()]);
        assert_eq!(config.advisory.retention, RetentionPolicy::Interest);
        assert_eq!(config.consumer.durable_name, "order-processor");
        assert_eq!(config.consumer.max_deliver, 3);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.fetch_wait, Duration::from_secs(2));
        assert!(config.consumer.ack_wait < config.fetch_wait);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_stream() {
        let config = PipelineConfig::from_stream::<TestStream>();
        assert_eq!(config.primary.name, "TEST_ORDERS");
        assert_eq!(config.consumer.stream, "TEST_ORDERS");
        assert_eq!(config.consumer.durable_name, "test-processor");
        assert_eq!(config.dead_letter.name, "TEST_DLQ");
        assert_eq!(config.dead_letter.subjects, vec!["test.dlq.orders".to_string()]);
        assert_eq!(config.consumer.max_deliver, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_advisory_subscription_targets_consumer() {
        let subscription = PipelineConfig::from_stream::<TestStream>().advisory_subscription();
        assert_eq!(subscription.stream, "ADVISORY");
        assert_eq!(
            subscription.filter_subject,
            "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.TEST_ORDERS.test-processor"
        );
    }

    #[test]
    fn test_validate_rejects_unlimited_deliveries() {
        let err = PipelineConfig::default().with_max_deliver(-1).validate().unwrap_err();
        assert!(err.to_string().contains("max_deliver"));
    }

    #[test]
    fn test_validate_rejects_dead_letter_loop() {
        let err = PipelineConfig::default()
            .with_dead_letter("DLQ", "orders.dead")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("stored back"));
    }

    #[test]
    fn test_validate_rejects_uncaptured_publish_subject() {
        let config = PipelineConfig::new("ORDERS", "orders.*", "orders.eu.new");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_batch() {
        assert!(PipelineConfig::default().with_batch_size(0).validate().is_err());
    }
}
