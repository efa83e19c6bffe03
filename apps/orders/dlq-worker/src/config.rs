//! Worker settings.

use core_config::{env_or_default, env_parse_or_default, ConfigError, FromEnv};
use dead_letter::{PipelineConfig, StreamConfig};
use std::time::Duration;

/// Order stream topology.
pub struct OrdersStream;

impl StreamConfig for OrdersStream {
    const STREAM_NAME: &'static str = "ORDERS";
    const SUBJECT: &'static str = "orders.*";
    const PUBLISH_SUBJECT: &'static str = "orders.new";
    const CONSUMER_NAME: &'static str = "order-processor";
    const DLQ_STREAM: &'static str = "DLQ";
    const DLQ_SUBJECT: &'static str = "dlq.orders";
}

/// Settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub primary_stream: String,
    pub dlq_stream: String,
    pub max_deliver: i64,
    pub fetch_batch: usize,
    pub fetch_wait: Duration,
    pub ack_wait: Duration,
    pub primary_replicas: usize,
    /// Number of `order_<n>` payloads published on startup.
    pub order_count: usize,
    /// Payload the processor always rejects.
    pub fail_payload: String,
    pub relocator_channel_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            primary_stream: OrdersStream::STREAM_NAME.to_string(),
            dlq_stream: OrdersStream::DLQ_STREAM.to_string(),
            max_deliver: OrdersStream::MAX_DELIVER,
            fetch_batch: 5,
            fetch_wait: Duration::from_secs(2),
            ack_wait: Duration::from_millis(OrdersStream::ACK_WAIT_MS),
            primary_replicas: 1,
            order_count: 10,
            fail_payload: "order_5".to_string(),
            relocator_channel_capacity: 64,
        }
    }
}

impl FromEnv for WorkerSettings {
    /// Reads from environment variables, defaults in parentheses:
    /// - PRIMARY_STREAM (ORDERS), DLQ_STREAM (DLQ)
    /// - MAX_DELIVER (3), FETCH_BATCH (5)
    /// - FETCH_WAIT_MS (2000), ACK_WAIT_MS (1000)
    /// - PRIMARY_REPLICAS (1)
    /// - ORDER_COUNT (10), FAIL_PAYLOAD (order_5)
    /// - RELOCATOR_CHANNEL_CAPACITY (64)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let fetch_wait_ms = env_parse_or_default("FETCH_WAIT_MS", defaults.fetch_wait.as_millis() as u64)?;
        let ack_wait_ms = env_parse_or_default("ACK_WAIT_MS", defaults.ack_wait.as_millis() as u64)?;

        let settings = Self {
            primary_stream: env_or_default("PRIMARY_STREAM", &defaults.primary_stream),
            dlq_stream: env_or_default("DLQ_STREAM", &defaults.dlq_stream),
            max_deliver: env_parse_or_default("MAX_DELIVER", defaults.max_deliver)?,
            fetch_batch: env_parse_or_default("FETCH_BATCH", defaults.fetch_batch)?,
            fetch_wait: Duration::from_millis(fetch_wait_ms),
            ack_wait: Duration::from_millis(ack_wait_ms),
            primary_replicas: env_parse_or_default("PRIMARY_REPLICAS", defaults.primary_replicas)?,
            order_count: env_parse_or_default("ORDER_COUNT", defaults.order_count)?,
            fail_payload: env_or_default("FAIL_PAYLOAD", &defaults.fail_payload),
            relocator_channel_capacity: env_parse_or_default(
                "RELOCATOR_CHANNEL_CAPACITY",
                defaults.relocator_channel_capacity,
            )?,
        };

        if settings.primary_replicas == 0 {
            return Err(ConfigError::Invalid("PRIMARY_REPLICAS must be at least 1".to_string()));
        }
        Ok(settings)
    }
}

impl WorkerSettings {
    /// Pipeline configuration for the order stream with these overrides.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(
            self.primary_stream.clone(),
            OrdersStream::SUBJECT,
            OrdersStream::PUBLISH_SUBJECT,
        )
        .with_consumer_name(OrdersStream::CONSUMER_NAME)
        .with_dead_letter(self.dlq_stream.clone(), OrdersStream::DLQ_SUBJECT)
        .with_advisory_stream(OrdersStream::ADVISORY_STREAM)
        .with_max_deliver(self.max_deliver)
        .with_ack_wait(self.ack_wait)
        .with_batch_size(self.fetch_batch)
        .with_fetch_wait(self.fetch_wait)
        .with_primary_replicas(self.primary_replicas)
        .with_relocator_channel_capacity(self.relocator_channel_capacity)
    }

    /// Payloads published on startup.
    pub fn orders(&self) -> Vec<String> {
        (1..=self.order_count).map(|i| format!("order_{i}")).collect()
    }
}
