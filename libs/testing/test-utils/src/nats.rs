//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that creates a NATS container with JetStream for testing.

use async_nats::Client;
use core_config::nats::NatsConfig;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
/// JetStream is enabled, so streams, durable consumers and advisories behave
/// like in production.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Connection settings for code under test
/// let config = nats.config();
///
/// // Or a raw JetStream context for assertions
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Create a new test NATS instance with JetStream enabled
    ///
    /// Uses NATS latest image with JetStream (-js flag).
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client (useful for passing to services)
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream operations
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Connection settings pointing at this container
    pub fn config(&self) -> NatsConfig {
        NatsConfig::new(vec![self.connection_string.clone()], "dead-letter-test")
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_nats::jetstream::consumer::{pull, AckPolicy};
    use async_nats::jetstream::stream;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_nats_jetstream() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        jetstream
            .create_stream(stream::Config {
                name: "ORDERS".to_string(),
                subjects: vec!["orders.*".to_string()],
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");

        let ack = jetstream
            .publish("orders.new", "order_1".into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get ack");
        assert_eq!(ack.sequence, 1);

        let mut stream = jetstream
            .get_stream("ORDERS")
            .await
            .expect("Failed to get stream");
        let info = stream.info().await.expect("Failed to get stream info");
        assert_eq!(info.state.messages, 1);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_max_deliveries_advisory_is_captured() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        let orders = jetstream
            .create_stream(stream::Config {
                name: "ORDERS".to_string(),
                subjects: vec!["orders.*".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        let advisories = jetstream
            .create_stream(stream::Config {
                name: "ADVISORY".to_string(),
                subjects: vec!["$JS.EVENT.ADVISORY.>".to_string()],
                retention: stream::RetentionPolicy::Interest,
                ..Default::default()
            })
            .await
            .unwrap();
        let watcher = advisories
            .create_consumer(pull::Config {
                durable_name: Some("watcher".to_string()),
                filter_subject: "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.ORDERS.order-processor"
                    .to_string(),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .unwrap();
        let consumer = orders
            .create_consumer(pull::Config {
                durable_name: Some("order-processor".to_string()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: Duration::from_millis(500),
                max_deliver: 2,
                ..Default::default()
            })
            .await
            .unwrap();

        jetstream
            .publish("orders.new", "order_5".into())
            .await
            .unwrap()
            .await
            .unwrap();

        // Never ack; the server gives up after two deliveries.
        for _ in 0..3 {
            let mut batch = consumer
                .batch()
                .max_messages(1)
                .expires(Duration::from_secs(1))
                .messages()
                .await
                .unwrap();
            while batch.next().await.is_some() {}
        }

        let mut events = watcher
            .batch()
            .max_messages(1)
            .expires(Duration::from_secs(5))
            .messages()
            .await
            .unwrap();
        let event = events
            .next()
            .await
            .expect("No advisory received")
            .expect("Advisory error");
        let body: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(body["stream_seq"], 1);
        assert_eq!(body["deliveries"], 2);
    }
}
