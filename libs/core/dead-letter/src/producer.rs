//! Publishes application payloads onto the primary stream.

use crate::broker::{Broker, OutboundMessage};
use crate::error::BrokerError;
use crate::metrics::PipelineMetrics;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`Producer::publish_all`].
#[derive(Debug, Default)]
pub struct PublishSummary {
    /// Sequence numbers assigned to the stored payloads, in input order.
    pub published: Vec<u64>,
    /// Input index and cause of every payload that was not stored.
    pub failures: Vec<(usize, BrokerError)>,
}

impl PublishSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Producer for the primary stream's subject.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    subject: String,
    metrics: PipelineMetrics,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, subject: impl Into<String>, metrics: PipelineMetrics) -> Self {
        Self {
            broker,
            subject: subject.into(),
            metrics,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish one payload and wait for the broker's ack.
    ///
    /// Returns the stream sequence of the stored message.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<u64, BrokerError> {
        let receipt = self
            .broker
            .publish(OutboundMessage::new(self.subject.clone(), payload))
            .await?;

        debug!(
            stream = %receipt.stream,
            subject = %self.subject,
            sequence = receipt.sequence,
            "Published message"
        );
        self.metrics.message_published();

        Ok(receipt.sequence)
    }

    /// Publish payloads in order. A failed publish is logged and the rest of
    /// the sequence is still published.
    pub async fn publish_all<I, P>(&self, payloads: I) -> PublishSummary
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let mut summary = PublishSummary::default();

        for (index, payload) in payloads.into_iter().enumerate() {
            match self.publish(payload).await {
                Ok(sequence) => summary.published.push(sequence),
                Err(e) => {
                    warn!(
                        subject = %self.subject,
                        index,
                        error = %e,
                        "Failed to publish message"
                    );
                    self.metrics.publish_failed();
                    summary.failures.push((index, e));
                }
            }
        }

        info!(
            subject = %self.subject,
            published = summary.published.len(),
            failed = summary.failures.len(),
            "Published batch"
        );

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, PublishReceipt};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_publish_failure_does_not_abort_sequence() {
        let next = Arc::new(AtomicU64::new(0));
        let mut broker = MockBroker::new();
        broker.expect_publish().times(4).returning(move |message| {
            if message.payload == "order_2" {
                return Err(BrokerError::publish_error("no responders"));
            }
            Ok(PublishReceipt {
                stream: "ORDERS".to_string(),
                sequence: next.fetch_add(1, Ordering::SeqCst) + 1,
                duplicate: false,
            })
        });

        let producer = Producer::new(
            Arc::new(broker),
            "orders.new",
            PipelineMetrics::new("ORDERS", "order-processor"),
        );
        let summary = producer
            .publish_all(["order_1", "order_2", "order_3", "order_4"])
            .await;

        assert_eq!(summary.published, vec![1, 2, 3]);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, 1);
        assert!(!summary.is_complete());
    }

    #[tokio::test]
    async fn test_publish_targets_configured_subject() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|message| message.subject == "orders.new" && message.headers.is_empty())
            .times(1)
            .returning(|_| {
                Ok(PublishReceipt {
                    stream: "ORDERS".to_string(),
                    sequence: 42,
                    duplicate: false,
                })
            });

        let producer = Producer::new(
            Arc::new(broker),
            "orders.new",
            PipelineMetrics::new("ORDERS", "order-processor"),
        );
        assert_eq!(producer.publish("order_1").await.unwrap(), 42);
    }
}
