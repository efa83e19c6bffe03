//! Moves exhausted messages onto the dead-letter stream.
//!
//! The relocator follows the max-deliveries advisories of the primary
//! consumer. For each advisory it reads the original message by stream
//! position and republishes its payload on the dead-letter subject.
//! Relocation is best effort: a missing original or a failed publish is
//! logged and the advisory is dropped.

use crate::advisory::MaxDeliveriesAdvisory;
use crate::broker::{
    AckKind, Broker, Delivery, OutboundMessage, PublishReceipt, StoredMessage, Subscription,
    MSG_ID_HEADER,
};
use crate::config::PipelineConfig;
use crate::error::{BrokerError, DeadLetterError};
use crate::metrics::PipelineMetrics;
use crate::shutdown::wait_for_shutdown;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Stream the dead-lettered message was read from.
pub const ORIGIN_STREAM_HEADER: &str = "Dlq-Origin-Stream";
/// Sequence of the dead-lettered message in its origin stream.
pub const ORIGIN_SEQUENCE_HEADER: &str = "Dlq-Origin-Sequence";
pub const ORIGIN_SUBJECT_HEADER: &str = "Dlq-Origin-Subject";
/// Consumer that exhausted its deliveries.
pub const ORIGIN_CONSUMER_HEADER: &str = "Dlq-Origin-Consumer";
pub const DELIVERIES_HEADER: &str = "Dlq-Deliveries";

/// Headers reserved for the broker; never copied onto a dead-letter entry.
const BROKER_HEADER_PREFIX: &str = "Nats-";

/// Counters of one relocator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocatorReport {
    /// Advisories received.
    pub events: u64,
    pub relocated: u64,
    /// Relocations the broker recognised as already stored.
    pub duplicates: u64,
    pub failed: u64,
}

/// Build the dead-letter entry for `original`.
///
/// The payload is kept byte for byte. Original headers are copied and the
/// origin is recorded in `Dlq-*` headers. The message id is derived from the
/// origin position so a replayed advisory is deduplicated by the broker.
pub fn dead_letter_entry(
    advisory: &MaxDeliveriesAdvisory,
    original: &StoredMessage,
    dead_letter_subject: &str,
) -> OutboundMessage {
    let copied = original
        .headers
        .iter()
        .filter(|(name, _)| {
            !name.starts_with(BROKER_HEADER_PREFIX) && !name.starts_with("Dlq-")
        })
        .cloned();

    OutboundMessage::new(dead_letter_subject, original.payload.clone())
        .with_headers(copied)
        .with_header(ORIGIN_STREAM_HEADER, original.stream.clone())
        .with_header(ORIGIN_SEQUENCE_HEADER, original.sequence.to_string())
        .with_header(ORIGIN_SUBJECT_HEADER, original.subject.clone())
        .with_header(ORIGIN_CONSUMER_HEADER, advisory.consumer.clone())
        .with_header(DELIVERIES_HEADER, advisory.deliveries.to_string())
        .with_header(MSG_ID_HEADER, format!("{}:{}", original.stream, original.sequence))
}

/// Dead-letter relocator.
pub struct DeadLetterRelocator {
    broker: Arc<dyn Broker>,
    dead_letter_subject: String,
    subscription: Subscription,
    capacity: usize,
    metrics: PipelineMetrics,
}

impl DeadLetterRelocator {
    pub fn new(broker: Arc<dyn Broker>, config: &PipelineConfig) -> Self {
        Self {
            broker,
            dead_letter_subject: config.dead_letter_subject.clone(),
            subscription: config.advisory_subscription(),
            capacity: config.relocator_channel_capacity,
            metrics: PipelineMetrics::new(&config.primary.name, &config.consumer.durable_name),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Copy the message named by `advisory` onto the dead-letter subject.
    #[instrument(skip(self, advisory), fields(stream = %advisory.stream, sequence = advisory.stream_seq))]
    pub async fn relocate(
        &self,
        advisory: &MaxDeliveriesAdvisory,
    ) -> Result<PublishReceipt, BrokerError> {
        let original = self
            .broker
            .get_message(&advisory.stream, advisory.stream_seq)
            .await?;

        let entry = dead_letter_entry(advisory, &original, &self.dead_letter_subject);
        self.broker.publish(entry).await
    }

    /// Handle one advisory delivery. The advisory is acknowledged whatever
    /// the outcome; failed relocations are not retried.
    pub async fn handle_event(&self, event: Delivery, report: &mut RelocatorReport) {
        report.events += 1;

        match MaxDeliveriesAdvisory::decode(&event.payload) {
            Ok(advisory) => self.relocate_logged(&advisory, report).await,
            Err(e) => {
                warn!(subject = %event.subject, error = %e, "Dropping undecodable advisory");
                report.failed += 1;
                self.metrics.relocation_failed("decode");
            }
        }

        if let Err(e) = self.broker.acknowledge(event.ack_token(), AckKind::Ack).await {
            warn!(error = %e, "Failed to ack advisory");
        }
    }

    async fn relocate_logged(&self, advisory: &MaxDeliveriesAdvisory, report: &mut RelocatorReport) {
        debug!(
            stream = %advisory.stream,
            consumer = %advisory.consumer,
            sequence = advisory.stream_seq,
            deliveries = advisory.deliveries,
            "Max deliveries advisory"
        );

        match self.relocate(advisory).await {
            Ok(receipt) if receipt.duplicate => {
                report.duplicates += 1;
                info!(
                    stream = %advisory.stream,
                    sequence = advisory.stream_seq,
                    dlq_sequence = receipt.sequence,
                    "Message already dead-lettered"
                );
            }
            Ok(receipt) => {
                report.relocated += 1;
                self.metrics.message_dead_lettered();
                info!(
                    stream = %advisory.stream,
                    sequence = advisory.stream_seq,
                    dlq_stream = %receipt.stream,
                    dlq_sequence = receipt.sequence,
                    "Moved message to dead-letter stream"
                );
            }
            Err(e) if e.is_not_found() => {
                report.failed += 1;
                self.metrics.relocation_failed("not_found");
                warn!(
                    stream = %advisory.stream,
                    sequence = advisory.stream_seq,
                    error = %e,
                    "Original message is gone, dropping advisory"
                );
            }
            Err(e) => {
                report.failed += 1;
                self.metrics.relocation_failed("broker");
                error!(
                    stream = %advisory.stream,
                    sequence = advisory.stream_seq,
                    error = %e,
                    "Failed to relocate message"
                );
            }
        }
    }

    /// Open the advisory subscription and start the relocation tasks.
    ///
    /// A forwarder task moves advisories from the broker into a bounded
    /// channel until shutdown. A handler task relocates them one by one and
    /// finishes the buffered ones after the forwarder stops.
    pub async fn spawn(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RelocatorHandle, DeadLetterError> {
        let mut events = self.broker.subscribe(&self.subscription).await?;
        let (tx, mut rx) = mpsc::channel::<Delivery>(self.capacity);

        info!(
            stream = %self.subscription.stream,
            filter = %self.subscription.filter_subject,
            capacity = self.capacity,
            "Starting dead-letter relocator"
        );

        let mut forwarder_shutdown = shutdown;
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut forwarder_shutdown) => break,
                    event = events.next() => match event {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("Advisory subscription closed");
                            break;
                        }
                    },
                }
            }
            debug!("Advisory forwarder stopped");
        });

        let relocator = self;
        let handler = tokio::spawn(async move {
            let mut report = RelocatorReport::default();
            while let Some(event) = rx.recv().await {
                relocator.handle_event(event, &mut report).await;
            }
            info!(
                events = report.events,
                relocated = report.relocated,
                failed = report.failed,
                "Dead-letter relocator stopped"
            );
            report
        });

        Ok(RelocatorHandle { forwarder, handler })
    }
}

/// Running relocator tasks.
pub struct RelocatorHandle {
    forwarder: JoinHandle<()>,
    handler: JoinHandle<RelocatorReport>,
}

impl RelocatorHandle {
    /// Wait for both tasks after shutdown was signalled.
    pub async fn join(self) -> RelocatorReport {
        if let Err(e) = self.forwarder.await {
            error!(error = %e, "Advisory forwarder task failed");
        }
        match self.handler.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Relocator task failed");
                RelocatorReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::max_deliveries_subject;
    use crate::broker::{AckToken, InMemoryBroker, MockBroker};
    use crate::shutdown;
    use crate::topology::TopologyProvisioner;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    fn advisory_event(stream_seq: u64) -> Delivery {
        let advisory = MaxDeliveriesAdvisory::new("ORDERS", "order-processor", stream_seq, 3);
        Delivery::new(
            advisory.subject(),
            advisory.encode().unwrap(),
            Vec::new(),
            1,
            1,
            AckToken::new("advisory.1"),
        )
    }

    fn stored(sequence: u64, payload: &'static str) -> StoredMessage {
        StoredMessage {
            stream: "ORDERS".to_string(),
            subject: "orders.new".to_string(),
            sequence,
            payload: Bytes::from_static(payload.as_bytes()),
            headers: vec![
                ("X-Trace".to_string(), "abc".to_string()),
                (MSG_ID_HEADER.to_string(), "client-id".to_string()),
            ],
        }
    }

    #[test]
    fn test_dead_letter_entry_keeps_payload_and_records_origin() {
        let advisory = MaxDeliveriesAdvisory::new("ORDERS", "order-processor", 5, 3);
        let entry = dead_letter_entry(&advisory, &stored(5, "order_5"), "dlq.orders");

        assert_eq!(entry.subject, "dlq.orders");
        assert_eq!(entry.payload, "order_5");
        assert_eq!(entry.header(ORIGIN_STREAM_HEADER), Some("ORDERS"));
        assert_eq!(entry.header(ORIGIN_SEQUENCE_HEADER), Some("5"));
        assert_eq!(entry.header(ORIGIN_SUBJECT_HEADER), Some("orders.new"));
        assert_eq!(entry.header(ORIGIN_CONSUMER_HEADER), Some("order-processor"));
        assert_eq!(entry.header(DELIVERIES_HEADER), Some("3"));
        assert_eq!(entry.header("X-Trace"), Some("abc"));
        assert_eq!(entry.header(MSG_ID_HEADER), Some("ORDERS:5"));
        assert_eq!(
            entry.headers.iter().filter(|(n, _)| n == MSG_ID_HEADER).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_original_is_dropped_without_publish() {
        let mut broker = MockBroker::new();
        broker.expect_get_message().times(1).returning(|stream, sequence| {
            Err(BrokerError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            })
        });
        broker.expect_publish().never();
        broker
            .expect_acknowledge()
            .withf(|token, kind| token.as_str() == "advisory.1" && *kind == AckKind::Ack)
            .times(1)
            .returning(|_, _| Ok(()));

        let relocator = DeadLetterRelocator::new(Arc::new(broker), &PipelineConfig::default());
        let mut report = RelocatorReport::default();
        relocator.handle_event(advisory_event(5), &mut report).await;

        assert_eq!(report.events, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.relocated, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_retried() {
        let mut broker = MockBroker::new();
        broker
            .expect_get_message()
            .times(1)
            .returning(|_, sequence| Ok(stored(sequence, "order_5")));
        broker
            .expect_publish()
            .times(1)
            .returning(|_| Err(BrokerError::publish_error("no responders")));
        broker.expect_acknowledge().times(1).returning(|_, _| Ok(()));

        let relocator = DeadLetterRelocator::new(Arc::new(broker), &PipelineConfig::default());
        let mut report = RelocatorReport::default();
        relocator.handle_event(advisory_event(5), &mut report).await;

        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_relocation_publishes_on_dead_letter_subject() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();

        let mut broker = MockBroker::new();
        broker
            .expect_get_message()
            .times(1)
            .returning(|_, sequence| Ok(stored(sequence, "order_5")));
        broker.expect_publish().times(1).returning(move |message| {
            sink.lock().unwrap().push(message);
            Ok(PublishReceipt {
                stream: "DLQ".to_string(),
                sequence: 1,
                duplicate: false,
            })
        });
        broker.expect_acknowledge().times(1).returning(|_, _| Ok(()));

        let relocator = DeadLetterRelocator::new(Arc::new(broker), &PipelineConfig::default());
        let mut report = RelocatorReport::default();
        relocator.handle_event(advisory_event(5), &mut report).await;

        assert_eq!(report.relocated, 1);
        let published = published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "dlq.orders");
        assert_eq!(published[0].payload, "order_5");
        assert_eq!(published[0].header(ORIGIN_SEQUENCE_HEADER), Some("5"));
    }

    #[tokio::test]
    async fn test_garbage_advisory_is_acked_and_counted() {
        let mut broker = MockBroker::new();
        broker.expect_get_message().never();
        broker.expect_acknowledge().times(1).returning(|_, _| Ok(()));

        let relocator = DeadLetterRelocator::new(Arc::new(broker), &PipelineConfig::default());
        let mut report = RelocatorReport::default();
        let event = Delivery::new(
            max_deliveries_subject("ORDERS", "order-processor"),
            Bytes::from_static(b"not json"),
            Vec::new(),
            1,
            1,
            AckToken::new("advisory.1"),
        );
        relocator.handle_event(event, &mut report).await;

        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_spawned_relocator_moves_replayed_advisories() {
        let broker = Arc::new(InMemoryBroker::new());
        let config = PipelineConfig::default();
        assert!(TopologyProvisioner::new(broker.clone()).provision(&config).await.is_complete());

        broker
            .publish(OutboundMessage::new("orders.new", "order_5"))
            .await
            .unwrap();
        let advisory = MaxDeliveriesAdvisory::new("ORDERS", "order-processor", 1, 3);
        // Same advisory twice.
        for _ in 0..2 {
            broker
                .publish(OutboundMessage::new(advisory.subject(), advisory.encode().unwrap()))
                .await
                .unwrap();
        }

        let (tx, rx) = shutdown::channel();
        let relocator = Arc::new(DeadLetterRelocator::new(broker.clone(), &config));
        let handle = relocator.spawn(rx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let report = handle.join().await;

        assert_eq!(report.events, 2);
        assert_eq!(report.relocated, 1);
        assert_eq!(report.duplicates, 1);

        let entries = broker.messages("DLQ");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "order_5");
        assert_eq!(entries[0].header(ORIGIN_STREAM_HEADER), Some("ORDERS"));
    }
}
