//! Pull/ack loop over the durable consumer.

use crate::broker::{AckKind, Broker, Delivery};
use crate::config::{FailureAction, PipelineConfig};
use crate::error::BrokerError;
use crate::metrics::PipelineMetrics;
use crate::processor::Processor;
use crate::shutdown::{is_shutdown, wait_for_shutdown};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Transient fetch errors retried in a row before a drain gives up.
const MAX_FETCH_RETRIES: u32 = 3;

/// Counters collected while the loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Non-empty batches handled.
    pub batches: u64,
    /// Deliveries handed to the processor, redeliveries included.
    pub delivered: u64,
    pub acked: u64,
    /// Deliveries the processor failed.
    pub rejected: u64,
    pub redeliveries: u64,
    /// Acks or naks the broker did not confirm.
    pub ack_failures: u64,
    /// Fetches that failed with something other than an expired wait.
    pub fetch_errors: u64,
}

enum Fetched {
    Batch(Vec<Delivery>),
    Empty,
    Shutdown,
}

/// Pulls batches from the durable consumer and applies the processor to
/// each delivery in order.
pub struct DeliveryLoop {
    broker: Arc<dyn Broker>,
    processor: Arc<dyn Processor>,
    stream: String,
    consumer: String,
    batch_size: usize,
    fetch_wait: Duration,
    failure_action: FailureAction,
    idle_pause: Duration,
    metrics: PipelineMetrics,
}

impl DeliveryLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<dyn Processor>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            broker,
            processor,
            stream: config.consumer.stream.clone(),
            consumer: config.consumer.durable_name.clone(),
            batch_size: config.batch_size,
            fetch_wait: config.fetch_wait,
            failure_action: config.failure_action,
            idle_pause: config.idle_pause,
            metrics: PipelineMetrics::new(&config.consumer.stream, &config.consumer.durable_name),
        }
    }

    /// Pull until a fetch comes back empty within the wait window, or until
    /// shutdown.
    ///
    /// A fetch timeout is the normal end of available work. Transient broker
    /// errors are retried after a pause, up to `MAX_FETCH_RETRIES` in a row;
    /// any other fetch error is logged and ends the drain.
    pub async fn drain(&self, shutdown: &mut watch::Receiver<bool>) -> DeliveryReport {
        info!(
            stream = %self.stream,
            consumer = %self.consumer,
            processor = self.processor.name(),
            "Draining consumer"
        );

        let mut report = DeliveryReport::default();
        let mut retries = 0;
        loop {
            match self.next_batch(shutdown).await {
                Ok(Fetched::Batch(batch)) => {
                    retries = 0;
                    self.handle_batch(batch, &mut report).await;
                }
                Ok(Fetched::Empty) => {
                    info!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        "No more messages"
                    );
                    break;
                }
                Ok(Fetched::Shutdown) => {
                    info!("Shutdown signal received, stopping drain");
                    break;
                }
                Err(e) => {
                    report.fetch_errors += 1;
                    if !e.is_transient() || retries >= MAX_FETCH_RETRIES {
                        warn!(
                            stream = %self.stream,
                            consumer = %self.consumer,
                            error = %e,
                            "Fetch failed, stopping drain"
                        );
                        break;
                    }
                    retries += 1;
                    warn!(error = %e, attempt = retries, "Fetch failed, retrying");
                    tokio::select! {
                        _ = wait_for_shutdown(shutdown) => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(
            delivered = report.delivered,
            acked = report.acked,
            rejected = report.rejected,
            fetch_errors = report.fetch_errors,
            "Drain finished"
        );
        report
    }

    /// Keep pulling until shutdown. Errors are logged and retried after a
    /// pause.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DeliveryReport {
        info!(
            stream = %self.stream,
            consumer = %self.consumer,
            processor = self.processor.name(),
            "Starting delivery loop"
        );

        let mut report = DeliveryReport::default();
        loop {
            let pause = match self.next_batch(&mut shutdown).await {
                Ok(Fetched::Batch(batch)) => {
                    self.handle_batch(batch, &mut report).await;
                    continue;
                }
                Ok(Fetched::Empty) => self.idle_pause,
                Ok(Fetched::Shutdown) => break,
                Err(e) => {
                    report.fetch_errors += 1;
                    error!(error = %e, "Error fetching batch");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Delivery loop stopped");
        report
    }

    async fn next_batch(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Fetched, BrokerError> {
        if is_shutdown(shutdown) {
            return Ok(Fetched::Shutdown);
        }

        let fetched = tokio::select! {
            _ = wait_for_shutdown(shutdown) => return Ok(Fetched::Shutdown),
            fetched = self.broker.fetch(&self.stream, &self.consumer, self.batch_size, self.fetch_wait) => fetched,
        };

        match fetched {
            Ok(batch) if batch.is_empty() => Ok(Fetched::Empty),
            Ok(batch) => Ok(Fetched::Batch(batch)),
            Err(e) if e.is_timeout() => Ok(Fetched::Empty),
            Err(e) => Err(e),
        }
    }

    async fn handle_batch(&self, batch: Vec<Delivery>, report: &mut DeliveryReport) {
        report.batches += 1;
        debug!(count = batch.len(), "Fetched batch");

        for delivery in batch {
            self.handle_delivery(delivery, report).await;
        }
    }

    async fn handle_delivery(&self, delivery: Delivery, report: &mut DeliveryReport) {
        report.delivered += 1;
        self.metrics.message_delivered(delivery.is_redelivery());
        if delivery.is_redelivery() {
            report.redeliveries += 1;
            debug!(
                sequence = delivery.stream_sequence,
                delivered = delivery.delivered,
                "Processing redelivered message"
            );
        }

        match self.processor.process(&delivery).await {
            Ok(()) => {
                if let Err(e) = self.broker.acknowledge(delivery.ack_token(), AckKind::Ack).await {
                    warn!(
                        sequence = delivery.stream_sequence,
                        error = %e,
                        "Failed to ack message"
                    );
                    report.ack_failures += 1;
                    return;
                }
                report.acked += 1;
                self.metrics.message_acked();
                debug!(
                    sequence = delivery.stream_sequence,
                    payload = %delivery.payload_str(),
                    "Acked"
                );
            }
            Err(e) => {
                report.rejected += 1;
                self.metrics.message_rejected(self.processor.name());
                debug!(
                    sequence = delivery.stream_sequence,
                    delivered = delivery.delivered,
                    reason = %e,
                    "Processing failed, leaving for redelivery"
                );

                if self.failure_action == FailureAction::Nak {
                    if let Err(e) = self.broker.acknowledge(delivery.ack_token(), AckKind::Nak).await {
                        warn!(
                            sequence = delivery.stream_sequence,
                            error = %e,
                            "Failed to nak message"
                        );
                        report.ack_failures += 1;
                    }
                }
            }
        }
    }
}
