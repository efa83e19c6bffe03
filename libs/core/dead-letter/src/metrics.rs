//! Pipeline metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host process installs a recorder.

use metrics::{counter, gauge};

/// Metric handles labelled with the primary stream and consumer.
#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    stream_name: String,
    consumer_name: String,
}

impl PipelineMetrics {
    pub fn new(stream_name: &str, consumer_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            consumer_name: consumer_name.to_string(),
        }
    }

    pub fn message_published(&self) {
        counter!(
            "dead_letter_messages_published_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    pub fn publish_failed(&self) {
        counter!(
            "dead_letter_publish_failures_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    pub fn message_delivered(&self, redelivery: bool) {
        counter!(
            "dead_letter_messages_delivered_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone(),
            "redelivery" => redelivery.to_string()
        )
        .increment(1);
    }

    pub fn message_acked(&self) {
        counter!(
            "dead_letter_messages_acked_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(1);
    }

    pub fn message_rejected(&self, processor: &'static str) {
        counter!(
            "dead_letter_messages_rejected_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone(),
            "processor" => processor
        )
        .increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!(
            "dead_letter_messages_relocated_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(1);
    }

    /// Record a relocation that was given up on.
    pub fn relocation_failed(&self, reason: &'static str) {
        counter!(
            "dead_letter_relocation_failures_total",
            "stream" => self.stream_name.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn stream_depth(&self, stream: &str, depth: u64) {
        gauge!(
            "dead_letter_stream_depth",
            "stream" => stream.to_string()
        )
        .set(depth as f64);
    }
}
