//! JetStream delivery-exceeded advisories.
//!
//! When a consumer gives up on a message the server publishes a JSON
//! advisory on `$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.<stream>.<consumer>`.

use crate::error::DeadLetterError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every JetStream advisory is published below this prefix.
pub const ADVISORY_SUBJECTS: &str = "$JS.EVENT.ADVISORY.>";

const MAX_DELIVERIES_PREFIX: &str = "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES";

/// Schema identifier carried in the `type` field.
pub const MAX_DELIVER_ADVISORY_TYPE: &str = "io.nats.jetstream.advisory.v1.max_deliver";

/// Subject on which the server announces exhausted messages of one consumer.
pub fn max_deliveries_subject(stream: &str, consumer: &str) -> String {
    format!("{MAX_DELIVERIES_PREFIX}.{stream}.{consumer}")
}

/// Payload of a max-deliveries advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxDeliveriesAdvisory {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Stream the exhausted message lives in.
    pub stream: String,
    /// Consumer that exhausted its delivery attempts.
    pub consumer: String,
    /// Position of the exhausted message in `stream`.
    pub stream_seq: u64,
    /// Deliveries made before the consumer gave up.
    #[serde(default)]
    pub deliveries: u64,
}

impl MaxDeliveriesAdvisory {
    pub fn new(
        stream: impl Into<String>,
        consumer: impl Into<String>,
        stream_seq: u64,
        deliveries: u64,
    ) -> Self {
        Self {
            kind: MAX_DELIVER_ADVISORY_TYPE.to_string(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Some(Utc::now()),
            stream: stream.into(),
            consumer: consumer.into(),
            stream_seq,
            deliveries,
        }
    }

    /// Decode an advisory payload and check it points at a real position.
    pub fn decode(payload: &[u8]) -> Result<Self, DeadLetterError> {
        let advisory: Self = serde_json::from_slice(payload)?;

        if !advisory.kind.is_empty() && advisory.kind != MAX_DELIVER_ADVISORY_TYPE {
            return Err(DeadLetterError::Advisory(format!(
                "unexpected advisory type {}",
                advisory.kind
            )));
        }
        if advisory.stream.is_empty() {
            return Err(DeadLetterError::Advisory("missing stream".to_string()));
        }
        if advisory.stream_seq == 0 {
            return Err(DeadLetterError::Advisory("missing stream_seq".to_string()));
        }

        Ok(advisory)
    }

    pub fn encode(&self) -> Result<Bytes, DeadLetterError> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn subject(&self) -> String {
        max_deliveries_subject(&self.stream, &self.consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::subject_matches;

    const SERVER_PAYLOAD: &str = r#"{
        "type": "io.nats.jetstream.advisory.v1.max_deliver",
        "id": "hFHIFJ4Zh1vCzB2IHgwDr1",
        "timestamp": "2024-03-01T10:15:42.123456789Z",
        "stream": "ORDERS",
        "consumer": "order-processor",
        "stream_seq": 5,
        "deliveries": 3,
        "domain": "hub"
    }"#;

    #[test]
    fn test_decode_server_payload() {
        let advisory = MaxDeliveriesAdvisory::decode(SERVER_PAYLOAD.as_bytes()).unwrap();
        assert_eq!(advisory.stream, "ORDERS");
        assert_eq!(advisory.consumer, "order-processor");
        assert_eq!(advisory.stream_seq, 5);
        assert_eq!(advisory.deliveries, 3);
        assert!(advisory.timestamp.is_some());
    }

    #[test]
    fn test_decode_rejects_missing_sequence() {
        let err = MaxDeliveriesAdvisory::decode(br#"{"stream":"ORDERS","consumer":"c","stream_seq":0}"#)
            .unwrap_err();
        assert!(err.to_string().contains("stream_seq"));
    }

    #[test]
    fn test_decode_rejects_other_advisory_types() {
        let payload = br#"{"type":"io.nats.jetstream.advisory.v1.terminated","stream":"ORDERS","consumer":"c","stream_seq":4}"#;
        assert!(matches!(
            MaxDeliveriesAdvisory::decode(payload),
            Err(DeadLetterError::Advisory(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            MaxDeliveriesAdvisory::decode(b"order_5"),
            Err(DeadLetterError::Serialization(_))
        ));
    }

    #[test]
    fn test_subject_is_captured_by_advisory_stream() {
        let advisory = MaxDeliveriesAdvisory::new("ORDERS", "order-processor", 5, 3);
        assert_eq!(
            advisory.subject(),
            "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.ORDERS.order-processor"
        );
        assert!(subject_matches(ADVISORY_SUBJECTS, &advisory.subject()));

        let decoded = MaxDeliveriesAdvisory::decode(&advisory.encode().unwrap()).unwrap();
        assert_eq!(decoded, advisory);
    }
}
