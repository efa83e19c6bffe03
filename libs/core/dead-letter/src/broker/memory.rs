//! In-process broker with JetStream delivery semantics.
//!
//! Implements what the pipeline relies on: per-stream sequences, durable pull
//! consumers with explicit ack, redelivery after `ack_wait` (or right away on
//! nak), exhaustion after `max_deliver` with a max-deliveries advisory stored
//! in whichever stream captures advisory subjects, positional reads, and
//! `Nats-Msg-Id` deduplication.
//!
//! Timing uses `tokio::time`, so tests can run it on a paused clock. Retention
//! limits (`max_age`, interest retention) are not enforced; use
//! [`InMemoryBroker::remove_message`] to simulate an expired message.

use super::{
    AckKind, AckToken, Broker, ConsumerSpec, Declared, DeliverPolicy, Delivery, InboundStream,
    OutboundMessage, PublishReceipt, StoredMessage, StreamSpec, StreamState, Subscription,
    MSG_ID_HEADER,
};
use crate::advisory::MaxDeliveriesAdvisory;
use crate::error::BrokerError;
use crate::subject::{captured_by, subject_matches};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

const SUBSCRIPTION_TOKEN_PREFIX: &str = "sub.";

type ConsumerKey = (String, String);

/// Broker that keeps every stream in memory.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamLog>,
    consumers: HashMap<ConsumerKey, Cursor>,
    subscribers: Vec<Subscriber>,
    in_flight: HashMap<String, (ConsumerKey, u64)>,
    next_token: u64,
}

struct StreamLog {
    spec: StreamSpec,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    msg_ids: HashMap<String, u64>,
}

struct Cursor {
    spec: ConsumerSpec,
    next_sequence: u64,
    pending: BTreeMap<u64, Pending>,
    exhausted: BTreeSet<u64>,
    acked: BTreeSet<u64>,
}

struct Pending {
    delivered: u64,
    redeliver_at: Instant,
}

struct Subscriber {
    subscription: Subscription,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All messages currently stored in `stream`, in sequence order.
    pub fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        self.lock()
            .streams
            .get(stream)
            .map(|log| log.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a stored message, as retention would.
    pub fn remove_message(&self, stream: &str, sequence: u64) -> bool {
        self.lock()
            .streams
            .get_mut(stream)
            .map(|log| log.messages.remove(&sequence).is_some())
            .unwrap_or(false)
    }

    /// Sequences the consumer has given up on.
    pub fn exhausted(&self, stream: &str, consumer: &str) -> Vec<u64> {
        self.lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .map(|cursor| cursor.exhausted.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sequences the consumer has acknowledged.
    pub fn acked(&self, stream: &str, consumer: &str) -> Vec<u64> {
        self.lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .map(|cursor| cursor.acked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of delivered but not yet acknowledged messages.
    pub fn pending(&self, stream: &str, consumer: &str) -> usize {
        self.lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .map(|cursor| cursor.pending.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Hand out deliveries that are ready now. Returns them together with the
    /// next instant at which a pending message becomes due.
    fn collect_ready(
        state: &mut State,
        key: &ConsumerKey,
        batch: usize,
        now: Instant,
    ) -> Result<(Vec<Delivery>, Option<Instant>), BrokerError> {
        let mut cursor = state
            .consumers
            .remove(key)
            .ok_or_else(|| BrokerError::ConsumerNotFound(key.1.clone()))?;

        let mut ready = Vec::new();
        let mut advisories = Vec::new();
        // Sequences whose earlier ack tokens stop being valid.
        let mut retired = BTreeSet::new();

        if let Some(log) = state.streams.get(&key.0) {
            let max_deliver = cursor.spec.max_deliver;
            let due: Vec<u64> = cursor
                .pending
                .iter()
                .filter(|(_, pending)| pending.redeliver_at <= now)
                .map(|(sequence, _)| *sequence)
                .collect();

            for sequence in due {
                let delivered = cursor.pending[&sequence].delivered;
                if max_deliver > 0 && delivered >= max_deliver as u64 {
                    cursor.pending.remove(&sequence);
                    cursor.exhausted.insert(sequence);
                    retired.insert(sequence);
                    advisories.push(MaxDeliveriesAdvisory::new(
                        key.0.clone(),
                        key.1.clone(),
                        sequence,
                        delivered,
                    ));
                    continue;
                }
                if ready.len() >= batch {
                    continue;
                }
                retired.insert(sequence);
                let Some(message) = log.messages.get(&sequence) else {
                    cursor.pending.remove(&sequence);
                    continue;
                };
                if let Some(pending) = cursor.pending.get_mut(&sequence) {
                    pending.delivered += 1;
                    pending.redeliver_at = now + cursor.spec.ack_wait;
                }
                ready.push((message.clone(), delivered + 1));
            }

            let filter = cursor.spec.filter_subject.clone();
            let fresh: Vec<StoredMessage> = log
                .messages
                .range(cursor.next_sequence..)
                .map(|(_, message)| message)
                .filter(|message| {
                    filter
                        .as_deref()
                        .map_or(true, |pattern| subject_matches(pattern, &message.subject))
                })
                .take(batch.saturating_sub(ready.len()))
                .cloned()
                .collect();

            for message in fresh {
                cursor.next_sequence = message.sequence + 1;
                cursor.pending.insert(
                    message.sequence,
                    Pending {
                        delivered: 1,
                        redeliver_at: now + cursor.spec.ack_wait,
                    },
                );
                ready.push((message, 1));
            }
        }

        let next_due = cursor.pending.values().map(|p| p.redeliver_at).min();
        state.consumers.insert(key.clone(), cursor);
        if !retired.is_empty() {
            state
                .in_flight
                .retain(|_, (owner, sequence)| *owner != *key || !retired.contains(&*sequence));
        }

        let deliveries = ready
            .into_iter()
            .map(|(message, delivered)| {
                let token = state.issue_token();
                state
                    .in_flight
                    .insert(token.clone(), (key.clone(), message.sequence));
                Delivery::new(
                    message.subject,
                    message.payload,
                    message.headers,
                    message.sequence,
                    delivered,
                    AckToken::new(token),
                )
            })
            .collect();

        for advisory in advisories {
            debug!(
                stream = %advisory.stream,
                consumer = %advisory.consumer,
                sequence = advisory.stream_seq,
                deliveries = advisory.deliveries,
                "Message exhausted its deliveries"
            );
            state.emit_advisory(&advisory);
        }

        Ok((deliveries, next_due))
    }
}

impl State {
    fn issue_token(&mut self) -> String {
        self.next_token += 1;
        format!("ack.{}", self.next_token)
    }

    /// Store a message in the stream capturing its subject.
    fn append(&mut self, message: &OutboundMessage) -> Result<PublishReceipt, BrokerError> {
        let log = self
            .streams
            .values_mut()
            .find(|log| captured_by(&log.spec.subjects, &message.subject))
            .ok_or_else(|| {
                BrokerError::publish_error(format!("no stream captures subject {}", message.subject))
            })?;

        let msg_id = message.header(MSG_ID_HEADER).map(str::to_string);
        if let Some(sequence) = msg_id.as_ref().and_then(|id| log.msg_ids.get(id)) {
            return Ok(PublishReceipt {
                stream: log.spec.name.clone(),
                sequence: *sequence,
                duplicate: true,
            });
        }

        log.last_sequence += 1;
        let sequence = log.last_sequence;
        log.messages.insert(
            sequence,
            StoredMessage {
                stream: log.spec.name.clone(),
                subject: message.subject.clone(),
                sequence,
                payload: message.payload.clone(),
                headers: message.headers.clone(),
            },
        );
        if let Some(id) = msg_id {
            log.msg_ids.insert(id, sequence);
        }

        Ok(PublishReceipt {
            stream: log.spec.name.clone(),
            sequence,
            duplicate: false,
        })
    }

    /// Store the advisory and push it to matching subscribers.
    fn emit_advisory(&mut self, advisory: &MaxDeliveriesAdvisory) {
        let Ok(payload) = advisory.encode() else {
            return;
        };
        let message = OutboundMessage::new(advisory.subject(), payload);

        // Without a capturing stream the advisory is lost.
        let Ok(receipt) = self.append(&message) else {
            trace!(subject = %message.subject, "No stream captures advisory");
            return;
        };

        self.subscribers.retain(|s| !s.sender.is_closed());
        for index in 0..self.subscribers.len() {
            let subscription = &self.subscribers[index].subscription;
            if subscription.stream != receipt.stream
                || !subject_matches(&subscription.filter_subject, &message.subject)
            {
                continue;
            }
            self.next_token += 1;
            let delivery = Delivery::new(
                message.subject.clone(),
                message.payload.clone(),
                Vec::new(),
                receipt.sequence,
                1,
                AckToken::new(format!("{SUBSCRIPTION_TOKEN_PREFIX}{}", self.next_token)),
            );
            let _ = self.subscribers[index].sender.send(delivery);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_stream(&self, spec: &StreamSpec) -> Result<Declared, BrokerError> {
        let mut state = self.lock();
        if state.streams.contains_key(&spec.name) {
            return Ok(Declared::AlreadyExists);
        }

        let overlapping = state.streams.values().find(|log| {
            spec.subjects.iter().any(|subject| captured_by(&log.spec.subjects, subject))
                || log.spec.subjects.iter().any(|existing| captured_by(&spec.subjects, existing))
        });
        if let Some(log) = overlapping {
            return Err(BrokerError::JetStream(format!(
                "subjects overlap with an existing stream {}",
                log.spec.name
            )));
        }

        state.streams.insert(
            spec.name.clone(),
            StreamLog {
                spec: spec.clone(),
                messages: BTreeMap::new(),
                last_sequence: 0,
                msg_ids: HashMap::new(),
            },
        );
        Ok(Declared::Created)
    }

    async fn declare_consumer(&self, spec: &ConsumerSpec) -> Result<Declared, BrokerError> {
        let mut state = self.lock();
        let last_sequence = state
            .streams
            .get(&spec.stream)
            .map(|log| log.last_sequence)
            .ok_or_else(|| BrokerError::StreamNotFound(spec.stream.clone()))?;

        let key = (spec.stream.clone(), spec.durable_name.clone());
        if state.consumers.contains_key(&key) {
            return Ok(Declared::AlreadyExists);
        }

        let next_sequence = match spec.deliver_policy {
            DeliverPolicy::All => 1,
            DeliverPolicy::New => last_sequence + 1,
        };
        state.consumers.insert(
            key,
            Cursor {
                spec: spec.clone(),
                next_sequence,
                pending: BTreeMap::new(),
                exhausted: BTreeSet::new(),
                acked: BTreeSet::new(),
            },
        );
        Ok(Declared::Created)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt, BrokerError> {
        let receipt = self.lock().append(&message)?;
        self.changed.notify_waiters();
        Ok(receipt)
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let key = (stream.to_string(), consumer.to_string());
        let deadline = Instant::now() + wait;

        loop {
            let changed = self.changed.notified();
            let now = Instant::now();
            let next_due = {
                let mut state = self.lock();
                let (ready, next_due) = Self::collect_ready(&mut state, &key, batch, now)?;
                if !ready.is_empty() {
                    return Ok(ready);
                }
                next_due
            };

            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, token: &AckToken, kind: AckKind) -> Result<(), BrokerError> {
        if token.as_str().starts_with(SUBSCRIPTION_TOKEN_PREFIX) {
            return Ok(());
        }

        {
            let mut state = self.lock();
            let (key, sequence) = state
                .in_flight
                .remove(token.as_str())
                .ok_or_else(|| BrokerError::Ack(format!("unknown ack token {}", token.as_str())))?;
            let Some(cursor) = state.consumers.get_mut(&key) else {
                return Err(BrokerError::ConsumerNotFound(key.1));
            };

            match kind {
                AckKind::Ack => {
                    if cursor.pending.remove(&sequence).is_some() {
                        cursor.acked.insert(sequence);
                    }
                }
                AckKind::Nak => {
                    if let Some(pending) = cursor.pending.get_mut(&sequence) {
                        pending.redeliver_at = Instant::now();
                    }
                }
            }
        }

        if kind == AckKind::Nak {
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<InboundStream, BrokerError> {
        let mut state = self.lock();
        let log = state
            .streams
            .get(&subscription.stream)
            .ok_or_else(|| BrokerError::StreamNotFound(subscription.stream.clone()))?;

        let backlog: Vec<StoredMessage> = log
            .messages
            .values()
            .filter(|m| subject_matches(&subscription.filter_subject, &m.subject))
            .cloned()
            .collect();

        let (sender, receiver) = mpsc::unbounded_channel();
        for message in backlog {
            state.next_token += 1;
            let _ = sender.send(Delivery::new(
                message.subject,
                message.payload,
                message.headers,
                message.sequence,
                1,
                AckToken::new(format!("{SUBSCRIPTION_TOKEN_PREFIX}{}", state.next_token)),
            ));
        }
        state.subscribers.push(Subscriber {
            subscription: subscription.clone(),
            sender,
        });

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn get_message(&self, stream: &str, sequence: u64) -> Result<StoredMessage, BrokerError> {
        let state = self.lock();
        let log = state
            .streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        log.messages
            .get(&sequence)
            .cloned()
            .ok_or_else(|| BrokerError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            })
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamState, BrokerError> {
        let state = self.lock();
        let log = state
            .streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;

        Ok(StreamState {
            messages: log.messages.len() as u64,
            first_sequence: log.messages.keys().next().copied().unwrap_or(0),
            last_sequence: log.last_sequence,
            consumer_count: state.consumers.keys().filter(|(s, _)| s == stream).count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{max_deliveries_subject, ADVISORY_SUBJECTS};
    use crate::broker::RetentionPolicy;

    fn consumer(max_deliver: i64) -> ConsumerSpec {
        ConsumerSpec {
            stream: "ORDERS".to_string(),
            durable_name: "order-processor".to_string(),
            filter_subject: None,
            deliver_policy: DeliverPolicy::All,
            max_deliver,
            ack_wait: Duration::from_secs(1),
        }
    }

    async fn broker_with_orders(max_deliver: i64) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_stream(&StreamSpec::new("ORDERS", vec!["orders.*".to_string()]))
            .await
            .unwrap();
        broker
            .declare_stream(
                &StreamSpec::new("ADVISORY", vec![ADVISORY_SUBJECTS.to_string()])
                    .with_retention(RetentionPolicy::Interest),
            )
            .await
            .unwrap();
        broker.declare_consumer(&consumer(max_deliver)).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_declarations_are_idempotent() {
        let broker = broker_with_orders(3).await;
        let spec = StreamSpec::new("ORDERS", vec!["orders.*".to_string()]);
        assert_eq!(broker.declare_stream(&spec).await.unwrap(), Declared::AlreadyExists);
        assert_eq!(
            broker.declare_consumer(&consumer(3)).await.unwrap(),
            Declared::AlreadyExists
        );
        assert_eq!(broker.stream_info("ORDERS").await.unwrap().consumer_count, 1);
    }

    #[tokio::test]
    async fn test_overlapping_stream_is_rejected() {
        let broker = broker_with_orders(3).await;
        let err = broker
            .declare_stream(&StreamSpec::new("SHADOW", vec!["orders.new".to_string()]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[tokio::test]
    async fn test_publish_assigns_sequences_and_dedups() {
        let broker = broker_with_orders(3).await;
        let first = broker
            .publish(OutboundMessage::new("orders.new", "a").with_header(MSG_ID_HEADER, "x"))
            .await
            .unwrap();
        let second = broker.publish(OutboundMessage::new("orders.new", "b")).await.unwrap();
        let replay = broker
            .publish(OutboundMessage::new("orders.new", "a").with_header(MSG_ID_HEADER, "x"))
            .await
            .unwrap();

        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(replay.duplicate);
        assert_eq!(replay.sequence, 1);
        assert_eq!(broker.stream_info("ORDERS").await.unwrap().messages, 2);
    }

    #[tokio::test]
    async fn test_publish_without_capturing_stream_fails() {
        let broker = broker_with_orders(3).await;
        let err = broker
            .publish(OutboundMessage::new("invoices.new", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_fetch_waits_then_returns_nothing() {
        let broker = broker_with_orders(3).await;
        let started = Instant::now();
        let batch = broker
            .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_until_exhausted() {
        let broker = broker_with_orders(3).await;
        let mut advisories = broker
            .subscribe(&Subscription {
                stream: "ADVISORY".to_string(),
                durable_name: "dlq-relocator".to_string(),
                filter_subject: max_deliveries_subject("ORDERS", "order-processor"),
            })
            .await
            .unwrap();
        broker.publish(OutboundMessage::new("orders.new", "order_5")).await.unwrap();

        let mut attempts = Vec::new();
        loop {
            let batch = broker
                .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
                .await
                .unwrap();
            if batch.is_empty() {
                break;
            }
            attempts.extend(batch.iter().map(|d| d.delivered));
        }

        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(broker.exhausted("ORDERS", "order-processor"), vec![1]);
        assert_eq!(broker.pending("ORDERS", "order-processor"), 0);

        let event = advisories.next().await.unwrap();
        let advisory = MaxDeliveriesAdvisory::decode(&event.payload).unwrap();
        assert_eq!(advisory.stream_seq, 1);
        assert_eq!(advisory.deliveries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_stops_redelivery_and_nak_is_immediate() {
        let broker = broker_with_orders(3).await;
        broker.publish(OutboundMessage::new("orders.new", "a")).await.unwrap();
        broker.publish(OutboundMessage::new("orders.new", "b")).await.unwrap();

        let batch = broker
            .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        broker.acknowledge(batch[0].ack_token(), AckKind::Ack).await.unwrap();
        broker.acknowledge(batch[1].ack_token(), AckKind::Nak).await.unwrap();

        let started = Instant::now();
        let again = broker
            .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload_str(), "b");
        assert_eq!(again[0].delivered, 2);
        assert_eq!(broker.acked("ORDERS", "order-processor"), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withheld_tokens_are_retired_on_redelivery_and_exhaustion() {
        let broker = broker_with_orders(3).await;
        broker.publish(OutboundMessage::new("orders.new", "order_5")).await.unwrap();

        let first = broker
            .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(broker.in_flight(), 1);

        let second = broker
            .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second[0].delivered, 2);
        assert_eq!(broker.in_flight(), 1);
        let err = broker
            .acknowledge(first[0].ack_token(), AckKind::Ack)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Ack(_)));

        while !broker
            .fetch("ORDERS", "order-processor", 5, Duration::from_secs(2))
            .await
            .unwrap()
            .is_empty()
        {}
        assert_eq!(broker.exhausted("ORDERS", "order-processor"), vec![1]);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_ack_token_is_an_error() {
        let broker = broker_with_orders(3).await;
        let err = broker
            .acknowledge(&AckToken::new("ack.999"), AckKind::Ack)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Ack(_)));
    }

    #[tokio::test]
    async fn test_get_message_after_removal_is_not_found() {
        let broker = broker_with_orders(3).await;
        broker.publish(OutboundMessage::new("orders.new", "a")).await.unwrap();
        assert_eq!(broker.get_message("ORDERS", 1).await.unwrap().payload, "a");

        assert!(broker.remove_message("ORDERS", 1));
        let err = broker.get_message("ORDERS", 1).await.unwrap_err();
        assert!(matches!(err, BrokerError::MessageNotFound { sequence: 1, .. }));
    }
}
