//! NATS JetStream implementation of [`Broker`].

use super::{
    AckKind, AckToken, Broker, ConsumerSpec, Declared, DeliverPolicy, Delivery, Headers,
    InboundStream, OutboundMessage, PublishReceipt, RetentionPolicy, StorageClass, StoredMessage,
    StreamSpec, StreamState, Subscription,
};
use crate::error::BrokerError;
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::{self, AckPolicy, PullConsumer};
use async_nats::jetstream::stream::{self, Config as JsStreamConfig};
use async_nats::jetstream::{self, Context};
use async_nats::{Client, ConnectOptions, HeaderMap};
use bytes::Bytes;
use core_config::nats::NatsConfig;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const ACK_PAYLOAD: &[u8] = b"+ACK";
const NAK_PAYLOAD: &[u8] = b"-NAK";

/// Broker backed by a NATS JetStream cluster.
#[derive(Clone)]
pub struct JetStreamBroker {
    client: Client,
    jetstream: Context,
    /// Pull consumers already looked up, by (stream, durable name).
    consumers: Arc<Mutex<HashMap<(String, String), PullConsumer>>>,
}

impl JetStreamBroker {
    /// Connect to the cluster listed in `config`.
    pub async fn connect(config: &NatsConfig) -> Result<Self, BrokerError> {
        info!(
            servers = ?config.redacted_endpoints(),
            client_name = %config.client_name,
            "Connecting to NATS"
        );

        let client = ConnectOptions::new()
            .name(&config.client_name)
            .connect(config.server_list().as_str())
            .await?;

        info!("Connected to NATS");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            consumers: Arc::default(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn cached_consumers(&self) -> MutexGuard<'_, HashMap<(String, String), PullConsumer>> {
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pull consumer handle, looked up on first use.
    async fn pull_consumer(&self, stream: &str, consumer: &str) -> Result<PullConsumer, BrokerError> {
        let key = (stream.to_string(), consumer.to_string());
        if let Some(cached) = self.cached_consumers().get(&key) {
            return Ok(cached.clone());
        }

        let handle = self
            .stream(stream)
            .await?
            .get_consumer::<ConsumerConfig>(consumer)
            .await
            .map_err(|_| BrokerError::ConsumerNotFound(consumer.to_string()))?;
        debug!(stream = %stream, consumer = %consumer, "Cached pull consumer");
        self.cached_consumers().insert(key, handle.clone());
        Ok(handle)
    }

    fn forget_consumer(&self, stream: &str, consumer: &str) {
        self.cached_consumers()
            .remove(&(stream.to_string(), consumer.to_string()));
    }

    async fn stream(&self, name: &str) -> Result<stream::Stream, BrokerError> {
        self.jetstream.get_stream(name).await.map_err(|e| {
            let text = e.to_string();
            if text.to_lowercase().contains("not found") {
                BrokerError::StreamNotFound(name.to_string())
            } else {
                BrokerError::from_jetstream_error(text)
            }
        })
    }
}

fn stream_config(spec: &StreamSpec) -> JsStreamConfig {
    JsStreamConfig {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        storage: match spec.storage {
            StorageClass::File => stream::StorageType::File,
            StorageClass::Memory => stream::StorageType::Memory,
        },
        retention: match spec.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
        },
        num_replicas: spec.replicas,
        max_age: spec.max_age.unwrap_or_default(),
        ..Default::default()
    }
}

fn consumer_config(spec: &ConsumerSpec) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some(spec.durable_name.clone()),
        name: Some(spec.durable_name.clone()),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: match spec.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        },
        max_deliver: spec.max_deliver,
        ack_wait: spec.ack_wait,
        filter_subject: spec.filter_subject.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Fail when an existing durable filters something other than `subscription`.
fn check_filter(existing: &consumer::Config, subscription: &Subscription) -> Result<(), BrokerError> {
    let wanted = &subscription.filter_subject;
    if existing.filter_subject == *wanted
        || (existing.filter_subjects.len() == 1 && existing.filter_subjects[0] == *wanted)
    {
        return Ok(());
    }

    let current = if existing.filter_subject.is_empty() {
        existing.filter_subjects.join(",")
    } else {
        existing.filter_subject.clone()
    };
    Err(BrokerError::Subscription(format!(
        "durable {} on {} filters {} instead of {}; delete it or pick another durable name",
        subscription.durable_name, subscription.stream, current, wanted
    )))
}

fn flatten_headers(headers: Option<&HeaderMap>) -> Headers {
    let Some(headers) = headers else {
        return Vec::new();
    };
    headers
        .iter()
        .flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.to_string(), value.as_str().to_string()))
        })
        .collect()
}

fn delivery_from_message(message: jetstream::Message) -> Option<Delivery> {
    let (stream_sequence, delivered) = match message.info() {
        Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
        Err(e) => {
            warn!(error = %e, subject = %message.subject, "Message without JetStream metadata");
            return None;
        }
    };
    let Some(reply) = message.reply.as_ref().map(|r| r.to_string()) else {
        warn!(subject = %message.subject, "Message without reply subject, cannot be acked");
        return None;
    };

    Some(Delivery::new(
        message.subject.to_string(),
        message.payload.clone(),
        flatten_headers(message.headers.as_ref()),
        stream_sequence,
        delivered,
        AckToken::new(reply),
    ))
}

#[async_trait::async_trait]
impl Broker for JetStreamBroker {
    async fn declare_stream(&self, spec: &StreamSpec) -> Result<Declared, BrokerError> {
        if let Ok(mut existing) = self.jetstream.get_stream(&spec.name).await {
            let info = existing
                .info()
                .await
                .map_err(BrokerError::from_jetstream_error)?;
            debug!(
                stream = %spec.name,
                messages = info.state.messages,
                "Stream already exists"
            );
            return Ok(Declared::AlreadyExists);
        }

        info!(stream = %spec.name, subjects = ?spec.subjects, "Creating stream");
        match self.jetstream.create_stream(stream_config(spec)).await {
            Ok(_) => Ok(Declared::Created),
            // Created concurrently.
            Err(e) if e.to_string().contains("already in use") => Ok(Declared::AlreadyExists),
            Err(e) => Err(BrokerError::from_jetstream_error(e)),
        }
    }

    async fn declare_consumer(&self, spec: &ConsumerSpec) -> Result<Declared, BrokerError> {
        let stream = self.stream(&spec.stream).await?;

        if stream
            .get_consumer::<ConsumerConfig>(&spec.durable_name)
            .await
            .is_ok()
        {
            debug!(consumer = %spec.durable_name, "Consumer already exists");
            return Ok(Declared::AlreadyExists);
        }

        info!(
            consumer = %spec.durable_name,
            stream = %spec.stream,
            max_deliver = spec.max_deliver,
            "Creating consumer"
        );
        stream
            .create_consumer(consumer_config(spec))
            .await
            .map_err(BrokerError::from_jetstream_error)?;
        Ok(Declared::Created)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt, BrokerError> {
        let ack_future = if message.headers.is_empty() {
            self.jetstream
                .publish(message.subject.clone(), message.payload)
                .await
        } else {
            let mut headers = HeaderMap::new();
            for (name, value) in &message.headers {
                headers.append(name.as_str(), value.as_str());
            }
            self.jetstream
                .publish_with_headers(message.subject.clone(), headers, message.payload)
                .await
        }
        .map_err(|e| BrokerError::publish_error(e.to_string()))?;

        let ack = ack_future
            .await
            .map_err(|e| BrokerError::publish_error(e.to_string()))?;

        Ok(PublishReceipt {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let handle = self.pull_consumer(stream, consumer).await?;

        let mut messages = match handle.batch().max_messages(batch).expires(wait).messages().await {
            Ok(messages) => messages,
            Err(e) => {
                self.forget_consumer(stream, consumer);
                return Err(BrokerError::from_fetch(e));
            }
        };

        let mut deliveries = Vec::with_capacity(batch);
        let mut last_error = None;
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => deliveries.extend(delivery_from_message(message)),
                Err(e) => {
                    warn!(error = %e, "Error receiving message");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if deliveries.is_empty() => {
                self.forget_consumer(stream, consumer);
                Err(BrokerError::from_fetch(e))
            }
            _ => Ok(deliveries),
        }
    }

    async fn acknowledge(&self, token: &AckToken, kind: AckKind) -> Result<(), BrokerError> {
        let reply = token.as_str().to_string();
        match kind {
            AckKind::Ack => {
                self.client
                    .request(reply, Bytes::from_static(ACK_PAYLOAD))
                    .await
                    .map_err(|e| BrokerError::Ack(e.to_string()))?;
            }
            AckKind::Nak => {
                self.client
                    .publish(reply, Bytes::from_static(NAK_PAYLOAD))
                    .await
                    .map_err(|e| BrokerError::Ack(e.to_string()))?;
                self.client
                    .flush()
                    .await
                    .map_err(|e| BrokerError::Ack(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<InboundStream, BrokerError> {
        let stream = self.stream(&subscription.stream).await?;

        let consumer = stream
            .get_or_create_consumer(
                &subscription.durable_name,
                ConsumerConfig {
                    durable_name: Some(subscription.durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: consumer::DeliverPolicy::All,
                    filter_subject: subscription.filter_subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Subscription(e.to_string()))?;
        check_filter(&consumer.cached_info().config, subscription)?;

        info!(
            stream = %subscription.stream,
            durable = %subscription.durable_name,
            filter = %subscription.filter_subject,
            "Subscribed"
        );

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Subscription(e.to_string()))?;

        Ok(messages
            .filter_map(|message| async move {
                match message {
                    Ok(message) => delivery_from_message(message),
                    Err(e) => {
                        warn!(error = %e, "Subscription receive error");
                        None
                    }
                }
            })
            .boxed())
    }

    #[instrument(skip(self))]
    async fn get_message(&self, stream: &str, sequence: u64) -> Result<StoredMessage, BrokerError> {
        let message = self
            .stream(stream)
            .await?
            .get_raw_message(sequence)
            .await
            .map_err(|e| BrokerError::from_get_message(stream, sequence, e))?;

        Ok(StoredMessage {
            stream: stream.to_string(),
            subject: message.subject.to_string(),
            sequence: message.sequence,
            payload: message.payload,
            headers: flatten_headers(Some(&message.headers)),
        })
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamState, BrokerError> {
        let mut handle = self.stream(stream).await?;
        let info = handle
            .info()
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        Ok(StreamState {
            messages: info.state.messages,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count as usize,
        })
    }
}
