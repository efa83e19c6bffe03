//! JetStream dead-letter pipeline.
//!
//! Messages that keep failing are moved to a dead-letter stream instead of
//! being lost or retried forever. The broker does the retry bookkeeping: a
//! durable pull consumer with explicit ack redelivers unacknowledged messages
//! until `max_deliver` is reached, then emits a max-deliveries advisory. The
//! relocator follows those advisories and copies each exhausted message onto
//! the dead-letter subject.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌──────────────────┐     ┌────────────────┐
//! │  Producer  │────▶│  primary stream  │────▶│  DeliveryLoop  │──▶ Processor
//! └────────────┘     └──────────────────┘     └────────────────┘
//!                             │ max_deliver reached
//!                             ▼
//!                    ┌──────────────────┐     ┌─────────────────────┐
//!                    │ advisory stream  │────▶│ DeadLetterRelocator │
//!                    └──────────────────┘     └─────────────────────┘
//!                                                       │ get_message + publish
//!                                                       ▼
//!                                             ┌──────────────────┐
//!                                             │ dead-letter stream│
//!                                             └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use dead_letter::{JetStreamBroker, Pipeline, PipelineConfig, RejectPayloads, RunMode};
//!
//! let broker = Arc::new(JetStreamBroker::connect(&nats_config).await?);
//! let pipeline = Pipeline::new(
//!     broker,
//!     PipelineConfig::default(),
//!     Arc::new(RejectPayloads::new(["order_5"])),
//! )?;
//!
//! pipeline.provision().await;
//! pipeline.producer().publish_all((1..=10).map(|i| format!("order_{i}"))).await;
//! pipeline.run(RunMode::Drain, shutdown_rx).await?;
//! ```
//!
//! [`InMemoryBroker`] implements the same delivery semantics without a
//! server and is what the unit and scenario tests run against.

pub mod advisory;
mod broker;
mod config;
mod delivery;
mod error;
pub mod metrics;
mod pipeline;
mod processor;
mod producer;
pub mod relocator;
pub mod shutdown;
pub mod subject;
mod topology;

pub use advisory::{max_deliveries_subject, MaxDeliveriesAdvisory, ADVISORY_SUBJECTS};
pub use broker::{
    AckKind, AckToken, Broker, ConsumerSpec, Declared, DeliverPolicy, Delivery, Headers,
    InMemoryBroker, InboundStream, JetStreamBroker, OutboundMessage, PublishReceipt,
    RetentionPolicy, StorageClass, StoredMessage, StreamSpec, StreamState, Subscription,
    MSG_ID_HEADER,
};
pub use config::{FailureAction, PipelineConfig, StreamConfig};
pub use delivery::{DeliveryLoop, DeliveryReport};
pub use error::{BrokerError, DeadLetterError, ProcessingError, Result};
pub use metrics::PipelineMetrics;
pub use pipeline::{Pipeline, PipelineReport, RunMode, StreamDepths};
pub use processor::{processor_fn, FnProcessor, NoOpProcessor, Processor, RejectPayloads};
pub use producer::{Producer, PublishSummary};
pub use relocator::{dead_letter_entry, DeadLetterRelocator, RelocatorHandle, RelocatorReport};
pub use topology::{Entity, ProvisionEntry, ProvisionReport, ProvisionStatus, TopologyProvisioner};
