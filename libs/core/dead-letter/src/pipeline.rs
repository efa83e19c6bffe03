//! Pipeline supervisor wiring provisioning, delivery and relocation.

use crate::broker::{Broker, StreamState};
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryLoop, DeliveryReport};
use crate::error::{BrokerError, DeadLetterError};
use crate::metrics::PipelineMetrics;
use crate::processor::Processor;
use crate::producer::Producer;
use crate::relocator::{DeadLetterRelocator, RelocatorReport};
use crate::shutdown::wait_for_shutdown;
use crate::topology::{ProvisionReport, TopologyProvisioner};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// How the delivery loop runs inside [`Pipeline::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Stop pulling at the first empty fetch.
    #[default]
    Drain,
    /// Keep pulling until shutdown.
    Continuous,
}

/// Counters of a full run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub delivery: DeliveryReport,
    pub relocation: RelocatorReport,
}

/// Message counts of the primary and dead-letter streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDepths {
    pub primary: StreamState,
    pub dead_letter: StreamState,
}

/// Dead-letter pipeline over one primary stream.
pub struct Pipeline {
    broker: Arc<dyn Broker>,
    config: PipelineConfig,
    processor: Arc<dyn Processor>,
    metrics: PipelineMetrics,
}

impl Pipeline {
    /// Validate `config` and build the pipeline.
    pub fn new(
        broker: Arc<dyn Broker>,
        config: PipelineConfig,
        processor: Arc<dyn Processor>,
    ) -> Result<Self, DeadLetterError> {
        config.validate()?;
        let metrics = PipelineMetrics::new(&config.primary.name, &config.consumer.durable_name);
        Ok(Self {
            broker,
            config,
            processor,
            metrics,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// Producer for the primary stream's publish subject.
    pub fn producer(&self) -> Producer {
        Producer::new(
            self.broker.clone(),
            self.config.publish_subject.clone(),
            self.metrics.clone(),
        )
    }

    pub async fn provision(&self) -> ProvisionReport {
        TopologyProvisioner::new(self.broker.clone())
            .provision(&self.config)
            .await
    }

    /// Run delivery and relocation until shutdown.
    ///
    /// The relocator subscribes before the first fetch; failing to open that
    /// subscription is the only error returned. In [`RunMode::Drain`] the
    /// delivery loop stops at the first empty fetch or at a fetch error it
    /// gives up on, while the relocator keeps handling advisories until
    /// `shutdown` flips.
    pub async fn run(
        &self,
        mode: RunMode,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineReport, DeadLetterError> {
        let relocator = Arc::new(DeadLetterRelocator::new(self.broker.clone(), &self.config));
        let handle = relocator.spawn(shutdown.clone()).await?;

        let delivery_loop = DeliveryLoop::new(self.broker.clone(), self.processor.clone(), &self.config);
        let delivery = match mode {
            RunMode::Drain => delivery_loop.drain(&mut shutdown).await,
            RunMode::Continuous => delivery_loop.run(shutdown.clone()).await,
        };

        info!(
            delivered = delivery.delivered,
            acked = delivery.acked,
            "Delivery finished, relocator running until shutdown"
        );
        wait_for_shutdown(&mut shutdown).await;
        let relocation = handle.join().await;

        Ok(PipelineReport {
            delivery,
            relocation,
        })
    }

    /// Read the primary and dead-letter stream counters and record them as
    /// gauges.
    pub async fn depths(&self) -> Result<StreamDepths, BrokerError> {
        let primary = self.broker.stream_info(&self.config.primary.name).await?;
        let dead_letter = self.broker.stream_info(&self.config.dead_letter.name).await?;

        self.metrics
            .stream_depth(&self.config.primary.name, primary.messages);
        self.metrics
            .stream_depth(&self.config.dead_letter.name, dead_letter.messages);

        Ok(StreamDepths {
            primary,
            dead_letter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, InMemoryBroker, MockBroker};
    use crate::processor::NoOpProcessor;
    use crate::shutdown;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig::default().with_max_deliver(0);
        let result = Pipeline::new(Arc::new(MockBroker::new()), config, Arc::new(NoOpProcessor));
        assert!(matches!(result, Err(DeadLetterError::Config(_))));
    }

    #[tokio::test]
    async fn test_subscription_failure_aborts_run() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|s| Err(BrokerError::StreamNotFound(s.stream.clone())));
        broker.expect_fetch().never();

        let pipeline = Pipeline::new(
            Arc::new(broker),
            PipelineConfig::default(),
            Arc::new(NoOpProcessor),
        )
        .unwrap();
        let (_tx, rx) = shutdown::channel();

        let err = pipeline.run(RunMode::Drain, rx).await.unwrap_err();
        assert!(err.to_string().contains("ADVISORY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_do_not_fail_the_run() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|_| Ok(futures::stream::pending::<Delivery>().boxed()));
        broker
            .expect_fetch()
            .returning(|_, _, _, _| Err(BrokerError::consumer_error("request timed out: 503 no responders")));

        let pipeline = Pipeline::new(
            Arc::new(broker),
            PipelineConfig::default(),
            Arc::new(NoOpProcessor),
        )
        .unwrap();
        let (tx, rx) = shutdown::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(true);
        });

        let report = pipeline.run(RunMode::Drain, rx).await.unwrap();
        assert!(report.delivery.fetch_errors > 1);
        assert_eq!(report.delivery.delivered, 0);
        assert_eq!(report.relocation, RelocatorReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_run_finishes_after_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let pipeline = Pipeline::new(
            broker.clone(),
            PipelineConfig::default(),
            Arc::new(NoOpProcessor),
        )
        .unwrap();
        assert!(pipeline.provision().await.is_complete());
        pipeline.producer().publish_all(["order_1", "order_2"]).await;

        let (tx, rx) = shutdown::channel();
        tx.send(true).unwrap();
        let report = pipeline.run(RunMode::Drain, rx).await.unwrap();
        assert_eq!(report.delivery.delivered, 0);

        let depths = pipeline.depths().await.unwrap();
        assert_eq!(depths.primary.messages, 2);
        assert_eq!(depths.dead_letter.messages, 0);
    }
}
