//! Orders Dead-Letter Worker
//!
//! Publishes the order batch, processes it through a durable JetStream
//! consumer and moves orders that keep failing to the dead-letter stream.
//!
//! ## Architecture
//!
//! ```text
//! order_1..order_N ─▶ ORDERS (orders.*)
//!   ↓ (Pull Consumer: order-processor, MaxDeliver=3)
//! DeliveryLoop + RejectPayloads(FAIL_PAYLOAD)
//!   ↓ (delivery limit reached)
//! ADVISORY ($JS.EVENT.ADVISORY.>)
//!   ↓ (durable: dlq-relocator)
//! DeadLetterRelocator
//!   ↓
//! DLQ (dlq.orders)
//! ```
//!
//! The consumer drains the stream once; the relocator keeps running until
//! SIGINT or SIGTERM.

pub mod config;

use crate::config::WorkerSettings;
use core_config::nats::NatsConfig;
use core_config::{Environment, FromEnv};
use dead_letter::{shutdown, JetStreamBroker, Pipeline, RejectPayloads, RunMode};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Run the worker
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to NATS; a connection failure is fatal
/// 3. Provisions streams and the durable consumer
/// 4. Publishes the order batch
/// 5. Drains the consumer and relocates exhausted orders until shutdown
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting orders dead-letter worker"
    );

    let nats_config = NatsConfig::from_env().wrap_err("Invalid NATS configuration")?;
    let settings = WorkerSettings::from_env().wrap_err("Invalid worker configuration")?;

    let broker = JetStreamBroker::connect(&nats_config)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to connect to NATS at {}",
                nats_config.redacted_endpoints().join(",")
            )
        })?;

    let pipeline_config = settings.pipeline_config();
    info!(
        stream = %pipeline_config.primary.name,
        consumer = %pipeline_config.consumer.durable_name,
        max_deliver = pipeline_config.consumer.max_deliver,
        dead_letter = %pipeline_config.dead_letter.name,
        "Pipeline configuration loaded"
    );

    let pipeline = Pipeline::new(
        Arc::new(broker),
        pipeline_config,
        Arc::new(RejectPayloads::new([settings.fail_payload.as_str()])),
    )
    .wrap_err("Invalid pipeline configuration")?;

    let provisioned = pipeline.provision().await;
    if !provisioned.is_complete() {
        warn!("Some streams or consumers could not be declared");
    }

    pipeline.producer().publish_all(settings.orders()).await;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let report = pipeline
        .run(RunMode::Drain, shutdown_rx)
        .await
        .wrap_err("Failed to subscribe to max-deliveries advisories")?;

    info!(
        acked = report.delivery.acked,
        rejected = report.delivery.rejected,
        fetch_errors = report.delivery.fetch_errors,
        relocated = report.relocation.relocated,
        relocation_failures = report.relocation.failed,
        "Pipeline stopped"
    );

    match pipeline.depths().await {
        Ok(depths) => info!(
            primary = depths.primary.messages,
            dead_letter = depths.dead_letter.messages,
            "Stream depths"
        ),
        Err(e) => warn!(error = %e, "Failed to read stream depths"),
    }

    info!("Orders dead-letter worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
