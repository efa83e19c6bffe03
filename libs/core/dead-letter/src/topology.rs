//! Idempotent provisioning of the pipeline's streams and consumer.

use crate::broker::{Broker, Declared};
use crate::config::PipelineConfig;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What happened to one declared entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStatus {
    Created,
    AlreadyExists,
    Failed(String),
}

impl From<Declared> for ProvisionStatus {
    fn from(declared: Declared) -> Self {
        match declared {
            Declared::Created => ProvisionStatus::Created,
            Declared::AlreadyExists => ProvisionStatus::AlreadyExists,
        }
    }
}

/// Kind of entity declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Stream,
    Consumer,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Stream => write!(f, "stream"),
            Entity::Consumer => write!(f, "consumer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionEntry {
    pub entity: Entity,
    pub name: String,
    pub status: ProvisionStatus,
}

/// Per-entity outcome of a provisioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub entries: Vec<ProvisionEntry>,
}

impl ProvisionReport {
    /// Every entity exists after the pass.
    pub fn is_complete(&self) -> bool {
        self.entries
            .iter()
            .all(|e| !matches!(e.status, ProvisionStatus::Failed(_)))
    }

    pub fn created(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == ProvisionStatus::Created)
            .count()
    }

    pub fn status_of(&self, name: &str) -> Option<&ProvisionStatus> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.status)
    }
}

/// Declares the primary, dead-letter and advisory streams and the durable
/// consumer.
pub struct TopologyProvisioner {
    broker: Arc<dyn Broker>,
}

impl TopologyProvisioner {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Run every declaration. Failures are logged and recorded in the report,
    /// never returned.
    pub async fn provision(&self, config: &PipelineConfig) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        for spec in [&config.primary, &config.dead_letter, &config.advisory] {
            let status = match self.broker.declare_stream(spec).await {
                Ok(declared) => declared.into(),
                Err(e) => ProvisionStatus::Failed(e.to_string()),
            };
            record(&mut report, Entity::Stream, &spec.name, status);
        }

        let status = match self.broker.declare_consumer(&config.consumer).await {
            Ok(declared) => declared.into(),
            Err(e) => ProvisionStatus::Failed(e.to_string()),
        };
        record(&mut report, Entity::Consumer, &config.consumer.durable_name, status);

        report
    }
}

fn record(report: &mut ProvisionReport, entity: Entity, name: &str, status: ProvisionStatus) {
    match &status {
        ProvisionStatus::Created => info!(%entity, resource = %name, "Created"),
        ProvisionStatus::AlreadyExists => info!(%entity, resource = %name, "Already exists, skipping"),
        ProvisionStatus::Failed(error) => warn!(%entity, resource = %name, error = %error, "Declaration failed"),
    }
    report.entries.push(ProvisionEntry {
        entity,
        name: name.to_string(),
        status,
    });
}
