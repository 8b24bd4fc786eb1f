//! Kafka listener check
//!
//! Diagnoses client-to-broker connectivity in three stages: probe cluster
//! metadata, publish one uniquely-tagged message with delivery tracking, then
//! consume until that exact message is read back. Broker clients sit behind
//! the [`BrokerConnector`] seam; [`fakes::MemoryBroker`] drives the workflow
//! in-process and [`kafka::KafkaConnector`] (feature `kafka`) drives librdkafka.

pub mod broker;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fakes;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod obs;
pub mod orchestrator;
pub mod payload;
pub mod probe;
pub mod publisher;
pub mod subscriber;
pub mod telemetry;

pub use broker::{
    AdminSession, BrokerConnector, BrokerNode, ClusterMetadata, ConsumedEvent, ConsumerSession,
    DeliveredMessage, DeliveryOutcome, OriginatingBroker, PartitionPosition, ProducerEvent,
    ProducerEventSender, ProducerEvents, ProducerHandle, ProducerSession, PublishRequest,
};
pub use config::DiagnosticConfig;
pub use endpoint::{BrokerEndpoint, EndpointParseError};
pub use error::{classify, BrokerError, BrokerErrorKind, BrokerResult, DiagnosticError, Result};
pub use fakes::{DeliveryScript, MemoryBroker};
#[cfg(feature = "kafka")]
pub use kafka::KafkaConnector;
pub use orchestrator::{
    DiagnosticReport, DiagnosticResult, ListenerCheck, PublishReport, Stage, StageOutcome,
};
pub use payload::unique_payload;
pub use probe::{listener_mismatch, ClusterProbe, ProbeReport};
pub use publisher::{track_delivery, DeliveryTrackedPublisher, ERROR_CHANNEL_CAPACITY};
pub use subscriber::{classify_event, ConsumeReport, EventClassifyingSubscriber, PollStep};
pub use telemetry::init_tracing;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
