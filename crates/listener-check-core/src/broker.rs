//! Broker collaborator traits for the listener check
//!
//! These traits describe the broker client surface the diagnostic depends on:
//! - `BrokerConnector`: creates one exclusively-owned session per stage
//! - `AdminSession`: control-plane queries (metadata, cluster id, controller id)
//! - `ProducerSession`: fire-and-forget publish with a shared delivery event stream
//! - `ConsumerSession`: subscribe/poll over a closed set of event kinds
//!
//! Sessions release their client when dropped. A librdkafka backend lives in
//! `kafka` (feature `kafka`); in-memory fakes live in `fakes`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::endpoint::BrokerEndpoint;
use crate::error::{BrokerError, BrokerErrorKind, BrokerResult};

// ---------------------------------------------------------------------------
// Cluster metadata
// ---------------------------------------------------------------------------

/// A broker node as reported in cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerNode {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerNode {
    pub fn new(id: i32, host: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for BrokerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[ID {}] {}:{}", self.id, self.host, self.port)
    }
}

/// Metadata response from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Node that served this metadata request, i.e. the one we are connected to.
    pub originating_broker: OriginatingBroker,
    /// Advertised listeners of every broker in the cluster.
    pub brokers: Vec<BrokerNode>,
}

/// Identity of the node that served a metadata request.
///
/// librdkafka reports this as an id plus a `host:port/id` style name rather
/// than a split host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginatingBroker {
    pub id: i32,
    pub name: String,
}

#[async_trait]
pub trait AdminSession: Send + Sync {
    /// Fetch cluster metadata, bounded by `timeout`.
    async fn metadata(&self, timeout: Duration) -> BrokerResult<ClusterMetadata>;

    /// Fetch the cluster id, bounded by `timeout`.
    async fn cluster_id(&self, timeout: Duration) -> BrokerResult<String>;

    /// Fetch the id of the current controller, bounded by `timeout`.
    async fn controller_id(&self, timeout: Duration) -> BrokerResult<i32>;
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// One message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Where a published message was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl DeliveredMessage {
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Outcome of one publish, reported asynchronously by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(DeliveredMessage),
    Failed { reason: String },
}

/// Everything that can arrive on a producer's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    /// Delivery report for a previously produced message.
    Delivery(DeliveryOutcome),
    /// Client-level error not tied to a particular message.
    Error(BrokerError),
    /// Anything outside the above; always a contract violation.
    Unrecognized { raw: String },
}

/// Shared delivery event stream for one producer.
pub type ProducerEvents = mpsc::UnboundedReceiver<ProducerEvent>;

/// Writing half of [`ProducerEvents`], held by the client backend.
pub type ProducerEventSender = mpsc::UnboundedSender<ProducerEvent>;

#[async_trait]
pub trait ProducerSession: Send + Sync {
    /// Enqueue a message locally. Returns immediately; the delivery outcome
    /// arrives later on the producer's event stream. Errors here are
    /// submission failures such as a full local queue.
    fn produce(&self, request: &PublishRequest) -> BrokerResult<()>;

    /// Wait up to `timeout` for queued messages to be delivered. Returns how
    /// many are still outstanding (0 = fully flushed).
    async fn flush(&self, timeout: Duration) -> usize;
}

/// A producer session together with its event stream.
pub struct ProducerHandle {
    pub session: Box<dyn ProducerSession>,
    pub events: ProducerEvents,
}

// ---------------------------------------------------------------------------
// Consuming
// ---------------------------------------------------------------------------

/// Everything a subscription's poll can yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumedEvent {
    Message {
        topic: String,
        partition: i32,
        offset: i64,
        payload: Vec<u8>,
    },
    /// The consumer caught up with the end of a partition.
    PartitionEnd {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// Offsets were committed.
    CommitAck,
    /// Error raised by the client or the broker while subscribed.
    BrokerError {
        kind: BrokerErrorKind,
        code: Option<i32>,
        detail: String,
    },
    /// Anything outside the above; always a contract violation.
    Unrecognized { raw: String },
}

/// Current read position of an assigned partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPosition {
    pub topic: String,
    pub partition: i32,
    /// `None` until the consumer has fetched from the partition.
    pub offset: Option<i64>,
}

#[async_trait]
pub trait ConsumerSession: Send {
    /// Subscribe to a single topic.
    fn subscribe(&mut self, topic: &str) -> BrokerResult<()>;

    /// Wait up to `timeout` for the next event. `None` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Option<ConsumedEvent>;

    /// Read positions of the currently assigned partitions.
    fn positions(&self) -> BrokerResult<Vec<PartitionPosition>>;
}

// ---------------------------------------------------------------------------
// BrokerConnector
// ---------------------------------------------------------------------------

/// Factory for per-stage broker sessions.
///
/// Creation failures carry the client's own classification
/// (`InvalidConfig`, `Transport`, ...).
pub trait BrokerConnector: Send + Sync {
    fn admin(&self, endpoint: &BrokerEndpoint) -> BrokerResult<Box<dyn AdminSession>>;

    fn producer(&self, endpoint: &BrokerEndpoint) -> BrokerResult<ProducerHandle>;

    fn consumer(
        &self,
        endpoint: &BrokerEndpoint,
        group_id: &str,
    ) -> BrokerResult<Box<dyn ConsumerSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_node_display() {
        let node = BrokerNode::new(1, "10.0.0.5", 9092);
        assert_eq!(node.to_string(), "[ID 1] 10.0.0.5:9092");
    }

    #[test]
    fn test_delivered_payload_lossy() {
        let delivered = DeliveredMessage {
            topic: "t1".to_string(),
            partition: 0,
            offset: 42,
            payload: b"foo / run-1".to_vec(),
        };
        assert_eq!(delivered.payload_lossy(), "foo / run-1");
    }
}
