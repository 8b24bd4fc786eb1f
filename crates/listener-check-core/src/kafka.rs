//! librdkafka-backed broker connector (feature `kafka`).
//!
//! - admin: `AdminClient`, queried through its inner `Client`
//! - producer: `ThreadedProducer` whose context forwards every delivery
//!   report and client error onto the session's `ProducerEvents` stream
//! - consumer: `StreamConsumer` with partition EOF enabled, reading from the
//!   earliest offset; its context forwards client errors (brokers down,
//!   transport failures) to `poll` and surfaces offset commits as `CommitAck`
//!
//! Blocking librdkafka calls run on `spawn_blocking`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::AdminClient;
use rdkafka::client::{ClientContext, DefaultClientContext};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::*;
use crate::endpoint::BrokerEndpoint;
use crate::error::{BrokerError, BrokerErrorKind, BrokerResult};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify a librdkafka error code.
pub fn kind_for_code(code: RDKafkaErrorCode) -> BrokerErrorKind {
    match code {
        RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::Resolve
        | RDKafkaErrorCode::NetworkException => BrokerErrorKind::Transport,
        RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => {
            BrokerErrorKind::TimedOut
        }
        RDKafkaErrorCode::QueueFull => BrokerErrorKind::QueueFull,
        RDKafkaErrorCode::InvalidArgument => BrokerErrorKind::InvalidConfig,
        _ => BrokerErrorKind::Other,
    }
}

fn map_kafka_error(err: KafkaError) -> BrokerError {
    if let KafkaError::ClientConfig(..) = err {
        return BrokerError::invalid_config(err.to_string());
    }
    match err.rdkafka_error_code() {
        Some(code) => BrokerError::new(kind_for_code(code), err.to_string()).with_code(code as i32),
        None => BrokerError::other(err.to_string()),
    }
}

/// Client-level error as delivered to `ClientContext::error`.
fn client_error(error: KafkaError, reason: &str) -> BrokerError {
    let mut err = map_kafka_error(error);
    err.detail = format!("{}: {}", err.detail, reason);
    err
}

fn broker_error_event(err: BrokerError) -> ConsumedEvent {
    ConsumedEvent::BrokerError {
        kind: err.kind,
        code: err.code,
        detail: err.detail,
    }
}

fn join_error(err: tokio::task::JoinError) -> BrokerError {
    BrokerError::other(format!("blocking client call did not complete: {}", err))
}

// ---------------------------------------------------------------------------
// KafkaConnector
// ---------------------------------------------------------------------------

/// Connector that creates real librdkafka clients.
#[derive(Debug, Clone, Default)]
pub struct KafkaConnector {
    /// Extra client properties (security settings and the like).
    properties: Vec<(String, String)>,
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an extra librdkafka property on every client this connector creates.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    fn client_config(&self, endpoint: &BrokerEndpoint) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", endpoint.to_string());
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

impl BrokerConnector for KafkaConnector {
    fn admin(&self, endpoint: &BrokerEndpoint) -> BrokerResult<Box<dyn AdminSession>> {
        let client: AdminClient<DefaultClientContext> = self
            .client_config(endpoint)
            .create()
            .map_err(map_kafka_error)?;
        Ok(Box::new(KafkaAdmin {
            client: Arc::new(client),
        }))
    }

    fn producer(&self, endpoint: &BrokerEndpoint) -> BrokerResult<ProducerHandle> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let producer: ThreadedProducer<DeliveryForwarder> = self
            .client_config(endpoint)
            .create_with_context(DeliveryForwarder { events: events_tx })
            .map_err(map_kafka_error)?;
        Ok(ProducerHandle {
            session: Box::new(KafkaProducer {
                producer: Arc::new(producer),
            }),
            events,
        })
    }

    fn consumer(
        &self,
        endpoint: &BrokerEndpoint,
        group_id: &str,
    ) -> BrokerResult<Box<dyn ConsumerSession>> {
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let commits = Arc::new(AtomicUsize::new(0));
        let consumer: StreamConsumer<ConsumerForwarder> = self
            .client_config(endpoint)
            .set("group.id", group_id)
            .set("enable.partition.eof", "true")
            .set("auto.offset.reset", "earliest")
            .create_with_context(ConsumerForwarder {
                errors: errors_tx,
                commits: Arc::clone(&commits),
            })
            .map_err(map_kafka_error)?;
        Ok(Box::new(KafkaConsumer {
            consumer,
            errors,
            commits,
            topic: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
}

#[async_trait]
impl AdminSession for KafkaAdmin {
    async fn metadata(&self, timeout: Duration) -> BrokerResult<ClusterMetadata> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let md = client.inner().fetch_metadata(None, timeout)?;
            Ok::<_, KafkaError>(ClusterMetadata {
                originating_broker: OriginatingBroker {
                    id: md.orig_broker_id(),
                    name: md.orig_broker_name().to_string(),
                },
                brokers: md
                    .brokers()
                    .iter()
                    .map(|b| BrokerNode::new(b.id(), b.host(), b.port()))
                    .collect(),
            })
        })
        .await
        .map_err(join_error)?
        .map_err(map_kafka_error)
    }

    async fn cluster_id(&self, timeout: Duration) -> BrokerResult<String> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.inner().fetch_cluster_id(timeout))
            .await
            .map_err(join_error)?
            .ok_or_else(|| BrokerError::timed_out("cluster id not returned before the timeout"))
    }

    async fn controller_id(&self, timeout: Duration) -> BrokerResult<i32> {
        let client = Arc::clone(&self.client);
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let id = tokio::task::spawn_blocking(move || {
            // SAFETY: the pointer comes from a live client kept alive by the
            // Arc held in this closure for the duration of the call.
            unsafe { rdkafka::bindings::rd_kafka_controllerid(client.inner().native_ptr(), timeout_ms) }
        })
        .await
        .map_err(join_error)?;

        if id < 0 {
            return Err(BrokerError::timed_out(
                "controller id not returned before the timeout",
            ));
        }
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Producer context forwarding delivery reports and client errors.
struct DeliveryForwarder {
    events: ProducerEventSender,
}

impl ClientContext for DeliveryForwarder {
    fn error(&self, error: KafkaError, reason: &str) {
        let _ = self
            .events
            .send(ProducerEvent::Error(client_error(error, reason)));
    }
}

impl ProducerContext for DeliveryForwarder {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(m) => DeliveryOutcome::Delivered(DeliveredMessage {
                topic: m.topic().to_string(),
                partition: m.partition(),
                offset: m.offset(),
                payload: m.payload().unwrap_or_default().to_vec(),
            }),
            Err((e, m)) => DeliveryOutcome::Failed {
                reason: format!(
                    "message '{}' to topic '{}': {}",
                    String::from_utf8_lossy(m.payload().unwrap_or_default()),
                    m.topic(),
                    e
                ),
            },
        };
        let _ = self.events.send(ProducerEvent::Delivery(outcome));
    }
}

struct KafkaProducer {
    producer: Arc<ThreadedProducer<DeliveryForwarder>>,
}

#[async_trait]
impl ProducerSession for KafkaProducer {
    fn produce(&self, request: &PublishRequest) -> BrokerResult<()> {
        let record = BaseRecord::<(), [u8]>::to(&request.topic).payload(request.payload.as_slice());
        self.producer
            .send(record)
            .map_err(|(e, _record)| map_kafka_error(e))
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let producer = Arc::clone(&self.producer);
        let remaining = tokio::task::spawn_blocking(move || {
            if let Err(e) = producer.flush(timeout) {
                debug!(error = %e, "Flush did not complete");
            }
            producer.in_flight_count().max(0) as usize
        })
        .await;

        match remaining {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Flush task failed; treating the message as undelivered");
                1
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Consumer context forwarding client errors and counting successful
/// offset commits.
struct ConsumerForwarder {
    errors: mpsc::UnboundedSender<BrokerError>,
    commits: Arc<AtomicUsize>,
}

impl ClientContext for ConsumerForwarder {
    fn error(&self, error: KafkaError, reason: &str) {
        let _ = self.errors.send(client_error(error, reason));
    }
}

impl ConsumerContext for ConsumerForwarder {
    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                self.commits.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => debug!(error = %e, "Offset commit failed"),
        }
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer<ConsumerForwarder>,
    errors: mpsc::UnboundedReceiver<BrokerError>,
    commits: Arc<AtomicUsize>,
    topic: Option<String>,
}

impl KafkaConsumer {
    fn take_commit(&self) -> bool {
        self.commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn position_of(&self, partition: i32) -> i64 {
        self.consumer
            .position()
            .ok()
            .and_then(|tpl| {
                tpl.elements()
                    .iter()
                    .find(|e| e.partition() == partition)
                    .and_then(|e| e.offset().to_raw())
            })
            .unwrap_or(-1)
    }

    fn map_consume_error(&self, err: KafkaError) -> ConsumedEvent {
        match err {
            KafkaError::PartitionEOF(partition) => ConsumedEvent::PartitionEnd {
                topic: self.topic.clone().unwrap_or_default(),
                partition,
                offset: self.position_of(partition),
            },
            KafkaError::MessageConsumption(code) | KafkaError::MessageConsumptionFatal(code) => {
                ConsumedEvent::BrokerError {
                    kind: kind_for_code(code),
                    code: Some(code as i32),
                    detail: code.to_string(),
                }
            }
            other => ConsumedEvent::Unrecognized {
                raw: format!("{:?}", other),
            },
        }
    }
}

#[async_trait]
impl ConsumerSession for KafkaConsumer {
    fn subscribe(&mut self, topic: &str) -> BrokerResult<()> {
        self.consumer.subscribe(&[topic]).map_err(map_kafka_error)?;
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Option<ConsumedEvent> {
        if let Ok(err) = self.errors.try_recv() {
            return Some(broker_error_event(err));
        }
        if self.take_commit() {
            return Some(ConsumedEvent::CommitAck);
        }

        let waited = tokio::select! {
            Some(err) = self.errors.recv() => return Some(broker_error_event(err)),
            waited = tokio::time::timeout(timeout, self.consumer.recv()) => waited,
        };

        let received = match waited {
            Err(_) => return None,
            Ok(Ok(m)) => Ok(ConsumedEvent::Message {
                topic: m.topic().to_string(),
                partition: m.partition(),
                offset: m.offset(),
                payload: m.payload().unwrap_or_default().to_vec(),
            }),
            Ok(Err(e)) => Err(e),
        };

        Some(received.unwrap_or_else(|e| self.map_consume_error(e)))
    }

    fn positions(&self) -> BrokerResult<Vec<PartitionPosition>> {
        let positions = self.consumer.position().map_err(map_kafka_error)?;
        Ok(positions
            .elements()
            .iter()
            .map(|e| PartitionPosition {
                topic: e.topic().to_string(),
                partition: e.partition(),
                offset: e.offset().to_raw().filter(|o| *o >= 0),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_codes_map_to_transport() {
        assert_eq!(
            kind_for_code(RDKafkaErrorCode::BrokerTransportFailure),
            BrokerErrorKind::Transport
        );
        assert_eq!(
            kind_for_code(RDKafkaErrorCode::AllBrokersDown),
            BrokerErrorKind::Transport
        );
    }

    #[test]
    fn test_other_codes() {
        assert_eq!(
            kind_for_code(RDKafkaErrorCode::OperationTimedOut),
            BrokerErrorKind::TimedOut
        );
        assert_eq!(kind_for_code(RDKafkaErrorCode::QueueFull), BrokerErrorKind::QueueFull);
        assert_eq!(
            kind_for_code(RDKafkaErrorCode::UnknownTopicOrPartition),
            BrokerErrorKind::Other
        );
    }

    #[test]
    fn test_client_error_becomes_transport_event() {
        let err = client_error(
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            "1/1 brokers are down",
        );
        assert_eq!(err.kind, BrokerErrorKind::Transport);

        match broker_error_event(err) {
            ConsumedEvent::BrokerError { kind, code, detail } => {
                assert_eq!(kind, BrokerErrorKind::Transport);
                assert_eq!(code, Some(RDKafkaErrorCode::AllBrokersDown as i32));
                assert!(detail.ends_with("1/1 brokers are down"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_bad_property_is_invalid_config() {
        let err = KafkaConnector::new()
            .with_property("no.such.property", "1")
            .admin(&BrokerEndpoint::default())
            .err()
            .expect("creation should fail");
        assert_eq!(err.kind, BrokerErrorKind::InvalidConfig);
    }
}
