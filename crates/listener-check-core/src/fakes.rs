//! In-memory fakes for the broker collaborator traits (testing only)
//!
//! Provides `MemoryBroker`, a scriptable single-partition broker that
//! satisfies the `BrokerConnector` contract without a live cluster.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::*;
use crate::endpoint::BrokerEndpoint;
use crate::error::{BrokerError, BrokerResult};

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// What happens to a message handed to a fake producer.
#[derive(Debug, Clone, Default)]
pub enum DeliveryScript {
    /// Appended to the topic log and reported as delivered on flush.
    #[default]
    Deliver,
    /// Reported as failed on flush with this reason.
    Fail(String),
    /// Never reported; flush leaves it outstanding.
    Silent,
    /// Refused at submission time.
    Reject(BrokerError),
}

#[derive(Debug)]
struct BrokerState {
    admin_connect_error: Option<BrokerError>,
    producer_connect_error: Option<BrokerError>,
    consumer_connect_error: Option<BrokerError>,
    /// `None` advertises the endpoint the client connected to.
    advertised: Option<Vec<BrokerNode>>,
    cluster_id: String,
    controller_id: i32,
    metadata_error: Option<BrokerError>,
    cluster_id_error: Option<BrokerError>,
    controller_id_error: Option<BrokerError>,
    query_latency: Duration,
    delivery: DeliveryScript,
    producer_events: Vec<ProducerEvent>,
    consumer_events: VecDeque<ConsumedEvent>,
    subscribe_error: Option<BrokerError>,
    topics: HashMap<String, Vec<Vec<u8>>>,
    position_queries: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            admin_connect_error: None,
            producer_connect_error: None,
            consumer_connect_error: None,
            advertised: None,
            cluster_id: "MkU3OEVBNTcwNTJENDM2Qg".to_string(),
            controller_id: 1,
            metadata_error: None,
            cluster_id_error: None,
            controller_id_error: None,
            query_latency: Duration::ZERO,
            delivery: DeliveryScript::Deliver,
            producer_events: Vec::new(),
            consumer_events: VecDeque::new(),
            subscribe_error: None,
            topics: HashMap::new(),
            position_queries: 0,
        }
    }
}

type Shared = Arc<Mutex<BrokerState>>;

fn lock(state: &Shared) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts a session as open until dropped.
#[derive(Debug)]
struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
    fn open(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// In-memory broker with one partition per topic.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Shared,
    open: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    pub fn fail_admin_connect(self, err: BrokerError) -> Self {
        self.state().admin_connect_error = Some(err);
        self
    }

    pub fn fail_producer_connect(self, err: BrokerError) -> Self {
        self.state().producer_connect_error = Some(err);
        self
    }

    pub fn fail_consumer_connect(self, err: BrokerError) -> Self {
        self.state().consumer_connect_error = Some(err);
        self
    }

    /// Advertise these listeners in metadata instead of the connect endpoint.
    pub fn with_advertised(self, brokers: Vec<BrokerNode>) -> Self {
        self.state().advertised = Some(brokers);
        self
    }

    pub fn with_cluster_id(self, cluster_id: impl Into<String>) -> Self {
        self.state().cluster_id = cluster_id.into();
        self
    }

    pub fn with_controller_id(self, controller_id: i32) -> Self {
        self.state().controller_id = controller_id;
        self
    }

    pub fn fail_metadata(self, err: BrokerError) -> Self {
        self.state().metadata_error = Some(err);
        self
    }

    pub fn fail_cluster_id(self, err: BrokerError) -> Self {
        self.state().cluster_id_error = Some(err);
        self
    }

    pub fn fail_controller_id(self, err: BrokerError) -> Self {
        self.state().controller_id_error = Some(err);
        self
    }

    /// Delay every admin query by `latency`.
    pub fn with_query_latency(self, latency: Duration) -> Self {
        self.state().query_latency = latency;
        self
    }

    pub fn with_delivery(self, script: DeliveryScript) -> Self {
        self.state().delivery = script;
        self
    }

    /// Emit `event` on the producer event stream at flush, ahead of the
    /// delivery report.
    pub fn with_producer_event(self, event: ProducerEvent) -> Self {
        self.state().producer_events.push(event);
        self
    }

    /// Yield `event` from consumer polls before any topic message.
    pub fn with_consumer_event(self, event: ConsumedEvent) -> Self {
        self.state().consumer_events.push_back(event);
        self
    }

    pub fn fail_subscribe(self, err: BrokerError) -> Self {
        self.state().subscribe_error = Some(err);
        self
    }

    /// Pre-populate a topic, e.g. with messages from earlier runs.
    pub fn seed_message(self, topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        self.state()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(payload.into());
        self
    }

    /// Payloads currently stored in `topic`.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Sessions created and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// How many times a consumer asked for its read positions.
    pub fn position_queries(&self) -> usize {
        self.state().position_queries
    }
}

impl BrokerConnector for MemoryBroker {
    fn admin(&self, endpoint: &BrokerEndpoint) -> BrokerResult<Box<dyn AdminSession>> {
        if let Some(err) = self.state().admin_connect_error.clone() {
            return Err(err);
        }
        Ok(Box::new(MemoryAdmin {
            state: Arc::clone(&self.state),
            endpoint: endpoint.clone(),
            _guard: SessionGuard::open(&self.open),
        }))
    }

    fn producer(&self, _endpoint: &BrokerEndpoint) -> BrokerResult<ProducerHandle> {
        if let Some(err) = self.state().producer_connect_error.clone() {
            return Err(err);
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(ProducerHandle {
            session: Box::new(MemoryProducer {
                state: Arc::clone(&self.state),
                events_tx,
                queue: Mutex::new(Vec::new()),
                _guard: SessionGuard::open(&self.open),
            }),
            events,
        })
    }

    fn consumer(
        &self,
        _endpoint: &BrokerEndpoint,
        _group_id: &str,
    ) -> BrokerResult<Box<dyn ConsumerSession>> {
        if let Some(err) = self.state().consumer_connect_error.clone() {
            return Err(err);
        }
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            topic: None,
            cursor: 0,
            eof_reported: false,
            _guard: SessionGuard::open(&self.open),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryAdmin
// ---------------------------------------------------------------------------

struct MemoryAdmin {
    state: Shared,
    endpoint: BrokerEndpoint,
    _guard: SessionGuard,
}

impl MemoryAdmin {
    async fn delay(&self) {
        let latency = lock(&self.state).query_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AdminSession for MemoryAdmin {
    async fn metadata(&self, _timeout: Duration) -> BrokerResult<ClusterMetadata> {
        self.delay().await;
        let state = lock(&self.state);
        if let Some(err) = state.metadata_error.clone() {
            return Err(err);
        }
        let brokers = state.advertised.clone().unwrap_or_else(|| {
            vec![BrokerNode::new(
                1,
                self.endpoint.host(),
                i32::from(self.endpoint.port()),
            )]
        });
        Ok(ClusterMetadata {
            originating_broker: OriginatingBroker {
                id: 1,
                name: format!("{}/1", self.endpoint),
            },
            brokers,
        })
    }

    async fn cluster_id(&self, _timeout: Duration) -> BrokerResult<String> {
        self.delay().await;
        let state = lock(&self.state);
        match state.cluster_id_error.clone() {
            Some(err) => Err(err),
            None => Ok(state.cluster_id.clone()),
        }
    }

    async fn controller_id(&self, _timeout: Duration) -> BrokerResult<i32> {
        self.delay().await;
        let state = lock(&self.state);
        match state.controller_id_error.clone() {
            Some(err) => Err(err),
            None => Ok(state.controller_id),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryProducer
// ---------------------------------------------------------------------------

struct MemoryProducer {
    state: Shared,
    events_tx: ProducerEventSender,
    queue: Mutex<Vec<PublishRequest>>,
    _guard: SessionGuard,
}

#[async_trait]
impl ProducerSession for MemoryProducer {
    fn produce(&self, request: &PublishRequest) -> BrokerResult<()> {
        if let DeliveryScript::Reject(err) = &lock(&self.state).delivery {
            return Err(err.clone());
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(())
    }

    /// Delivery reports are emitted here, the way librdkafka serves
    /// callbacks while flushing.
    async fn flush(&self, timeout: Duration) -> usize {
        let queued: Vec<PublishRequest> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut outstanding = 0;
        {
            let mut state = lock(&self.state);
            for event in state.producer_events.drain(..) {
                let _ = self.events_tx.send(event);
            }
            for request in queued {
                match state.delivery.clone() {
                    DeliveryScript::Deliver => {
                        let log = state.topics.entry(request.topic.clone()).or_default();
                        log.push(request.payload.clone());
                        let offset = (log.len() - 1) as i64;
                        let _ = self.events_tx.send(ProducerEvent::Delivery(
                            DeliveryOutcome::Delivered(DeliveredMessage {
                                topic: request.topic,
                                partition: 0,
                                offset,
                                payload: request.payload,
                            }),
                        ));
                    }
                    DeliveryScript::Fail(reason) => {
                        let _ = self
                            .events_tx
                            .send(ProducerEvent::Delivery(DeliveryOutcome::Failed { reason }));
                    }
                    DeliveryScript::Silent => outstanding += 1,
                    DeliveryScript::Reject(_) => {}
                }
            }
        }

        if outstanding > 0 {
            tokio::time::sleep(timeout).await;
        }
        outstanding
    }
}

// ---------------------------------------------------------------------------
// MemoryConsumer
// ---------------------------------------------------------------------------

struct MemoryConsumer {
    state: Shared,
    topic: Option<String>,
    cursor: usize,
    eof_reported: bool,
    _guard: SessionGuard,
}

impl MemoryConsumer {
    fn next_event(&mut self) -> Option<ConsumedEvent> {
        let mut state = lock(&self.state);
        if let Some(event) = state.consumer_events.pop_front() {
            return Some(event);
        }

        let topic = self.topic.clone()?;
        let log = state.topics.get(&topic).cloned().unwrap_or_default();
        if let Some(payload) = log.get(self.cursor) {
            let offset = self.cursor as i64;
            self.cursor += 1;
            self.eof_reported = false;
            return Some(ConsumedEvent::Message {
                topic,
                partition: 0,
                offset,
                payload: payload.clone(),
            });
        }

        if !self.eof_reported {
            self.eof_reported = true;
            return Some(ConsumedEvent::PartitionEnd {
                topic,
                partition: 0,
                offset: self.cursor as i64,
            });
        }
        None
    }
}

#[async_trait]
impl ConsumerSession for MemoryConsumer {
    fn subscribe(&mut self, topic: &str) -> BrokerResult<()> {
        if let Some(err) = lock(&self.state).subscribe_error.clone() {
            return Err(err);
        }
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Option<ConsumedEvent> {
        if let Some(event) = self.next_event() {
            return Some(event);
        }
        tokio::time::sleep(timeout).await;
        None
    }

    fn positions(&self) -> BrokerResult<Vec<PartitionPosition>> {
        let mut state = lock(&self.state);
        state.position_queries += 1;
        Ok(self
            .topic
            .iter()
            .map(|topic| PartitionPosition {
                topic: topic.clone(),
                partition: 0,
                offset: Some(self.cursor as i64),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sessions_are_counted_until_dropped() {
        let broker = MemoryBroker::new();
        let endpoint = BrokerEndpoint::default();

        let admin = broker.admin(&endpoint).unwrap();
        let consumer = broker.consumer(&endpoint, "g").unwrap();
        assert_eq!(broker.open_sessions(), 2);

        drop(admin);
        drop(consumer);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_metadata_echoes_endpoint_by_default() {
        let broker = MemoryBroker::new();
        let admin = broker.admin(&BrokerEndpoint::new("kafka", 29092)).unwrap();
        let md = admin.metadata(Duration::from_secs(1)).await.unwrap();
        assert_eq!(md.brokers, vec![BrokerNode::new(1, "kafka", 29092)]);
    }

    #[tokio::test]
    async fn test_consumer_reports_partition_end_once_per_catch_up() {
        let broker = MemoryBroker::new().seed_message("t1", "old");
        let mut consumer = broker.consumer(&BrokerEndpoint::default(), "g").unwrap();
        consumer.subscribe("t1").unwrap();

        let first = consumer.poll(Duration::from_millis(10)).await;
        assert!(matches!(first, Some(ConsumedEvent::Message { offset: 0, .. })));

        let second = consumer.poll(Duration::from_millis(10)).await;
        assert!(matches!(second, Some(ConsumedEvent::PartitionEnd { offset: 1, .. })));

        assert!(consumer.poll(Duration::from_millis(10)).await.is_none());
    }
}
