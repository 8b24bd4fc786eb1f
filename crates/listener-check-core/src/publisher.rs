//! Delivery-tracked publishing.
//!
//! Producing only enqueues a message; whether it reached the cluster is
//! reported later on the producer's event stream. [`DeliveryTrackedPublisher`]
//! runs a listener task over that stream for the duration of one publish and
//! funnels every failure (submission, delivery, client error, unflushed
//! messages) through a single error channel.
//!
//! Shutdown is a two-phase handshake:
//!
//! 1. main sends *stop-request* (after dropping its own error sender)
//! 2. listener drains already-queued events, drops its error sender, then
//!    sends *stop-acknowledged* carrying the captured delivery
//! 3. main drains the now-closed error channel to completion
//!
//! Draining before step 2 completes would wait on a channel that still has
//! a live sender.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerConnector, DeliveredMessage, DeliveryOutcome, ProducerEvent, ProducerEvents,
    ProducerHandle, ProducerSession, PublishRequest,
};
use crate::config::DiagnosticConfig;
use crate::error::{classify, DiagnosticError, Result};
use crate::payload::unique_payload;

const COMPONENT: &str = "producer";

/// Capacity of the listener → main error channel. Reports beyond this are
/// counted rather than blocking the listener.
pub const ERROR_CHANNEL_CAPACITY: usize = 8;

/// Publishes one message and waits for its confirmed delivery.
pub struct DeliveryTrackedPublisher;

impl DeliveryTrackedPublisher {
    /// Publish a freshly generated unique payload to `config.topic`.
    pub async fn publish(
        connector: &dyn BrokerConnector,
        config: &DiagnosticConfig,
    ) -> Result<DeliveredMessage> {
        let request = PublishRequest::new(
            config.topic.clone(),
            unique_payload(&config.payload_prefix),
        );
        Self::publish_request(connector, config, request).await
    }

    /// Publish `request` once. Returns the delivered message exactly as the
    /// broker confirmed it.
    ///
    /// The producer session is owned by this call and released before it
    /// returns.
    pub async fn publish_request(
        connector: &dyn BrokerConnector,
        config: &DiagnosticConfig,
        request: PublishRequest,
    ) -> Result<DeliveredMessage> {
        let endpoint = config.endpoint.to_string();

        let ProducerHandle { session, events } = connector
            .producer(&config.endpoint)
            .map_err(|e| classify(e, &endpoint, COMPONENT, "create producer", None))?;
        info!(endpoint = %endpoint, topic = %request.topic, "Created producer");

        let result = track_delivery(session.as_ref(), events, &request, config.flush_timeout).await;

        debug!("Releasing producer");
        drop(session);
        result
    }
}

/// Error sink shared by the listener and the main flow.
///
/// Never blocks: when the channel is full the report is counted in
/// `suppressed` instead.
#[derive(Clone)]
struct ErrorReporter {
    tx: mpsc::Sender<String>,
    suppressed: Arc<AtomicUsize>,
}

impl ErrorReporter {
    fn report(&self, message: String) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.suppressed.fetch_add(1, Ordering::SeqCst);
                warn!(error = %message, "Error channel full; report counted but not queued");
            }
            // receiver already gone, nobody left to tell
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Run the publish sequence against an already-created producer session.
pub async fn track_delivery(
    session: &dyn ProducerSession,
    events: ProducerEvents,
    request: &PublishRequest,
    flush_timeout: Duration,
) -> Result<DeliveredMessage> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (ack_tx, ack_rx) = oneshot::channel::<Option<DeliveredMessage>>();
    let (error_tx, mut error_rx) = mpsc::channel::<String>(ERROR_CHANNEL_CAPACITY);
    let suppressed = Arc::new(AtomicUsize::new(0));
    let reporter = ErrorReporter {
        tx: error_tx,
        suppressed: Arc::clone(&suppressed),
    };

    // The listener must be running before the publish is submitted, or an
    // early delivery report has nobody to classify it.
    let listener = tokio::spawn(listen(events, reporter.clone(), stop_rx, ack_tx));

    if let Err(e) = session.produce(request) {
        reporter.report(format!("error producing the message: {}", e));
    }

    let remaining = session.flush(flush_timeout).await;
    if remaining > 0 {
        reporter.report(format!(
            "failed to flush all messages after {}ms; {} message(s) remain",
            flush_timeout.as_millis(),
            remaining
        ));
    } else {
        info!("All messages flushed from the queue");
    }

    // Our sender must be gone before the drain below, or it never ends.
    drop(reporter);
    let _ = stop_tx.send(());

    let mut errors = Vec::new();
    let delivered = match ack_rx.await {
        Ok(delivered) => delivered,
        Err(_) => {
            let reason = match listener.await {
                Err(join_err) => join_err.to_string(),
                Ok(()) => "listener dropped its acknowledgement".to_string(),
            };
            errors.push(format!(
                "delivery listener exited without acknowledging stop: {}",
                reason
            ));
            None
        }
    };

    while let Some(message) = error_rx.recv().await {
        errors.push(message);
    }

    let suppressed = suppressed.load(Ordering::SeqCst);
    if suppressed > 0 {
        errors.push(format!("{} further error(s) suppressed", suppressed));
    }

    if !errors.is_empty() {
        warn!(errors = errors.len(), "Returning an error from the producer");
        return Err(DiagnosticError::Delivery {
            detail: errors.join("\n"),
        });
    }

    delivered.ok_or_else(|| DiagnosticError::Delivery {
        detail: format!(
            "no delivery report received for the message to topic '{}'",
            request.topic
        ),
    })
}

/// Drain the producer event stream until told to stop.
async fn listen(
    mut events: ProducerEvents,
    reporter: ErrorReporter,
    mut stop_rx: oneshot::Receiver<()>,
    ack_tx: oneshot::Sender<Option<DeliveredMessage>>,
) {
    let mut delivered = None;
    let mut stream_open = true;

    loop {
        tokio::select! {
            biased;

            event = events.recv(), if stream_open => match event {
                Some(event) => classify_event(event, &mut delivered, &reporter),
                None => {
                    debug!("Producer event stream closed");
                    stream_open = false;
                }
            },
            // a dropped sender also means stop
            _ = &mut stop_rx => break,
        }
    }

    // Reports already queued when the stop request won the race.
    while let Ok(event) = events.try_recv() {
        classify_event(event, &mut delivered, &reporter);
    }

    drop(reporter);
    let _ = ack_tx.send(delivered);
}

fn classify_event(
    event: ProducerEvent,
    delivered: &mut Option<DeliveredMessage>,
    reporter: &ErrorReporter,
) {
    match event {
        ProducerEvent::Delivery(DeliveryOutcome::Delivered(message)) => {
            info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                payload = %message.payload_lossy(),
                "Message delivered"
            );
            *delivered = Some(message);
        }
        ProducerEvent::Delivery(DeliveryOutcome::Failed { reason }) => {
            reporter.report(format!("failed to send message: {}", reason));
        }
        ProducerEvent::Error(e) => {
            reporter.report(format!("caught an error: {}", e));
        }
        ProducerEvent::Unrecognized { raw } => {
            reporter.report(format!(
                "got an event that's not a delivery report or error: {}",
                raw
            ));
        }
    }
}
