//! Event-classifying subscriber: poll a topic until the expected payload
//! shows up or the broker reports an error.

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::broker::{BrokerConnector, ConsumedEvent, ConsumerSession};
use crate::config::DiagnosticConfig;
use crate::error::{classify, BrokerError, DiagnosticError, Result};
use crate::obs;

const COMPONENT: &str = "consumer";

/// Where the expected message was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumeReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Events inspected, including the match.
    pub events_seen: usize,
    /// Polls that timed out with nothing to report.
    pub idle_polls: usize,
}

/// What the poll loop does after one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    Matched {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Continue,
}

/// Subscribes to one topic and waits for one payload.
pub struct EventClassifyingSubscriber;

impl EventClassifyingSubscriber {
    /// Subscribe to `config.topic` and poll until a message whose payload is
    /// exactly `expected` arrives (success) or the broker reports an error.
    ///
    /// An empty poll is a heartbeat, not a failure: read positions are
    /// logged and polling continues. Without `config.consume_deadline` the
    /// loop has no overall bound.
    pub async fn consume(
        connector: &dyn BrokerConnector,
        config: &DiagnosticConfig,
        expected: &[u8],
    ) -> Result<ConsumeReport> {
        let endpoint = config.endpoint.to_string();
        info!(
            expected = %String::from_utf8_lossy(expected),
            "Starting consumer, looking for specific message"
        );

        let mut consumer = connector
            .consumer(&config.endpoint, &config.consumer_group)
            .map_err(|e| classify(e, &endpoint, COMPONENT, "create consumer", None))?;

        let result = poll_until_match(consumer.as_mut(), config, &endpoint, expected).await;

        debug!("Closing consumer");
        drop(consumer);
        result
    }
}

async fn poll_until_match(
    consumer: &mut dyn ConsumerSession,
    config: &DiagnosticConfig,
    endpoint: &str,
    expected: &[u8],
) -> Result<ConsumeReport> {
    consumer
        .subscribe(&config.topic)
        .map_err(|e| classify(e, endpoint, COMPONENT, "subscribe", None))?;
    info!(topic = %config.topic, "Subscribed to topic");

    let started = Instant::now();
    let mut events_seen = 0;
    let mut idle_polls = 0;

    loop {
        if let Some(deadline) = config.consume_deadline {
            if started.elapsed() >= deadline {
                return Err(DiagnosticError::Timeout {
                    operation: format!("waiting for the test message on topic '{}'", config.topic),
                    timeout: deadline,
                });
            }
        }

        let Some(event) = consumer.poll(config.poll_interval).await else {
            idle_polls += 1;
            heartbeat(consumer);
            continue;
        };
        events_seen += 1;

        if let PollStep::Matched {
            topic,
            partition,
            offset,
        } = classify_event(event, expected, endpoint)?
        {
            info!("Read the message we were waiting for");
            return Ok(ConsumeReport {
                topic,
                partition,
                offset,
                events_seen,
                idle_polls,
            });
        }
    }
}

fn heartbeat(consumer: &dyn ConsumerSession) {
    match consumer.positions() {
        Ok(positions) => obs::emit_heartbeat(&positions),
        Err(e) => debug!(error = %e, "Could not read partition positions"),
    }
}

/// Decide what one polled event means for the loop.
///
/// The event taxonomy is closed: anything unrecognized is a protocol error,
/// never silently skipped. Broker errors are classified against `endpoint`,
/// so a transport failure reads as a reachability problem.
pub fn classify_event(event: ConsumedEvent, expected: &[u8], endpoint: &str) -> Result<PollStep> {
    match event {
        ConsumedEvent::Message {
            topic,
            partition,
            offset,
            payload,
        } => {
            info!(
                payload = %String::from_utf8_lossy(&payload),
                topic = %topic,
                partition = partition,
                offset = offset,
                "Message received"
            );
            if payload == expected {
                Ok(PollStep::Matched {
                    topic,
                    partition,
                    offset,
                })
            } else {
                Ok(PollStep::Continue)
            }
        }
        ConsumedEvent::PartitionEnd {
            topic,
            partition,
            offset,
        } => {
            info!(
                topic = %topic,
                partition = partition,
                offset = offset,
                "Got to the end of partition"
            );
            Ok(PollStep::Continue)
        }
        ConsumedEvent::CommitAck => Ok(PollStep::Continue),
        ConsumedEvent::BrokerError { kind, code, detail } => {
            let err = BrokerError { kind, code, detail };
            Err(classify(err, endpoint, COMPONENT, "consume", None))
        }
        ConsumedEvent::Unrecognized { raw } => Err(DiagnosticError::Protocol {
            detail: format!(
                "got an event that's not a message, error, partition end or commit: {}",
                raw
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerErrorKind;
    use crate::fakes::MemoryBroker;
    use std::time::Duration;

    const EP: &str = "localhost:9092";

    fn message(payload: &str) -> ConsumedEvent {
        ConsumedEvent::Message {
            topic: "t1".to_string(),
            partition: 0,
            offset: 7,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_exact_payload_matches() {
        let step = classify_event(message("foo / run-1"), b"foo / run-1", EP).unwrap();
        assert_eq!(
            step,
            PollStep::Matched {
                topic: "t1".to_string(),
                partition: 0,
                offset: 7
            }
        );
    }

    #[test]
    fn test_other_payload_continues() {
        let step = classify_event(message("foo / run-0"), b"foo / run-1", EP).unwrap();
        assert_eq!(step, PollStep::Continue);

        let step = classify_event(message("foo / run-1 "), b"foo / run-1", EP).unwrap();
        assert_eq!(step, PollStep::Continue);
    }

    #[test]
    fn test_partition_end_and_commit_never_terminate() {
        let eof = ConsumedEvent::PartitionEnd {
            topic: "t1".to_string(),
            partition: 0,
            offset: 3,
        };
        assert_eq!(classify_event(eof, b"x", EP).unwrap(), PollStep::Continue);
        assert_eq!(
            classify_event(ConsumedEvent::CommitAck, b"x", EP).unwrap(),
            PollStep::Continue
        );
    }

    #[test]
    fn test_broker_error_terminates() {
        let err = classify_event(
            ConsumedEvent::BrokerError {
                kind: BrokerErrorKind::Other,
                code: Some(3),
                detail: "Broker: Unknown topic or partition".to_string(),
            },
            b"x",
            EP,
        )
        .unwrap_err();
        assert_eq!(err.category(), "broker");
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn test_transport_error_is_reachability() {
        let err = classify_event(
            ConsumedEvent::BrokerError {
                kind: BrokerErrorKind::Transport,
                code: Some(-187),
                detail: "1/1 brokers are down".to_string(),
            },
            b"x",
            "kafka.internal:9092",
        )
        .unwrap_err();
        assert_eq!(err.category(), "reachability");
        let msg = err.to_string();
        assert!(msg.starts_with("consume failed"));
        assert!(msg.contains("kafka.internal:9092"));
        assert!(msg.contains("code -187"));
    }

    #[tokio::test]
    async fn test_consume_stops_on_unreachable_advertised_broker() {
        let broker = MemoryBroker::new()
            .with_consumer_event(ConsumedEvent::BrokerError {
                kind: BrokerErrorKind::Transport,
                code: Some(-195),
                detail: "10.0.0.5:9092/1: Connect to ipv4#10.0.0.5:9092 failed".to_string(),
            })
            .seed_message("t1", "foo / run-1");
        let config = DiagnosticConfig::default().with_topic("t1");

        let err = EventClassifyingSubscriber::consume(&broker, &config, b"foo / run-1")
            .await
            .unwrap_err();

        assert!(matches!(err, DiagnosticError::Reachability { .. }));
        assert!(err.to_string().contains("localhost:9092"));
        assert_eq!(broker.open_sessions(), 0);
    }

    #[test]
    fn test_unrecognized_is_protocol_error() {
        let err = classify_event(
            ConsumedEvent::Unrecognized {
                raw: "Stats({...})".to_string(),
            },
            b"x",
            EP,
        )
        .unwrap_err();
        assert_eq!(err.category(), "protocol");
        assert!(err.to_string().contains("Stats"));
    }

    #[tokio::test]
    async fn test_consume_skips_older_messages_and_noise() {
        let broker = MemoryBroker::new()
            .with_consumer_event(ConsumedEvent::CommitAck)
            .with_consumer_event(ConsumedEvent::PartitionEnd {
                topic: "t1".to_string(),
                partition: 0,
                offset: 0,
            })
            .seed_message("t1", "foo / run-0")
            .seed_message("t1", "foo / run-1");
        let config = DiagnosticConfig::default().with_topic("t1");

        let report = EventClassifyingSubscriber::consume(&broker, &config, b"foo / run-1")
            .await
            .expect("consume failed");

        assert_eq!(report.offset, 1);
        assert_eq!(report.events_seen, 4);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_polls_query_positions() {
        let broker = MemoryBroker::new();
        let config = DiagnosticConfig::default()
            .with_topic("t1")
            .with_consume_deadline(Duration::from_secs(3));

        let err = EventClassifyingSubscriber::consume(&broker, &config, b"never")
            .await
            .unwrap_err();

        assert_eq!(err.category(), "timeout");
        assert!(broker.position_queries() >= 2);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_releases_consumer() {
        let broker = MemoryBroker::new().fail_subscribe(BrokerError::other("Invalid topic"));
        let config = DiagnosticConfig::default().with_topic("t1");

        let err = EventClassifyingSubscriber::consume(&broker, &config, b"x")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("subscribe failed"));
        assert_eq!(broker.open_sessions(), 0);
    }
}
