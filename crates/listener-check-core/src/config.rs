//! Diagnostic configuration and its documented defaults.

use std::time::Duration;

use crate::endpoint::BrokerEndpoint;

/// Topic the round-trip message is written to.
pub const DEFAULT_TOPIC: &str = "listener_check_test";

/// Consumer group used by the subscribe stage.
pub const DEFAULT_CONSUMER_GROUP: &str = "kafka-listener-check";

/// Leading text of every generated test payload.
pub const DEFAULT_PAYLOAD_PREFIX: &str = "foo";

/// Bound on the metadata query.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the cluster-id query.
pub const DEFAULT_CLUSTER_ID_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the controller-id query.
pub const DEFAULT_CONTROLLER_ID_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the producer queue flush.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-poll wait in the subscribe loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a diagnostic run needs, injected into each stage.
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    /// Bootstrap endpoint to check
    pub endpoint: BrokerEndpoint,
    /// Topic for the round-trip message
    pub topic: String,
    /// Consumer group id for the subscribe stage
    pub consumer_group: String,
    /// Leading text of the generated payload
    pub payload_prefix: String,
    pub metadata_timeout: Duration,
    pub cluster_id_timeout: Duration,
    pub controller_id_timeout: Duration,
    pub flush_timeout: Duration,
    pub poll_interval: Duration,
    /// Overall bound on the subscribe loop; `None` polls until the message
    /// or a broker error arrives.
    pub consume_deadline: Option<Duration>,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            endpoint: BrokerEndpoint::default(),
            topic: DEFAULT_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            payload_prefix: DEFAULT_PAYLOAD_PREFIX.to_string(),
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            cluster_id_timeout: DEFAULT_CLUSTER_ID_TIMEOUT,
            controller_id_timeout: DEFAULT_CONTROLLER_ID_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            consume_deadline: None,
        }
    }
}

impl DiagnosticConfig {
    /// Defaults, pointed at `endpoint`.
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_payload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.payload_prefix = prefix.into();
        self
    }

    /// Apply one bound to all three probe queries.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self.cluster_id_timeout = timeout;
        self.controller_id_timeout = timeout;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_consume_deadline(mut self, deadline: Duration) -> Self {
        self.consume_deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiagnosticConfig::default();
        assert_eq!(config.endpoint.to_string(), "localhost:9092");
        assert_eq!(config.metadata_timeout, Duration::from_secs(5));
        assert_eq!(config.cluster_id_timeout, Duration::from_secs(5));
        assert_eq!(config.controller_id_timeout, Duration::from_secs(5));
        assert_eq!(config.flush_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.consume_deadline.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = DiagnosticConfig::new(BrokerEndpoint::new("kafka", 29092))
            .with_topic("t1")
            .with_consumer_group("g1")
            .with_query_timeout(Duration::from_secs(2))
            .with_consume_deadline(Duration::from_secs(30));

        assert_eq!(config.endpoint.to_string(), "kafka:29092");
        assert_eq!(config.topic, "t1");
        assert_eq!(config.consumer_group, "g1");
        assert_eq!(config.metadata_timeout, Duration::from_secs(2));
        assert_eq!(config.controller_id_timeout, Duration::from_secs(2));
        assert_eq!(config.consume_deadline, Some(Duration::from_secs(30)));
        // untouched
        assert_eq!(config.flush_timeout, DEFAULT_FLUSH_TIMEOUT);
    }
}
