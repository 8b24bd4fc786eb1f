//! Broker endpoint descriptor.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Default bootstrap host when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Default bootstrap port when none is configured.
pub const DEFAULT_PORT: u16 = 9092;

/// A cluster contact point: the `host:port` a client bootstraps from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    host: String,
    port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether an advertised `(host, port)` pair is exactly this endpoint.
    pub fn matches(&self, host: &str, port: i32) -> bool {
        self.host == host && i32::from(self.port) == port
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a `host:port` string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("{0} doesn't look like a host:port")]
    NotHostPort(String),

    #[error("{port} is not a valid port number")]
    InvalidPort { port: String },
}

impl FromStr for BrokerEndpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| EndpointParseError::NotHostPort(s.to_string()))?;

        if host.is_empty() || port.contains(':') {
            return Err(EndpointParseError::NotHostPort(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort {
                port: port.to_string(),
            })?;

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let ep: BrokerEndpoint = "broker-1.internal:29092".parse().unwrap();
        assert_eq!(ep.host(), "broker-1.internal");
        assert_eq!(ep.port(), 29092);
        assert_eq!(ep.to_string(), "broker-1.internal:29092");
    }

    #[test]
    fn test_default_is_localhost_9092() {
        assert_eq!(BrokerEndpoint::default().to_string(), "localhost:9092");
    }

    #[test]
    fn test_parse_rejects_missing_colon() {
        let err = "localhost".parse::<BrokerEndpoint>().unwrap_err();
        assert_eq!(err, EndpointParseError::NotHostPort("localhost".to_string()));
    }

    #[test]
    fn test_parse_rejects_extra_colons() {
        assert!("a:b:9092".parse::<BrokerEndpoint>().is_err());
        assert!(":9092".parse::<BrokerEndpoint>().is_err());
    }

    #[test]
    fn test_parse_rejects_non_numeric_port() {
        let err = "localhost:kafka".parse::<BrokerEndpoint>().unwrap_err();
        assert!(err.to_string().contains("kafka"));
        assert!("localhost:70000".parse::<BrokerEndpoint>().is_err());
    }

    #[test]
    fn test_matches_requires_host_and_port() {
        let ep = BrokerEndpoint::new("localhost", 9092);
        assert!(ep.matches("localhost", 9092));
        assert!(!ep.matches("10.0.0.5", 9092));
        assert!(!ep.matches("localhost", 29092));
    }
}
