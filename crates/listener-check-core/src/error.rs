//! Error taxonomy for the listener check.
//!
//! Two layers:
//! - [`BrokerError`]: what a broker client reports (kind + optional native code)
//! - [`DiagnosticError`]: what a stage reports to the orchestrator, already
//!   classified and carrying endpoint/operation context

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a broker client failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerErrorKind {
    /// Client rejected its own configuration.
    InvalidConfig,
    /// Connection could not be established or was lost.
    Transport,
    /// Client-side timeout elapsed.
    TimedOut,
    /// Local producer queue is full.
    QueueFull,
    /// Anything else.
    Other,
}

/// Error reported by a broker collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}{}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    /// Native client error code, when the backend has one.
    pub code: Option<i32>,
    pub detail: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            detail: detail.into(),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::InvalidConfig, detail)
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Transport, detail)
    }

    pub fn timed_out(detail: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::TimedOut, detail)
    }

    pub fn queue_full(detail: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::QueueFull, detail)
    }

    pub fn other(detail: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Other, detail)
    }
}

/// Result type for broker collaborator calls
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Classified stage failure, as surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagnosticError {
    /// Client misconfigured; needs an operator change before retrying.
    #[error(
        "can't create the {component} because it is configured wrong: {detail}\n\
         \tSee https://github.com/confluentinc/librdkafka/blob/master/CONFIGURATION.md"
    )]
    Configuration { component: String, detail: String },

    /// Endpoint could not be reached.
    #[error(
        "{operation} failed: {detail}\n\
         \tIs {endpoint} a valid broker and reachable from the machine on which this is running?\n\
         \tCheck the broker's listener and advertised.listeners configuration and the network path."
    )]
    Reachability {
        endpoint: String,
        operation: String,
        detail: String,
    },

    /// Unexpected event or malformed response from the client.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },

    /// Message not confirmed as delivered.
    #[error("message delivery failed: {detail}")]
    Delivery { detail: String },

    /// A bounded wait was exceeded.
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout { operation: String, timeout: Duration },

    /// Generic broker failure.
    #[error("{operation} failed: {detail}")]
    Broker { operation: String, detail: String },
}

impl DiagnosticError {
    /// Short category name, used in logs and JSON reports.
    pub fn category(&self) -> &'static str {
        match self {
            DiagnosticError::Configuration { .. } => "configuration",
            DiagnosticError::Reachability { .. } => "reachability",
            DiagnosticError::Protocol { .. } => "protocol",
            DiagnosticError::Delivery { .. } => "delivery",
            DiagnosticError::Timeout { .. } => "timeout",
            DiagnosticError::Broker { .. } => "broker",
        }
    }

    /// Whether re-running without operator intervention could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiagnosticError::Reachability { .. }
                | DiagnosticError::Delivery { .. }
                | DiagnosticError::Timeout { .. }
        )
    }
}

/// Map a broker client error into the diagnostic taxonomy.
///
/// `component` names the client being used (admin client, producer, consumer)
/// and `operation` the call that failed; `endpoint` is only quoted for
/// reachability failures. A client-side timeout becomes [`DiagnosticError::Timeout`]
/// only when the caller knows the bound it passed down.
pub fn classify(
    err: BrokerError,
    endpoint: &str,
    component: &str,
    operation: &str,
    timeout: Option<Duration>,
) -> DiagnosticError {
    match (err.kind, timeout) {
        (BrokerErrorKind::InvalidConfig, _) => DiagnosticError::Configuration {
            component: component.to_string(),
            detail: err.to_string(),
        },
        (BrokerErrorKind::Transport, _) => DiagnosticError::Reachability {
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            detail: err.to_string(),
        },
        (BrokerErrorKind::TimedOut, Some(timeout)) => DiagnosticError::Timeout {
            operation: operation.to_string(),
            timeout,
        },
        _ => DiagnosticError::Broker {
            operation: operation.to_string(),
            detail: err.to_string(),
        },
    }
}

/// Result type for diagnostic stages
pub type Result<T> = std::result::Result<T, DiagnosticError>;
