//! Log output for the listener check.
//!
//! Logs always go to stderr; stdout is reserved for the report.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// librdkafka's own log lines are noisy below `warn`.
const CLIENT_LOG_DIRECTIVE: &str = "rdkafka=warn";

/// Filter used when `RUST_LOG` is unset: `level` for the check itself, with
/// the Kafka client held at warnings unless `level` is already quieter.
pub fn default_filter(level: Level) -> String {
    if level < Level::WARN {
        level.as_str().to_lowercase()
    } else {
        format!("{},{}", level.as_str().to_lowercase(), CLIENT_LOG_DIRECTIVE)
    }
}

/// Install the global subscriber. `RUST_LOG` overrides [`default_filter`].
/// Later calls are no-ops.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let stage_logs = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(stage_logs.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stage_logs)
            .try_init()
    };
    // already installed by an earlier call or the embedding program
    let _ = installed;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_client_logs() {
        assert_eq!(default_filter(Level::INFO), "info,rdkafka=warn");
        assert_eq!(default_filter(Level::DEBUG), "debug,rdkafka=warn");
    }

    #[test]
    fn test_default_filter_at_error_needs_no_client_directive() {
        assert_eq!(default_filter(Level::ERROR), "error");
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
        tracing::info!("still logging");
    }
}
