//! Kafka listener check CLI
//!
//! `kafka-listener-check [BROKER]` probes a broker's metadata, publishes one
//! test message with delivery tracking and reads it back, then prints what
//! worked and what didn't. Exits non-zero when any stage fails.

use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use listener_check_core::{
    BrokerEndpoint, DiagnosticConfig, DiagnosticReport, EndpointParseError, Stage, StageOutcome,
};
use tracing::{debug, Level};

const SEPARATOR: &str = "--------------------------";

#[derive(Parser)]
#[command(name = "kafka-listener-check")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Check that a Kafka client can reach a broker, produce and consume",
    long_about = None
)]
struct Cli {
    /// Bootstrap broker as host:port (default: localhost:9092)
    broker: Option<String>,

    /// Topic to produce to and consume from
    #[arg(short, long, env = "LISTENER_CHECK_TOPIC", default_value = listener_check_core::config::DEFAULT_TOPIC)]
    topic: String,

    /// Consumer group id
    #[arg(short, long, env = "LISTENER_CHECK_GROUP", default_value = listener_check_core::config::DEFAULT_CONSUMER_GROUP)]
    group: String,

    /// Give up waiting for the test message after this many seconds (default: wait forever)
    #[arg(long, value_name = "SECS")]
    consume_timeout: Option<u64>,

    /// Extra client property passed to librdkafka, e.g. -X security.protocol=SSL
    #[arg(short = 'X', long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Print the report as JSON instead of the human-readable summary
    #[arg(long)]
    report_json: bool,
}

impl Cli {
    fn diagnostic_config(&self, endpoint: BrokerEndpoint) -> DiagnosticConfig {
        let config = DiagnosticConfig::new(endpoint)
            .with_topic(self.topic.clone())
            .with_consumer_group(self.group.clone());
        match self.consume_timeout {
            Some(secs) => config.with_consume_deadline(Duration::from_secs(secs)),
            None => config,
        }
    }
}

fn parse_property(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("'{}' is not KEY=VALUE", s)),
    }
}

/// Endpoint to check, plus a note to print when the argument was absent or
/// unusable.
fn resolve_endpoint(arg: Option<&str>) -> (BrokerEndpoint, Option<String>) {
    let fallback = BrokerEndpoint::default();
    let Some(arg) = arg else {
        return (
            fallback.clone(),
            Some(format!("(No broker specified, so defaulting to {})", fallback)),
        );
    };

    match arg.parse::<BrokerEndpoint>() {
        Ok(endpoint) => (endpoint, None),
        Err(e @ EndpointParseError::InvalidPort { .. }) => {
            let note = format!("({}, so ignoring it and defaulting to {})", e, fallback);
            (fallback, Some(note))
        }
        Err(e @ EndpointParseError::NotHostPort(_)) => {
            let note = format!("(Commandline value {}, so defaulting to {})", e, fallback);
            (fallback, Some(note))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    listener_check_core::init_tracing(cli.json, level);

    let (endpoint, note) = resolve_endpoint(cli.broker.as_deref());
    if let Some(note) = note {
        println!("{}\n", note);
    }
    let config = cli.diagnostic_config(endpoint);
    debug!(?config, "Resolved configuration");

    let report = run_check(&config, &cli.properties).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if cli.report_json {
        serde_json::to_writer_pretty(&mut out, &report).context("Failed to write JSON report")?;
        writeln!(out)?;
    } else {
        render_report(&report, &mut out).context("Failed to write report")?;
    }

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(feature = "kafka")]
async fn run_check(
    config: &DiagnosticConfig,
    properties: &[(String, String)],
) -> Result<DiagnosticReport> {
    let connector = properties
        .iter()
        .fold(listener_check_core::KafkaConnector::new(), |c, (k, v)| {
            c.with_property(k.clone(), v.clone())
        });
    Ok(listener_check_core::ListenerCheck::run(&connector, config).await)
}

#[cfg(not(feature = "kafka"))]
async fn run_check(
    _config: &DiagnosticConfig,
    _properties: &[(String, String)],
) -> Result<DiagnosticReport> {
    anyhow::bail!("built without Kafka support; rebuild without `--no-default-features`")
}

fn heading(stage: Stage) -> &'static str {
    match stage {
        Stage::Probe => "AdminClient",
        Stage::Publish => "Producer",
        Stage::Consume => "Consumer",
    }
}

/// Human-readable summary, one block per stage.
fn render_report(report: &DiagnosticReport, out: &mut impl Write) -> io::Result<()> {
    writeln!(
        out,
        "Checking {} using topic '{}'\n",
        report.endpoint, report.topic
    )?;

    for result in &report.results {
        match &result.outcome {
            StageOutcome::Passed => {
                writeln!(
                    out,
                    "✅ {} worked ({}ms)",
                    heading(result.stage),
                    result.duration_ms
                )?;
                render_details(report, result.stage, out)?;
            }
            StageOutcome::Failed(e) => {
                writeln!(
                    out,
                    "❌ There was a problem calling the {}:\n{}",
                    result.stage.component(),
                    e
                )?;
                writeln!(
                    out,
                    "   ({} error, {})",
                    e.category(),
                    if e.is_retryable() {
                        "may pass on a re-run"
                    } else {
                        "needs a configuration change"
                    }
                )?;
            }
        }
        writeln!(out, "{}\n", SEPARATOR)?;
    }

    for stage in report.skipped_stages() {
        writeln!(out, "⏭  {} skipped", heading(stage))?;
    }

    if report.all_passed() {
        writeln!(out, "✅ All stages passed")?;
    }
    Ok(())
}

fn render_details(report: &DiagnosticReport, stage: Stage, out: &mut impl Write) -> io::Result<()> {
    match stage {
        Stage::Probe => {
            let Some(probe) = &report.probe else {
                return Ok(());
            };
            writeln!(
                out,
                "   Connected to {} [ID {}]",
                probe.originating_broker.name, probe.originating_broker.id
            )?;
            writeln!(out, "   ClusterId: {}", probe.cluster_id)?;
            writeln!(out, "   ControllerId: {}", probe.controller_id)?;
            writeln!(out, "   Advertised listeners:")?;
            for broker in &probe.advertised {
                writeln!(out, "     {}", broker)?;
            }
            if let Some(warning) = &probe.listener_warning {
                writeln!(out, "\n⚠️  {}", warning)?;
            }
        }
        Stage::Publish => {
            if let Some(published) = &report.published {
                writeln!(
                    out,
                    "   📬 Message '{}' delivered to topic '{}' (partition {} at offset {})",
                    published.payload, published.topic, published.partition, published.offset
                )?;
            }
        }
        Stage::Consume => {
            if let Some(consumed) = &report.consumed {
                writeln!(
                    out,
                    "   💌 Message received from topic '{}' (partition {} at offset {}) after {} event(s)",
                    consumed.topic, consumed.partition, consumed.offset, consumed.events_seen
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use listener_check_core::{BrokerError, BrokerNode, ListenerCheck, MemoryBroker};

    fn render(report: &DiagnosticReport) -> String {
        let mut buf = Vec::new();
        render_report(report, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_resolve_endpoint_accepts_host_port() {
        let (endpoint, note) = resolve_endpoint(Some("broker:29092"));
        assert_eq!(endpoint.to_string(), "broker:29092");
        assert!(note.is_none());
    }

    #[test]
    fn test_resolve_endpoint_defaults_with_note() {
        let (endpoint, note) = resolve_endpoint(None);
        assert_eq!(endpoint.to_string(), "localhost:9092");
        assert!(note.unwrap().contains("localhost:9092"));

        let (endpoint, note) = resolve_endpoint(Some("broker"));
        assert_eq!(endpoint.to_string(), "localhost:9092");
        assert!(note.unwrap().contains("broker"));

        let (endpoint, note) = resolve_endpoint(Some("broker:abc"));
        assert_eq!(endpoint.to_string(), "localhost:9092");
        assert!(note.unwrap().contains("abc is not a valid port"));
    }

    #[test]
    fn test_kafka_backend_is_a_default_feature() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let manifest = std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
        assert!(
            manifest.contains(r#"default = ["kafka"]"#),
            "a plain build must be able to run a check"
        );
    }

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("security.protocol=SSL").unwrap(),
            ("security.protocol".to_string(), "SSL".to_string())
        );
        assert!(parse_property("security.protocol").is_err());
        assert!(parse_property("=SSL").is_err());
    }

    #[test]
    fn test_cli_builds_config() {
        let cli = Cli::parse_from([
            "kafka-listener-check",
            "broker:9093",
            "--topic",
            "t1",
            "--consume-timeout",
            "30",
            "-X",
            "client.id=check",
        ]);
        let (endpoint, _) = resolve_endpoint(cli.broker.as_deref());
        let config = cli.diagnostic_config(endpoint);
        assert_eq!(config.endpoint.to_string(), "broker:9093");
        assert_eq!(config.topic, "t1");
        assert_eq!(config.consume_deadline, Some(Duration::from_secs(30)));
        assert_eq!(cli.properties.len(), 1);
    }

    #[tokio::test]
    async fn test_render_healthy_run() {
        let report = ListenerCheck::run(&MemoryBroker::new(), &DiagnosticConfig::default()).await;
        let text = render(&report);
        assert!(text.contains("✅ AdminClient worked"));
        assert!(text.contains("✅ Producer worked"));
        assert!(text.contains("✅ Consumer worked"));
        assert!(text.contains("✅ All stages passed"));
        assert!(!text.contains("⚠️"));
    }

    #[tokio::test]
    async fn test_render_shows_mismatch_banner() {
        let broker = MemoryBroker::new().with_advertised(vec![BrokerNode::new(1, "10.0.0.5", 9092)]);
        let report = ListenerCheck::run(&broker, &DiagnosticConfig::default()).await;
        let text = render(&report);
        assert!(text.contains("⚠️"));
        assert!(text.contains("[ID 1] 10.0.0.5:9092"));
    }

    #[tokio::test]
    async fn test_render_failure_and_skipped_stages() {
        let broker = MemoryBroker::new().fail_admin_connect(BrokerError::transport("refused"));
        let report = ListenerCheck::run(&broker, &DiagnosticConfig::default()).await;
        let text = render(&report);
        assert!(text.contains("❌ There was a problem calling the admin client"));
        assert!(text.contains("reachability error"));
        assert!(text.contains("⏭  Producer skipped"));
        assert!(text.contains("⏭  Consumer skipped"));
        assert!(!text.contains("All stages passed"));
    }
}
