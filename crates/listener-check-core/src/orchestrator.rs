//! Diagnostic orchestration: Probe → Publish → Consume.

use std::future::Future;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::broker::{BrokerConnector, DeliveredMessage};
use crate::config::DiagnosticConfig;
use crate::error::{DiagnosticError, Result};
use crate::obs;
use crate::probe::{ClusterProbe, ProbeReport};
use crate::publisher::DeliveryTrackedPublisher;
use crate::subscriber::{ConsumeReport, EventClassifyingSubscriber};

/// Diagnostic stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Probe,
    Publish,
    Consume,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Probe, Stage::Publish, Stage::Consume];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Probe => "probe",
            Stage::Publish => "publish",
            Stage::Consume => "consume",
        }
    }

    /// Client used by the stage, for human-readable output.
    pub fn component(&self) -> &'static str {
        match self {
            Stage::Probe => "admin client",
            Stage::Publish => "producer",
            Stage::Consume => "consumer",
        }
    }
}

/// Pass/fail for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    Failed(DiagnosticError),
}

impl StageOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, StageOutcome::Passed)
    }

    pub fn error(&self) -> Option<&DiagnosticError> {
        match self {
            StageOutcome::Passed => None,
            StageOutcome::Failed(e) => Some(e),
        }
    }
}

impl Serialize for StageOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            StageOutcome::Passed => {
                let mut s = serializer.serialize_struct("StageOutcome", 1)?;
                s.serialize_field("status", "passed")?;
                s.end()
            }
            StageOutcome::Failed(e) => {
                let mut s = serializer.serialize_struct("StageOutcome", 4)?;
                s.serialize_field("status", "failed")?;
                s.serialize_field("category", e.category())?;
                s.serialize_field("retryable", &e.is_retryable())?;
                s.serialize_field("message", &e.to_string())?;
                s.end()
            }
        }
    }
}

/// Result of one attempted stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

/// Delivered test message, rendered for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: String,
}

impl From<&DeliveredMessage> for PublishReport {
    fn from(message: &DeliveredMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            payload: message.payload_lossy(),
        }
    }
}

/// Everything one diagnostic run found out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    pub endpoint: String,
    pub topic: String,
    /// Attempted stages only; a failed stage halts the ones after it.
    pub results: Vec<DiagnosticResult>,
    pub probe: Option<ProbeReport>,
    pub published: Option<PublishReport>,
    pub consumed: Option<ConsumeReport>,
}

impl DiagnosticReport {
    fn new(config: &DiagnosticConfig) -> Self {
        Self {
            endpoint: config.endpoint.to_string(),
            topic: config.topic.clone(),
            results: Vec::new(),
            probe: None,
            published: None,
            consumed: None,
        }
    }

    /// True only when every stage ran and passed.
    pub fn all_passed(&self) -> bool {
        Stage::ALL.iter().all(|stage| {
            self.result(*stage)
                .map(|r| r.outcome.passed())
                .unwrap_or(false)
        })
    }

    pub fn result(&self, stage: Stage) -> Option<&DiagnosticResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn failed_stage(&self) -> Option<&DiagnosticResult> {
        self.results.iter().find(|r| !r.outcome.passed())
    }

    /// Stages never attempted because an earlier one failed.
    pub fn skipped_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .iter()
            .copied()
            .filter(|stage| self.result(*stage).is_none())
            .collect()
    }

    pub fn listener_warning(&self) -> Option<&str> {
        self.probe.as_ref()?.listener_warning.as_deref()
    }
}

/// Sequences the three stages, short-circuiting on the first failure.
pub struct ListenerCheck;

impl ListenerCheck {
    /// Run Probe → Publish → Consume against `config.endpoint`.
    ///
    /// Never fails as a whole: stage failures are recorded in the report and
    /// halt the remaining stages. Errors are reported as the stages
    /// classified them.
    pub async fn run(connector: &dyn BrokerConnector, config: &DiagnosticConfig) -> DiagnosticReport {
        let mut report = DiagnosticReport::new(config);
        info!(endpoint = %report.endpoint, topic = %report.topic, "Starting listener check");

        let Some(probe) = run_stage(
            &mut report,
            Stage::Probe,
            ClusterProbe::run(connector, config),
        )
        .await
        else {
            return report;
        };
        report.probe = Some(probe);

        let Some(delivered) = run_stage(
            &mut report,
            Stage::Publish,
            DeliveryTrackedPublisher::publish(connector, config),
        )
        .await
        else {
            return report;
        };
        report.published = Some(PublishReport::from(&delivered));

        if let Some(consumed) = run_stage(
            &mut report,
            Stage::Consume,
            EventClassifyingSubscriber::consume(connector, config, &delivered.payload),
        )
        .await
        {
            report.consumed = Some(consumed);
        }

        report
    }
}

async fn run_stage<T, F>(report: &mut DiagnosticReport, stage: Stage, work: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    let span = obs::stage_span(stage.name(), &report.endpoint);
    let started = Instant::now();

    let result = async {
        obs::emit_stage_started(stage.name());
        work.await
    }
    .instrument(span.clone())
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    span.in_scope(|| obs::emit_stage_finished(stage.name(), duration_ms, result.is_ok()));

    match result {
        Ok(value) => {
            report.results.push(DiagnosticResult {
                stage,
                outcome: StageOutcome::Passed,
                duration_ms,
            });
            Some(value)
        }
        Err(e) => {
            warn!(stage = stage.name(), category = e.category(), error = %e, "Stage failed");
            report.results.push(DiagnosticResult {
                stage,
                outcome: StageOutcome::Failed(e),
                duration_ms,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::fakes::MemoryBroker;

    #[tokio::test]
    async fn test_all_stages_pass_against_healthy_broker() {
        let broker = MemoryBroker::new();
        let report = ListenerCheck::run(&broker, &DiagnosticConfig::default()).await;

        assert!(report.all_passed());
        assert_eq!(report.results.len(), 3);
        assert!(report.skipped_stages().is_empty());
        assert!(report.listener_warning().is_none());
        let published = report.published.as_ref().unwrap();
        assert_eq!(published.topic, "listener_check_test");
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_skips_remaining_stages() {
        let broker =
            MemoryBroker::new().fail_admin_connect(BrokerError::invalid_config("bad property"));
        let report = ListenerCheck::run(&broker, &DiagnosticConfig::default()).await;

        assert!(!report.all_passed());
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.failed_stage().unwrap().stage, Stage::Probe);
        assert_eq!(report.skipped_stages(), vec![Stage::Publish, Stage::Consume]);
    }

    #[test]
    fn test_stage_outcome_serializes_category() {
        let outcome = StageOutcome::Failed(DiagnosticError::Delivery {
            detail: "1 message(s) remain".to_string(),
        });
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["category"], "delivery");
        assert_eq!(value["retryable"], true);

        let value = serde_json::to_value(StageOutcome::Passed).unwrap();
        assert_eq!(value["status"], "passed");
    }

    #[test]
    fn test_empty_report_has_not_passed() {
        let report = DiagnosticReport::new(&DiagnosticConfig::default());
        assert!(!report.all_passed());
        assert_eq!(report.skipped_stages().len(), 3);
    }
}
