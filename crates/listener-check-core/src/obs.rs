//! Structured observability hooks for diagnostic stages.
//!
//! This module provides:
//! - Stage-scoped tracing spans, attached to stage futures with
//!   `tracing::Instrument` so they stay correct across `.await`
//! - Emission functions for stage start/finish, the advertised-listener
//!   mismatch warning and subscriber heartbeats

use tracing::{info, warn};

use crate::broker::PartitionPosition;

/// Span tagged with the stage name and endpoint.
pub fn stage_span(stage: &str, endpoint: &str) -> tracing::Span {
    tracing::info_span!("listener_check.stage", stage = %stage, endpoint = %endpoint)
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: &str, duration_ms: u64, passed: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        duration_ms = duration_ms,
        passed = passed,
    );
}

/// Emit event: no advertised listener matches the bootstrap endpoint.
pub fn emit_listener_mismatch(endpoint: &str, advertised: &[String]) {
    warn!(
        event = "probe.listener_mismatch",
        endpoint = %endpoint,
        advertised = ?advertised,
        "none of the advertised listeners match the bootstrap endpoint"
    );
}

/// Emit event: subscriber poll came back empty; report read positions.
pub fn emit_heartbeat(positions: &[PartitionPosition]) {
    if positions.is_empty() {
        info!(event = "consume.heartbeat", "no partitions assigned yet");
    }
    for p in positions {
        info!(
            event = "consume.heartbeat",
            topic = %p.topic,
            partition = p.partition,
            offset = ?p.offset,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_span_scopes_emitters() {
        let span = stage_span("probe", "localhost:9092");
        span.in_scope(|| {
            emit_stage_started("probe");
            emit_stage_finished("probe", 12, true);
        });
    }

    #[test]
    fn test_emitters_do_not_panic() {
        emit_listener_mismatch("localhost:9092", &["10.0.0.5:9092".to_string()]);
        emit_heartbeat(&[]);
        emit_heartbeat(&[PartitionPosition {
            topic: "t1".to_string(),
            partition: 0,
            offset: Some(3),
        }]);
    }
}
