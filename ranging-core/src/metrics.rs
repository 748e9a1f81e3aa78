//! # metrics
//!
//! Structured lifecycle event emission. One record per transition, one
//! append path, fire-and-forget — a sink failure never touches session
//! state. Records are emitted, not owned: persistence lives with the host.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use ranging_types::Technology;

use crate::event::StopReason;
use crate::session::SessionId;

// ── Record ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    SessionCreated,
    SessionStarted,
    SessionStopped,
    TechnologyStarted,
    TechnologyStopped,
    OobSelectionSucceeded,
    OobSelectionFailed,
    WatchdogFired,
    MeasurementLimitReached,
    ClientDeath,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    /// Wall-clock milliseconds since epoch
    pub timestamp_ms: i64,
    pub kind: MetricKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technology: Option<Technology>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl MetricRecord {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            session: None,
            technology: None,
            reason: None,
            detail: None,
        }
    }

    pub fn session(mut self, id: SessionId) -> Self {
        self.session = Some(id);
        self
    }

    pub fn technology(mut self, tech: Technology) -> Self {
        self.technology = Some(tech);
        self
    }

    pub fn reason(mut self, reason: StopReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

pub trait MetricsSink: Send + Sync {
    fn emit(&self, record: MetricRecord);
}

/// Emits records as JSON lines through `tracing` (target `ranging::metrics`).
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn emit(&self, record: MetricRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => info!(target: "ranging::metrics", "{line}"),
            Err(e) => tracing::warn!("metrics: failed to serialize record: {e}"),
        }
    }
}

/// Swallows everything. For tests and hosts that wire their own telemetry.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn emit(&self, _record: MetricRecord) {}
}
