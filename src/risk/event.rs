//! Risk events surfaced to the monitoring boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::supervisor::SupervisorState;

/// Severity levels for risk events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// Which configured limit was breached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BreachKind {
    VolatilityRegime,
    GammaExposure,
    NormalizedDelta,
    DailyLoss,
    Leverage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Breach {
    pub kind: BreachKind,
    pub measured: f64,
    pub limit: f64,
}

/// How a pause ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResumeTrigger {
    Acknowledged,
    NewSession,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RiskEventKind {
    /// One or more risk limits breached; system paused
    LimitBreach { breaches: Vec<Breach> },
    /// Tick skipped because no usable snapshot arrived
    DataGap { reason: String },
    /// Too many consecutive ticks built from degraded inputs
    DegradedInput { consecutive: u32, fields: Vec<String> },
    /// Pause lifted
    Resumed { trigger: ResumeTrigger },
    /// Policy output unusable; fallback allocation dispatched
    InferenceFallback { reason: String },
    /// Learning updates discarded for exceeding sanity bounds
    LearningDiverged { consecutive: u32, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: RiskEventKind,
    pub severity: AlertSeverity,
    /// Supervisor state after the event; `None` for learner events
    pub state: Option<SupervisorState>,
    pub message: String,
}

impl RiskEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        kind: RiskEventKind,
        severity: AlertSeverity,
        state: Option<SupervisorState>,
        message: String,
    ) -> Self {
        let event_id = format!(
            "risk-{}-{}",
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );
        Self {
            event_id,
            timestamp,
            kind,
            severity,
            state,
            message,
        }
    }

    /// Short machine-readable label for the event kind.
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            RiskEventKind::LimitBreach { .. } => "limit_breach",
            RiskEventKind::DataGap { .. } => "data_gap",
            RiskEventKind::DegradedInput { .. } => "degraded_input",
            RiskEventKind::Resumed { .. } => "resumed",
            RiskEventKind::InferenceFallback { .. } => "inference_fallback",
            RiskEventKind::LearningDiverged { .. } => "learning_diverged",
        }
    }

    /// Emit as a single-line JSON log on the `risk_event` target.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_event", "RISK_EVENT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_event", "RISK_EVENT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "risk_event", "RISK_EVENT: {}", json)
            }
        }
    }
}
