//! Engine event types.
//!
//! Every event carries an auto-generated `id` (UUID v4), a UTC `timestamp`
//! and a typed payload. The payload determines the topic the event is
//! published on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::{ErrorCode, ExecutionMode};
use crate::registry::{RiskLevel, Version};
use crate::resilience::{Alert, CircuitState};

/// Event topics. Each topic gets its own channel on the [`EventBus`](super::EventBus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "skill:registered")]
    SkillRegistered,
    #[serde(rename = "skill:deprecated")]
    SkillDeprecated,
    #[serde(rename = "execution:start")]
    ExecutionStart,
    #[serde(rename = "execution:complete")]
    ExecutionComplete,
    #[serde(rename = "execution:error")]
    ExecutionError,
    #[serde(rename = "approval:required")]
    ApprovalRequired,
    #[serde(rename = "approval:approved")]
    ApprovalApproved,
    #[serde(rename = "approval:rejected")]
    ApprovalRejected,
    #[serde(rename = "approval:timeout")]
    ApprovalTimeout,
    #[serde(rename = "circuit:state-change")]
    CircuitStateChange,
    #[serde(rename = "watchdog:alert")]
    WatchdogAlert,
    #[serde(rename = "metric:recorded")]
    MetricRecorded,
    #[serde(rename = "alert:raised")]
    AlertRaised,
}

impl EventTopic {
    pub const ALL: [EventTopic; 13] = [
        EventTopic::SkillRegistered,
        EventTopic::SkillDeprecated,
        EventTopic::ExecutionStart,
        EventTopic::ExecutionComplete,
        EventTopic::ExecutionError,
        EventTopic::ApprovalRequired,
        EventTopic::ApprovalApproved,
        EventTopic::ApprovalRejected,
        EventTopic::ApprovalTimeout,
        EventTopic::CircuitStateChange,
        EventTopic::WatchdogAlert,
        EventTopic::MetricRecorded,
        EventTopic::AlertRaised,
    ];

    /// Wire name of the topic, e.g. `"approval:timeout"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::SkillRegistered => "skill:registered",
            EventTopic::SkillDeprecated => "skill:deprecated",
            EventTopic::ExecutionStart => "execution:start",
            EventTopic::ExecutionComplete => "execution:complete",
            EventTopic::ExecutionError => "execution:error",
            EventTopic::ApprovalRequired => "approval:required",
            EventTopic::ApprovalApproved => "approval:approved",
            EventTopic::ApprovalRejected => "approval:rejected",
            EventTopic::ApprovalTimeout => "approval:timeout",
            EventTopic::CircuitStateChange => "circuit:state-change",
            EventTopic::WatchdogAlert => "watchdog:alert",
            EventTopic::MetricRecorded => "metric:recorded",
            EventTopic::AlertRaised => "alert:raised",
        }
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of watchdog alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogAlertKind {
    HeartbeatMissed,
    Unresponsive,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    SkillRegistered {
        name: String,
        version: Version,
    },
    SkillDeprecated {
        name: String,
        version: Version,
        reason: String,
        replacement: Option<String>,
    },
    ExecutionStart {
        request_id: String,
        capability: String,
        version: Version,
        mode: ExecutionMode,
    },
    ExecutionComplete {
        request_id: String,
        capability: String,
        duration_ms: u64,
        executed: bool,
    },
    ExecutionError {
        request_id: String,
        capability: String,
        code: ErrorCode,
        message: String,
    },
    ApprovalRequired {
        request_id: String,
        capability: String,
        risk_level: RiskLevel,
        requested_by: String,
        timeout_ms: u64,
    },
    ApprovalApproved {
        request_id: String,
    },
    ApprovalRejected {
        request_id: String,
        reason: String,
    },
    ApprovalTimeout {
        request_id: String,
        timeout_ms: u64,
    },
    CircuitStateChange {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
    WatchdogAlert {
        process: String,
        alert: WatchdogAlertKind,
        missed_heartbeats: u32,
    },
    /// A point appended to the metric stream.
    MetricPoint {
        metric: String,
        value: f64,
    },
    /// An execution record appended to the ledger.
    LedgerEntry {
        record_id: String,
        capability: String,
        success: bool,
        duration_ms: u64,
    },
    /// A failure-rate or latency threshold crossed for one capability.
    AlertRaised { alert: Alert },
}

impl EventPayload {
    /// Topic this payload is published on.
    pub fn topic(&self) -> EventTopic {
        match self {
            EventPayload::SkillRegistered { .. } => EventTopic::SkillRegistered,
            EventPayload::SkillDeprecated { .. } => EventTopic::SkillDeprecated,
            EventPayload::ExecutionStart { .. } => EventTopic::ExecutionStart,
            EventPayload::ExecutionComplete { .. } => EventTopic::ExecutionComplete,
            EventPayload::ExecutionError { .. } => EventTopic::ExecutionError,
            EventPayload::ApprovalRequired { .. } => EventTopic::ApprovalRequired,
            EventPayload::ApprovalApproved { .. } => EventTopic::ApprovalApproved,
            EventPayload::ApprovalRejected { .. } => EventTopic::ApprovalRejected,
            EventPayload::ApprovalTimeout { .. } => EventTopic::ApprovalTimeout,
            EventPayload::CircuitStateChange { .. } => EventTopic::CircuitStateChange,
            EventPayload::WatchdogAlert { .. } => EventTopic::WatchdogAlert,
            EventPayload::MetricPoint { .. } | EventPayload::LedgerEntry { .. } => {
                EventTopic::MetricRecorded
            }
            EventPayload::AlertRaised { .. } => EventTopic::AlertRaised,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Per-bus emission sequence number, starting at 1.
    pub sequence: u64,
    pub payload: EventPayload,
}

impl EngineEvent {
    pub fn new(sequence: u64, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            sequence,
            payload,
        }
    }

    pub fn topic(&self) -> EventTopic {
        self.payload.topic()
    }
}
