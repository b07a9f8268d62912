use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionFailure, ExecutionMode};
use crate::capabilities::{CapabilityOutput, PlannedEffect, Snapshot};

/// What a non-committing run would do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub effects: Vec<PlannedEffect>,
    /// `effects` rendered as "would ..." lines.
    pub summary: Vec<String>,
    /// Set in preview mode: combined schema and capability validation.
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

impl Preview {
    pub fn from_effects(effects: Vec<PlannedEffect>) -> Self {
        let summary = effects.iter().map(PlannedEffect::describe).collect();
        Self {
            effects,
            summary,
            ..Default::default()
        }
    }
}

/// Reference to a snapshot taken before a sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub resource: String,
    pub taken_at: DateTime<Utc>,
}

impl From<&Snapshot> for SnapshotRef {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            resource: snapshot.resource.clone(),
            taken_at: snapshot.taken_at,
        }
    }
}

/// Result of restoring a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub snapshot_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Structured result of one executor run. Never an `Err`: every failure is
/// carried in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Whether the capability's `execute` was invoked.
    pub executed: bool,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub preview: Option<Preview>,
    #[serde(default)]
    pub snapshot: Option<SnapshotRef>,
    #[serde(default)]
    pub rollback: Option<RollbackOutcome>,
    #[serde(default)]
    pub output: Option<CapabilityOutput>,
    #[serde(default)]
    pub error: Option<ExecutionFailure>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub(crate) fn new(mode: ExecutionMode) -> Self {
        Self {
            success: false,
            executed: false,
            mode,
            preview: None,
            snapshot: None,
            rollback: None,
            output: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub(crate) fn failed(mut self, error: impl Into<ExecutionFailure>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub(crate) fn succeeded(mut self) -> Self {
        self.success = true;
        self.error = None;
        self
    }
}
