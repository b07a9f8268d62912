use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approval::DuplicateApproval;
use crate::registry::VersionError;
use crate::resilience::{CircuitOpenError, RateLimitExceeded};

/// Everything that can make an execution fail.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Capability not found: {name}{}", .range.as_ref().map(|r| format!(" ({r})")).unwrap_or_default())]
    CapabilityNotFound { name: String, range: Option<String> },

    #[error("Invalid version range: {0}")]
    InvalidVersionRange(#[from] VersionError),

    #[error("Input validation failed: {0}")]
    ValidationFailed(String),

    #[error("Output validation failed: {0}")]
    OutputValidationFailed(String),

    #[error("Execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Capability failed: {0}")]
    CapabilityFailed(String),

    #[error("Capability panicked: {0}")]
    CapabilityPanicked(String),

    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("Unsatisfied dependencies for {capability}: {}", .missing.join(", "))]
    DependencyMissing {
        capability: String,
        missing: Vec<String>,
    },

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("Approval rejected: {reason}")]
    ApprovalRejected { reason: String },

    #[error("Approval timed out after {timeout_ms}ms")]
    ApprovalTimeout { timeout_ms: u64 },

    #[error(transparent)]
    DuplicateRequest(#[from] DuplicateApproval),
}

/// Stable, serializable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapabilityNotFound,
    InvalidVersionRange,
    ValidationFailed,
    OutputValidationFailed,
    ExecutionTimeout,
    CircuitOpen,
    CapabilityFailed,
    CapabilityPanicked,
    SnapshotFailed,
    DependencyMissing,
    RateLimited,
    ApprovalRejected,
    ApprovalTimeout,
    DuplicateRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapabilityNotFound => "capability_not_found",
            ErrorCode::InvalidVersionRange => "invalid_version_range",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::OutputValidationFailed => "output_validation_failed",
            ErrorCode::ExecutionTimeout => "execution_timeout",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::CapabilityFailed => "capability_failed",
            ErrorCode::CapabilityPanicked => "capability_panicked",
            ErrorCode::SnapshotFailed => "snapshot_failed",
            ErrorCode::DependencyMissing => "dependency_missing",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::ApprovalRejected => "approval_rejected",
            ErrorCode::ApprovalTimeout => "approval_timeout",
            ErrorCode::DuplicateRequest => "duplicate_request",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExecutionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutionError::CapabilityNotFound { .. } => ErrorCode::CapabilityNotFound,
            ExecutionError::InvalidVersionRange(_) => ErrorCode::InvalidVersionRange,
            ExecutionError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            ExecutionError::OutputValidationFailed(_) => ErrorCode::OutputValidationFailed,
            ExecutionError::ExecutionTimeout { .. } => ErrorCode::ExecutionTimeout,
            ExecutionError::CircuitOpen(_) => ErrorCode::CircuitOpen,
            ExecutionError::CapabilityFailed(_) => ErrorCode::CapabilityFailed,
            ExecutionError::CapabilityPanicked(_) => ErrorCode::CapabilityPanicked,
            ExecutionError::SnapshotFailed(_) => ErrorCode::SnapshotFailed,
            ExecutionError::DependencyMissing { .. } => ErrorCode::DependencyMissing,
            ExecutionError::RateLimited(_) => ErrorCode::RateLimited,
            ExecutionError::ApprovalRejected { .. } => ErrorCode::ApprovalRejected,
            ExecutionError::ApprovalTimeout { .. } => ErrorCode::ApprovalTimeout,
            ExecutionError::DuplicateRequest(_) => ErrorCode::DuplicateRequest,
        }
    }

    /// Flatten into the serializable boundary form.
    pub fn to_failure(&self) -> ExecutionFailure {
        ExecutionFailure {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// What callers see when an execution fails.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ExecutionFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl From<ExecutionError> for ExecutionFailure {
    fn from(err: ExecutionError) -> Self {
        err.to_failure()
    }
}
