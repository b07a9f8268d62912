//! # Approval Gate
//!
//! Suspends risky requests until an external approver decides.
//!
//! A submitted request becomes a pending entry plus an [`ApprovalTicket`]
//! held by the waiting caller. The entry leaves the pending map exactly once,
//! under one lock, by whichever of these happens first:
//!
//! - `approve` / `reject` / `cancel` from an approver
//! - the ticket's deadline passing while it waits
//! - the ticket being dropped before resolution
//!
//! Only the path that removes the entry emits an event, so each request
//! produces at most one of `approval:approved`, `approval:rejected` or
//! `approval:timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::ApprovalConfig;
use crate::events::{EventBus, EventPayload};
use crate::executor::ExecutionMode;
use crate::registry::{CapabilitySpec, RiskLevel, Version};

/// Longest wait honoured for one approval. Larger timeouts are clamped.
pub const MAX_APPROVAL_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A request id that already has an approval outstanding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Request '{request_id}' already awaits approval")]
pub struct DuplicateApproval {
    pub request_id: String,
}

/// How a pending approval was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
    TimedOut,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

/// What an approver sees about a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request_id: String,
    pub capability: String,
    pub version: Version,
    pub risk_level: RiskLevel,
    pub mode: ExecutionMode,
    pub requested_by: String,
    pub input: Value,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct PendingEntry {
    /// Identifies the ticket that owns this entry.
    ticket: u64,
    info: PendingApproval,
    resolve: oneshot::Sender<ApprovalDecision>,
}

pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingEntry>>,
    next_ticket: AtomicU64,
    config: ApprovalConfig,
    events: Arc<EventBus>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig, events: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            config,
            events,
        }
    }

    /// Whether a request for `spec` in `mode` must wait for approval.
    ///
    /// Only committing modes are gated. Within those, the caller's flag, the
    /// spec's own flag, or a risk level at or above the configured minimum
    /// each suffice.
    pub fn requires_approval(
        &self,
        spec: &CapabilitySpec,
        caller_flag: bool,
        mode: ExecutionMode,
    ) -> bool {
        mode.invokes()
            && (caller_flag || spec.requires_approval || spec.risk_level >= self.config.min_risk_level)
    }

    /// Default wait before a pending approval resolves as timed out.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Register a pending approval and emit `approval:required`.
    ///
    /// Fails without side effects if `request_id` is already pending.
    pub fn submit(
        &self,
        request_id: impl Into<String>,
        spec: &CapabilitySpec,
        mode: ExecutionMode,
        requested_by: impl Into<String>,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<ApprovalTicket<'_>, DuplicateApproval> {
        let request_id = request_id.into();
        let requested_by = requested_by.into();
        let requested = timeout.unwrap_or_else(|| self.default_timeout());
        let timeout = requested.min(MAX_APPROVAL_WAIT);
        if timeout < requested {
            log::warn!(
                "[ApprovalGate] {} timeout of {}ms clamped to {}ms",
                request_id,
                requested.as_millis(),
                timeout.as_millis()
            );
        }
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|span| now.checked_add_signed(span))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        let info = PendingApproval {
            request_id: request_id.clone(),
            capability: spec.name.clone(),
            version: spec.version,
            risk_level: spec.risk_level,
            mode,
            requested_by: requested_by.clone(),
            input,
            submitted_at: now,
            expires_at,
        };
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                log::warn!("[ApprovalGate] {} already awaits approval", request_id);
                return Err(DuplicateApproval { request_id });
            }
            pending.insert(
                request_id.clone(),
                PendingEntry {
                    ticket,
                    info,
                    resolve: tx,
                },
            );
        }

        log::info!(
            "[ApprovalGate] {} for {} awaits approval ({}ms)",
            request_id,
            spec.id(),
            timeout.as_millis()
        );
        self.events.emit(EventPayload::ApprovalRequired {
            request_id: request_id.clone(),
            capability: spec.name.clone(),
            risk_level: spec.risk_level,
            requested_by,
            timeout_ms: timeout.as_millis() as u64,
        });

        Ok(ApprovalTicket {
            gate: self,
            request_id,
            ticket,
            timeout,
            deadline: Instant::now() + timeout,
            receiver: rx,
            settled: false,
        })
    }

    /// Approve a pending request. False if unknown or already resolved.
    pub fn approve(&self, request_id: &str) -> bool {
        if !self.resolve(request_id, ApprovalDecision::Approved) {
            return false;
        }
        log::info!("[ApprovalGate] {} approved", request_id);
        self.events.emit(EventPayload::ApprovalApproved {
            request_id: request_id.to_string(),
        });
        true
    }

    /// Reject a pending request. False if unknown or already resolved.
    pub fn reject(&self, request_id: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let decision = ApprovalDecision::Rejected {
            reason: reason.clone(),
        };
        if !self.resolve(request_id, decision) {
            return false;
        }
        log::info!("[ApprovalGate] {} rejected: {}", request_id, reason);
        self.events.emit(EventPayload::ApprovalRejected {
            request_id: request_id.to_string(),
            reason,
        });
        true
    }

    /// Withdraw a pending request. Resolves as rejected with reason `cancelled`.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.reject(request_id, "cancelled")
    }

    /// Remove the entry for `request_id` if `ticket` still owns it.
    fn withdraw(&self, request_id: &str, ticket: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(request_id) {
            Some(entry) if entry.ticket == ticket => pending.remove(request_id).is_some(),
            _ => false,
        }
    }

    fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().remove(request_id);
        match entry {
            Some(entry) => {
                // A waiter that is mid-drop no longer needs the decision.
                let _ = entry.resolve.send(decision);
                true
            }
            None => false,
        }
    }

    /// Outstanding approvals, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        pending.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// The waiting side of one pending approval.
pub struct ApprovalTicket<'a> {
    gate: &'a ApprovalGate,
    request_id: String,
    ticket: u64,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<ApprovalDecision>,
    settled: bool,
}

impl ApprovalTicket<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for a decision or the deadline, whichever comes first.
    pub async fn wait(mut self) -> ApprovalDecision {
        let decision = match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ApprovalDecision::Rejected {
                reason: "approval channel closed".to_string(),
            },
            Err(_) => {
                let removed = self.gate.withdraw(&self.request_id, self.ticket);
                if removed {
                    log::warn!(
                        "[ApprovalGate] {} timed out after {}ms",
                        self.request_id,
                        self.timeout.as_millis()
                    );
                    self.gate.events.emit(EventPayload::ApprovalTimeout {
                        request_id: self.request_id.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                    ApprovalDecision::TimedOut
                } else {
                    // An approver removed the entry first; its decision is in flight.
                    self.receiver
                        .try_recv()
                        .unwrap_or(ApprovalDecision::Rejected {
                            reason: "approval channel closed".to_string(),
                        })
                }
            }
        };
        self.settled = true;
        decision
    }
}

impl Drop for ApprovalTicket<'_> {
    fn drop(&mut self) {
        if !self.settled && self.gate.withdraw(&self.request_id, self.ticket) {
            log::debug!(
                "[ApprovalGate] {} abandoned before resolution",
                self.request_id
            );
        }
    }
}
