//! # Execution Coordinator
//!
//! The façade every front-end calls. One request moves through
//!
//! ```text
//! resolving → dependency_check → rate_limit → approval? → executing → recording → done
//! ```
//!
//! A failure at any stage skips straight to `recording`. Every request ends
//! as an [`ExecutionResult`] and a ledger record; nothing is returned as an
//! `Err` or propagated as a panic.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::approval::{ApprovalDecision, PendingApproval};
use crate::capabilities::ExecutionContext;
use crate::context::EngineContext;
use crate::events::EventPayload;
use crate::executor::{
    ExecutionError, ExecutionFailure, ExecutionMode, ExecutionOutcome, SandboxedExecutor,
};
use crate::ledger::{ExecutionRecord, ExportFormat, LedgerError, LedgerStats, RoiReport, SkillMetrics};
use crate::registry::{
    CapabilitySummary, DependencyReport, MissingReason, Registration, Version, VersionInfo,
    VersionRange,
};
use crate::resilience::{Alert, ResilienceStats};

/// Ledger tag added to records whose output came from a fallback path.
pub const DEGRADED_TAG: &str = "degraded";

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_actor() -> String {
    "system".to_string()
}

/// A request to run one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default = "new_request_id")]
    pub id: String,
    #[serde(alias = "capability")]
    pub capability_name: String,
    /// Version range; latest active when absent.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "default_actor")]
    pub requesting_actor: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Demand approval regardless of the capability's risk level.
    #[serde(default)]
    pub requires_approval: bool,
    /// Overrides the configured approval timeout.
    #[serde(default)]
    pub approval_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(capability_name: impl Into<String>, input: Value) -> Self {
        Self {
            id: new_request_id(),
            capability_name: capability_name.into(),
            version: None,
            input,
            requesting_actor: default_actor(),
            timestamp: Utc::now(),
            mode: ExecutionMode::default(),
            requires_approval: false,
            approval_timeout_ms: None,
            tags: Vec::new(),
        }
    }

    /// Builder: pin a version range.
    pub fn with_version(mut self, range: impl Into<String>) -> Self {
        self.version = Some(range.into());
        self
    }

    /// Builder: set the staging mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder: set the requesting actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.requesting_actor = actor.into();
        self
    }

    /// Builder: demand approval.
    pub fn with_requires_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    /// Builder: override the approval timeout.
    pub fn with_approval_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.approval_timeout_ms = Some(timeout_ms);
        self
    }

    /// Builder: add a ledger tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Request lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Resolving,
    DependencyCheck,
    RateLimit,
    Approval,
    Executing,
    Recording,
    Done,
}

/// What the coordinator returns for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub capability: String,
    /// Resolved version, when resolution succeeded.
    pub version: Option<Version>,
    pub mode: ExecutionMode,
    pub success: bool,
    /// `done` on success, otherwise the stage that failed.
    pub stage: ExecutionStage,
    /// `None` when no approval was needed.
    pub approved: Option<bool>,
    pub executed: bool,
    /// The capability's `data`, when it produced any.
    pub output: Option<Value>,
    pub outcome: Option<ExecutionOutcome>,
    pub dependencies: Option<DependencyReport>,
    pub error: Option<ExecutionFailure>,
    pub record_id: String,
    pub duration_ms: u64,
}

/// Counters kept by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
}

/// Combined engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub version: String,
    pub executions: CoordinatorStats,
    pub capabilities: usize,
    pub registered_versions: usize,
    pub pending_approvals: usize,
    pub events_emitted: u64,
    pub ledger: LedgerStats,
    pub resilience: ResilienceStats,
}

/// Mutable per-request progress, filled in as stages complete.
#[derive(Default)]
struct Progress {
    registration: Option<Registration>,
    dependencies: Option<DependencyReport>,
    approved: Option<bool>,
}

struct StageFailure {
    stage: ExecutionStage,
    error: ExecutionError,
}

impl StageFailure {
    fn at(stage: ExecutionStage) -> impl FnOnce(ExecutionError) -> Self {
        move |error| Self { stage, error }
    }
}

/// Decrements the in-flight counter even if the request future is dropped.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ExecutionCoordinator {
    engine: Arc<EngineContext>,
    executor: SandboxedExecutor,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

impl ExecutionCoordinator {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        let executor =
            SandboxedExecutor::new(engine.resilience.clone(), engine.config.executor.clone());
        Self {
            engine,
            executor,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a request through every stage. Always returns a result.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let _in_flight = InFlight::enter(&self.in_flight);
        self.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let started_at = Utc::now();

        log::debug!(
            "[Coordinator] {} -> {} ({})",
            request.id,
            request.capability_name,
            request.mode
        );

        let mut progress = Progress::default();
        let driven = self.drive(&request, &mut progress).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.record(request, progress, driven, started_at, duration_ms)
    }

    /// Latest active version, production mode, approval only when the
    /// capability itself demands it. Returns the output data.
    pub async fn run(&self, name: &str, input: Value) -> Result<Value, ExecutionFailure> {
        let result = self.execute(ExecutionRequest::new(name, input)).await;
        match result.error {
            None if result.success => Ok(result.output.unwrap_or(Value::Null)),
            Some(error) => Err(error),
            None => Err(ExecutionFailure {
                code: crate::executor::ErrorCode::CapabilityFailed,
                message: "execution failed without an error".to_string(),
            }),
        }
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        progress: &mut Progress,
    ) -> Result<ExecutionOutcome, StageFailure> {
        let engine = &self.engine;

        // Resolving
        let range = request
            .version
            .as_deref()
            .map(VersionRange::from_str)
            .transpose()
            .map_err(|e| StageFailure::at(ExecutionStage::Resolving)(e.into()))?;
        let registration = engine
            .registry
            .get(&request.capability_name, range.as_ref())
            .ok_or_else(|| StageFailure {
                stage: ExecutionStage::Resolving,
                error: ExecutionError::CapabilityNotFound {
                    name: request.capability_name.clone(),
                    range: request.version.clone(),
                },
            })?;
        let spec = registration.spec.clone();
        let capability = registration.capability.clone();
        progress.registration = Some(registration);

        engine.events.emit(EventPayload::ExecutionStart {
            request_id: request.id.clone(),
            capability: spec.name.clone(),
            version: spec.version,
            mode: request.mode,
        });

        // Dependency check
        if engine.config.executor.enforce_dependencies && !spec.dependencies.is_empty() {
            let report = engine
                .registry
                .validate_dependencies(&spec.name, &spec.version)
                .map_err(|e| StageFailure {
                    stage: ExecutionStage::DependencyCheck,
                    error: ExecutionError::DependencyMissing {
                        capability: spec.id(),
                        missing: vec![e.to_string()],
                    },
                })?;
            let valid = report.valid;
            let missing = report
                .missing
                .iter()
                .map(|m| match &m.reason {
                    MissingReason::NotRegistered => {
                        format!("{} {} (not registered)", m.name, m.version_range)
                    }
                    MissingReason::VersionMismatch { available } => format!(
                        "{} {} (available: {})",
                        m.name,
                        m.version_range,
                        available
                            .iter()
                            .map(Version::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                })
                .collect();
            progress.dependencies = Some(report);
            if !valid {
                return Err(StageFailure {
                    stage: ExecutionStage::DependencyCheck,
                    error: ExecutionError::DependencyMissing {
                        capability: spec.id(),
                        missing,
                    },
                });
            }
        }

        // Rate limit
        if request.mode.invokes() {
            engine
                .resilience
                .rate_limiter
                .check(&spec.name)
                .map_err(|e| StageFailure::at(ExecutionStage::RateLimit)(e.into()))?;
        }

        // Approval
        if engine
            .approvals
            .requires_approval(&spec, request.requires_approval, request.mode)
        {
            let ticket = engine.approvals.submit(
                request.id.clone(),
                &spec,
                request.mode,
                request.requesting_actor.clone(),
                request.input.clone(),
                request.approval_timeout_ms.map(Duration::from_millis),
            )
            .map_err(|e| StageFailure::at(ExecutionStage::Approval)(e.into()))?;
            let timeout_ms = request
                .approval_timeout_ms
                .unwrap_or(engine.config.approval.timeout_ms);
            let decision = ticket.wait().await;
            progress.approved = Some(decision.is_approved());
            match decision {
                ApprovalDecision::Approved => {}
                ApprovalDecision::Rejected { reason } => {
                    return Err(StageFailure {
                        stage: ExecutionStage::Approval,
                        error: ExecutionError::ApprovalRejected { reason },
                    })
                }
                ApprovalDecision::TimedOut => {
                    return Err(StageFailure {
                        stage: ExecutionStage::Approval,
                        error: ExecutionError::ApprovalTimeout { timeout_ms },
                    })
                }
            }
        }

        // Executing
        let ctx = ExecutionContext::new(request.id.clone(), request.mode)
            .with_triggered_by(request.requesting_actor.clone())
            .with_fallback(engine.config.fallback);
        Ok(self
            .executor
            .execute(capability, &spec, &request.input, &ctx)
            .await)
    }

    fn record(
        &self,
        request: ExecutionRequest,
        progress: Progress,
        driven: Result<ExecutionOutcome, StageFailure>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> ExecutionResult {
        let version = progress.registration.as_ref().map(|r| r.spec.version);
        let (outcome, stage, error) = match driven {
            Ok(outcome) => {
                let error = outcome.error.clone();
                let stage = if outcome.success {
                    ExecutionStage::Done
                } else {
                    ExecutionStage::Executing
                };
                (Some(outcome), stage, error)
            }
            Err(failure) => (None, failure.stage, Some(failure.error.to_failure())),
        };
        let success = error.is_none() && outcome.as_ref().is_some_and(|o| o.success);
        let capability_output = outcome.as_ref().and_then(|o| o.output.as_ref());

        let mut tags = request.tags.clone();
        if capability_output.is_some_and(|o| o.degraded) {
            tags.push(DEGRADED_TAG.to_string());
        }

        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            capability_name: request.capability_name.clone(),
            capability_version: version,
            started_at,
            completed_at: Utc::now(),
            duration_ms,
            success,
            error: error.as_ref().map(|e| e.message.clone()),
            error_code: error.as_ref().map(|e| e.code),
            approved: progress.approved,
            mode: request.mode,
            cost: capability_output.and_then(|o| o.cost.clone()),
            triggered_by: request.requesting_actor.clone(),
            tags,
        };
        let record_id = record.id.clone();
        self.engine.ledger.record(record);
        self.engine.resilience.metrics.record(
            &format!("{}.duration_ms", request.capability_name),
            duration_ms as f64,
        );

        let executed = outcome.as_ref().is_some_and(|o| o.executed);
        match &error {
            None => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "[Coordinator] {} {} completed in {}ms",
                    request.id,
                    request.capability_name,
                    duration_ms
                );
                self.engine.events.emit(EventPayload::ExecutionComplete {
                    request_id: request.id.clone(),
                    capability: request.capability_name.clone(),
                    duration_ms,
                    executed,
                });
            }
            Some(failure) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[Coordinator] {} {} failed at {:?}: {}",
                    request.id,
                    request.capability_name,
                    stage,
                    failure
                );
                self.engine.events.emit(EventPayload::ExecutionError {
                    request_id: request.id.clone(),
                    capability: request.capability_name.clone(),
                    code: failure.code,
                    message: failure.message.clone(),
                });
            }
        }

        ExecutionResult {
            output: capability_output.and_then(|o| o.data.clone()),
            request_id: request.id,
            capability: request.capability_name,
            version,
            mode: request.mode,
            success,
            stage,
            approved: progress.approved,
            executed,
            outcome,
            dependencies: progress.dependencies,
            error,
            record_id,
            duration_ms,
        }
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    pub fn approve(&self, request_id: &str) -> bool {
        self.engine.approvals.approve(request_id)
    }

    pub fn reject(&self, request_id: &str, reason: Option<&str>) -> bool {
        self.engine
            .approvals
            .reject(request_id, reason.unwrap_or("rejected by approver"))
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.engine.approvals.cancel(request_id)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.engine.approvals.pending()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn list_capabilities(&self) -> Vec<CapabilitySummary> {
        self.engine.registry.list_capabilities()
    }

    pub fn list_versions(&self, name: &str) -> Vec<VersionInfo> {
        self.engine.registry.list_versions(name)
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            version: crate::VERSION.to_string(),
            executions: self.stats(),
            capabilities: self.engine.registry.capability_count(),
            registered_versions: self.engine.registry.len(),
            pending_approvals: self.engine.approvals.pending_count(),
            events_emitted: self.engine.events.emitted(),
            ledger: self.engine.ledger.stats(),
            resilience: self.engine.resilience.stats(),
        }
    }

    pub fn get_skill_metrics(&self, name: &str, days: u32) -> SkillMetrics {
        self.engine.ledger.summary(name, days)
    }

    pub fn calculate_roi(&self, name: &str, hours_saved: f64, hourly_rate: f64) -> RoiReport {
        self.engine.ledger.calculate_roi(name, hours_saved, hourly_rate)
    }

    /// Latest threshold alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.engine.resilience.alerts.recent(limit)
    }

    pub fn export_metrics(&self, format: ExportFormat) -> Result<String, LedgerError> {
        self.engine.ledger.export(format)
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityOutput, EchoCapability, FnCapability};
    use crate::config::{EngineConfig, FallbackPolicy};
    use crate::events::EventTopic;
    use crate::executor::ErrorCode;
    use crate::ledger::CostInfo;
    use crate::registry::{CapabilitySpec, RiskLevel};
    use crate::resilience::AlertKind;
    use serde_json::json;

    fn coordinator_with(config: EngineConfig) -> ExecutionCoordinator {
        let engine = Arc::new(EngineContext::new(config).unwrap());
        engine
            .registry
            .register(EchoCapability::spec(), Arc::new(EchoCapability))
            .unwrap();
        ExecutionCoordinator::new(engine)
    }

    fn coordinator() -> ExecutionCoordinator {
        coordinator_with(EngineConfig::default())
    }

    fn register_fn(
        coordinator: &ExecutionCoordinator,
        spec: CapabilitySpec,
        output: CapabilityOutput,
    ) {
        let name = spec.name.clone();
        coordinator
            .engine()
            .registry
            .register(
                spec,
                Arc::new(FnCapability::new(name, move |_input, _ctx| {
                    let output = output.clone();
                    Box::pin(async move { output })
                })),
            )
            .unwrap();
    }

    impl ExecutionCoordinator {
        async fn run_request(&self, name: &str) -> ExecutionResult {
            self.execute(ExecutionRequest::new(name, json!({}))).await
        }
    }

    #[tokio::test]
    async fn test_run_echo() {
        let coordinator = coordinator();
        let output = coordinator
            .run(EchoCapability::NAME, json!({ "hello": "world" }))
            .await
            .unwrap();
        assert_eq!(output["echo"]["hello"], "world");

        let records = coordinator.engine().ledger.records(Some(EchoCapability::NAME));
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].capability_version, Some(Version::new(1, 0, 0)));
        assert_eq!(coordinator.stats().succeeded, 1);
        assert_eq!(coordinator.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_unknown_capability_is_recorded() {
        let coordinator = coordinator();
        let mut errors = coordinator.engine().events.subscribe(EventTopic::ExecutionError);

        let result = coordinator
            .execute(ExecutionRequest::new("nope.missing", json!({})))
            .await;
        assert!(!result.success);
        assert_eq!(result.stage, ExecutionStage::Resolving);
        assert_eq!(result.error.unwrap().code, ErrorCode::CapabilityNotFound);

        let records = coordinator.engine().ledger.records(None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capability_version, None);
        assert_eq!(records[0].error_code, Some(ErrorCode::CapabilityNotFound));
        assert!(errors.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_bad_version_range() {
        let coordinator = coordinator();
        let result = coordinator
            .execute(ExecutionRequest::new(EchoCapability::NAME, json!({})).with_version("^one"))
            .await;
        assert_eq!(result.error.unwrap().code, ErrorCode::InvalidVersionRange);
    }

    #[tokio::test]
    async fn test_missing_dependency_blocks_execution() {
        let coordinator = coordinator();
        register_fn(
            &coordinator,
            CapabilitySpec::new("report.build", Version::new(1, 0, 0))
                .with_dependency("ai.call", "^1.0.0".parse().unwrap()),
            CapabilityOutput::ok(json!({})),
        );

        let result = coordinator.run_request("report.build").await;
        assert_eq!(result.stage, ExecutionStage::DependencyCheck);
        assert!(!result.executed);
        assert_eq!(result.error.unwrap().code, ErrorCode::DependencyMissing);
        assert!(!result.dependencies.unwrap().valid);

        register_fn(
            &coordinator,
            CapabilitySpec::new("ai.call", Version::new(1, 2, 0)),
            CapabilityOutput::ok(json!({})),
        );
        let result = coordinator.run_request("report.build").await;
        assert!(result.success);
        assert!(result.dependencies.unwrap().valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_capability_times_out_once() {
        let coordinator = coordinator();
        register_fn(
            &coordinator,
            CapabilitySpec::new("shell.exec", Version::new(1, 0, 0))
                .with_risk_level(RiskLevel::Critical),
            CapabilityOutput::ok(json!({})),
        );
        let events = coordinator.engine().events.clone();
        let mut timeouts = events.subscribe(EventTopic::ApprovalTimeout);
        let mut required = events.subscribe(EventTopic::ApprovalRequired);

        let result = coordinator
            .execute(
                ExecutionRequest::new("shell.exec", json!({ "cmd": "rm -rf /tmp/x" }))
                    .with_approval_timeout_ms(100),
            )
            .await;

        assert!(!result.success);
        assert!(!result.executed);
        assert_eq!(result.approved, Some(false));
        assert_eq!(result.stage, ExecutionStage::Approval);
        assert_eq!(result.error.unwrap().code, ErrorCode::ApprovalTimeout);
        assert!(required.try_recv().is_ok());
        assert!(timeouts.try_recv().is_ok());
        assert!(timeouts.try_recv().is_err());
        assert!(coordinator.pending_approvals().is_empty());
        assert!(!coordinator.approve(&result.request_id));
    }

    #[tokio::test]
    async fn test_approval_then_execution() {
        let coordinator = Arc::new(coordinator());
        register_fn(
            &coordinator,
            CapabilitySpec::new("msg.send", Version::new(1, 0, 0))
                .with_risk_level(RiskLevel::High),
            CapabilityOutput::ok(json!({ "sent": true })),
        );
        let mut required = coordinator
            .engine()
            .events
            .subscribe(EventTopic::ApprovalRequired);

        let approver = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let event = required.recv().await.unwrap();
                match event.payload {
                    EventPayload::ApprovalRequired { request_id, .. } => {
                        coordinator.approve(&request_id)
                    }
                    _ => false,
                }
            })
        };

        let result = coordinator
            .execute(ExecutionRequest::new("msg.send", json!({})))
            .await;
        assert!(approver.await.unwrap());
        assert!(result.success);
        assert_eq!(result.approved, Some(true));
        assert_eq!(result.output.unwrap()["sent"], true);

        let record = &coordinator.engine().ledger.records(Some("msg.send"))[0];
        assert_eq!(record.approved, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_approval_timeout_still_waits() {
        let coordinator = Arc::new(coordinator());
        register_fn(
            &coordinator,
            CapabilitySpec::new("shell.exec", Version::new(1, 0, 0))
                .with_risk_level(RiskLevel::Critical),
            CapabilityOutput::ok(json!({})),
        );
        let mut required = coordinator
            .engine()
            .events
            .subscribe(EventTopic::ApprovalRequired);

        let approver = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let event = required.recv().await.unwrap();
                match event.payload {
                    EventPayload::ApprovalRequired { request_id, .. } => {
                        coordinator.approve(&request_id)
                    }
                    _ => false,
                }
            })
        };

        let result = coordinator
            .execute(
                ExecutionRequest::new("shell.exec", json!({}))
                    .with_approval_timeout_ms(10u64.pow(16)),
            )
            .await;
        assert!(approver.await.unwrap());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.approved, Some(true));
    }

    #[tokio::test]
    async fn test_duplicate_request_id_conflicts() {
        let coordinator = Arc::new(coordinator());
        register_fn(
            &coordinator,
            CapabilitySpec::new("msg.send", Version::new(1, 0, 0))
                .with_risk_level(RiskLevel::High),
            CapabilityOutput::ok(json!({ "sent": true })),
        );
        let mut required = coordinator
            .engine()
            .events
            .subscribe(EventTopic::ApprovalRequired);

        let request = || {
            let mut request = ExecutionRequest::new("msg.send", json!({}));
            request.id = "same-id".to_string();
            request
        };

        let first = {
            let coordinator = coordinator.clone();
            let request = request();
            tokio::spawn(async move { coordinator.execute(request).await })
        };
        required.recv().await.unwrap();

        let second = coordinator.execute(request()).await;
        assert!(!second.executed);
        assert_eq!(second.stage, ExecutionStage::Approval);
        assert_eq!(second.error.unwrap().code, ErrorCode::DuplicateRequest);
        assert_eq!(coordinator.pending_approvals().len(), 1);
        assert!(required.try_recv().is_err());

        assert!(coordinator.approve("same-id"));
        let first = first.await.unwrap();
        assert!(first.success, "{:?}", first.error);
        assert!(coordinator.pending_approvals().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_approval() {
        let coordinator = coordinator();
        register_fn(
            &coordinator,
            CapabilitySpec::new("shell.exec", Version::new(1, 0, 0))
                .with_risk_level(RiskLevel::Critical),
            CapabilityOutput::ok(json!({})),
        );
        let result = coordinator
            .execute(ExecutionRequest::new("shell.exec", json!({})).with_mode(ExecutionMode::DryRun))
            .await;
        assert!(result.success);
        assert!(!result.executed);
        assert_eq!(result.approved, None);
        assert_eq!(
            result.outcome.unwrap().preview.unwrap().summary,
            vec!["would execute shell.exec"]
        );
    }

    #[tokio::test]
    async fn test_degraded_and_cost_reach_ledger() {
        let mut config = EngineConfig::default();
        config.fallback = FallbackPolicy::MockData;
        let coordinator = coordinator_with(config);
        register_fn(
            &coordinator,
            CapabilitySpec::new("ai.call", Version::new(1, 0, 0)),
            CapabilityOutput::ok(json!({ "text": "mock" }))
                .degraded()
                .with_cost(CostInfo::new(0.0, 0.25)),
        );

        let result = coordinator
            .execute(ExecutionRequest::new("ai.call", json!({})).with_tag("nightly"))
            .await;
        assert!(result.success);

        let record = &coordinator.engine().ledger.records(Some("ai.call"))[0];
        assert_eq!(record.tags, vec!["nightly", DEGRADED_TAG]);
        assert_eq!(record.cost.as_ref().unwrap().estimated_currency, 0.25);
        assert_eq!(coordinator.calculate_roi("ai.call", 1.0, 10.0).total_cost, 0.25);
    }

    #[tokio::test]
    async fn test_repeated_failures_raise_alert() {
        let mut config = EngineConfig::default();
        config.alerts.window = 2;
        config.alerts.min_samples = 2;
        let coordinator = coordinator_with(config);
        register_fn(
            &coordinator,
            CapabilitySpec::new("files.read", Version::new(1, 0, 0)),
            CapabilityOutput::fail("disk unavailable"),
        );
        coordinator.engine().resilience.alerts.start();
        let mut alerts = coordinator.engine().events.subscribe(EventTopic::AlertRaised);

        for _ in 0..2 {
            assert!(!coordinator.run_request("files.read").await.success);
        }

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::AlertRaised { .. }));
        let recent = coordinator.recent_alerts(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].capability, "files.read");
        assert_eq!(recent[0].kind, AlertKind::FailureRate);
        assert_eq!(coordinator.get_stats().resilience.alerts.raised, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_stage() {
        let mut config = EngineConfig::default();
        config.rate_limiter.per_key_burst_size = 1;
        config.rate_limiter.per_key_requests_per_second = 0.001;
        let coordinator = coordinator_with(config);

        assert!(coordinator.run(EchoCapability::NAME, json!({})).await.is_ok());
        let result = coordinator.run_request(EchoCapability::NAME).await;
        assert_eq!(result.stage, ExecutionStage::RateLimit);
        assert_eq!(result.error.unwrap().code, ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn test_stats_and_export() {
        let coordinator = coordinator();
        coordinator
            .run(EchoCapability::NAME, json!({ "n": 1 }))
            .await
            .unwrap();
        coordinator.run_request("ghost").await;

        let stats = coordinator.get_stats();
        assert_eq!(stats.executions.total, 2);
        assert_eq!(stats.executions.failed, 1);
        assert_eq!(stats.capabilities, 1);
        assert_eq!(stats.ledger.retained, 2);

        let metrics = coordinator.get_skill_metrics(EchoCapability::NAME, 1);
        assert_eq!(metrics.total_executions, 1);
        assert!(coordinator
            .engine()
            .resilience
            .metrics
            .latest("system.echo.duration_ms")
            .is_some());

        let csv = coordinator.export_metrics(ExportFormat::Csv).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }
}
