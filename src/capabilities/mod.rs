//! # Capabilities
//!
//! The implementation side of a capability. A [`CapabilitySpec`] describes a
//! capability; a type implementing [`Capability`] does the work.
//!
//! ## Contract
//!
//! - `execute` must never panic or leak an error past its boundary. Internal
//!   failures are reported as `CapabilityOutput { success: false, error }`.
//!   The executor still catches panics, but treats them as failures.
//! - `plan` describes the side effects `execute` would have, without
//!   performing them. Dry-run and preview modes rely on it.
//! - `snapshot` / `rollback` let sandbox mode undo a run whose output fails
//!   schema validation. Capabilities without mutable state keep the defaults.
//!
//! [`CapabilitySpec`]: crate::registry::CapabilitySpec

pub mod echo;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::FallbackPolicy;
use crate::executor::ExecutionMode;
use crate::ledger::CostInfo;

pub use echo::EchoCapability;

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// A pluggable unit of work.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    /// Must equal the `name` of the spec it is registered under.
    fn name(&self) -> &str;

    /// Capability-specific input validation, run in preview mode.
    async fn validate(&self, _input: &Value) -> bool {
        true
    }

    /// Perform the work.
    async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> CapabilityOutput;

    /// Side effects `execute` would perform for `input`.
    fn plan(&self, _input: &Value) -> Vec<PlannedEffect> {
        vec![PlannedEffect::new(
            EffectAction::Execute,
            self.name(),
        )]
    }

    /// Capture the state of the resource `execute` would mutate.
    async fn snapshot(&self, _input: &Value) -> anyhow::Result<Option<Snapshot>> {
        Ok(None)
    }

    /// Restore a previously captured snapshot.
    async fn rollback(&self, _snapshot: &Snapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Per-call context handed to [`Capability::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub request_id: String,
    pub mode: ExecutionMode,
    pub triggered_by: String,
    /// Whether the capability may return mock data when a credential or
    /// upstream is unavailable. Outputs produced that way must set `degraded`.
    pub fallback: FallbackPolicy,
}

impl ExecutionContext {
    pub fn new(request_id: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            request_id: request_id.into(),
            mode,
            triggered_by: "system".to_string(),
            fallback: FallbackPolicy::default(),
        }
    }

    /// Builder: set the triggering actor.
    pub fn with_triggered_by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = actor.into();
        self
    }

    /// Builder: set the fallback policy.
    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What a capability returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Units and money spent producing this output, if the capability meters itself.
    #[serde(default)]
    pub cost: Option<CostInfo>,
    /// Produced by a fallback path rather than the real integration.
    #[serde(default)]
    pub degraded: bool,
}

impl CapabilityOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Builder: attach cost information.
    pub fn with_cost(mut self, cost: CostInfo) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Builder: mark the output as produced in degraded mode.
    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Planned effects and snapshots
// ---------------------------------------------------------------------------

/// Kind of side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectAction {
    Create,
    Read,
    Update,
    Delete,
    Send,
    Execute,
}

impl EffectAction {
    pub fn verb(&self) -> &'static str {
        match self {
            EffectAction::Create => "create",
            EffectAction::Read => "read",
            EffectAction::Update => "update",
            EffectAction::Delete => "delete",
            EffectAction::Send => "send",
            EffectAction::Execute => "execute",
        }
    }
}

/// A side effect a capability would perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedEffect {
    pub action: EffectAction,
    pub target: String,
    #[serde(default)]
    pub details: Option<Value>,
}

impl PlannedEffect {
    pub fn new(action: EffectAction, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            details: None,
        }
    }

    /// Builder: attach structured details (e.g. a diff).
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Human-readable form, e.g. `would delete /tmp/report.txt`.
    pub fn describe(&self) -> String {
        format!("would {} {}", self.action.verb(), self.target)
    }
}

impl fmt::Display for PlannedEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Captured state of a mutable resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub resource: String,
    pub taken_at: DateTime<Utc>,
    pub state: Value,
}

impl Snapshot {
    pub fn new(resource: impl Into<String>, state: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            taken_at: Utc::now(),
            state,
        }
    }
}

// ---------------------------------------------------------------------------
// FnCapability
// ---------------------------------------------------------------------------

type ExecuteFn = dyn Fn(Value, ExecutionContext) -> BoxFuture<'static, CapabilityOutput> + Send + Sync;

/// A capability backed by a closure. Convenient for glue code and tests.
///
/// ```ignore
/// let cap = FnCapability::new("math.double", |input, _ctx| {
///     Box::pin(async move {
///         let n = input["n"].as_i64().unwrap_or(0);
///         CapabilityOutput::ok(serde_json::json!({ "result": n * 2 }))
///     })
/// });
/// ```
#[derive(Clone)]
pub struct FnCapability {
    name: String,
    func: Arc<ExecuteFn>,
}

impl FnCapability {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, ExecutionContext) -> BoxFuture<'static, CapabilityOutput>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FnCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCapability").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> CapabilityOutput {
        (self.func)(input.clone(), ctx.clone()).await
    }
}
