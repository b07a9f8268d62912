//! # Sandboxed Executor
//!
//! Runs one resolved capability in one of five staging modes.
//!
//! | Mode         | Invokes `execute` | What it returns                                 |
//! |--------------|-------------------|-------------------------------------------------|
//! | `dry_run`    | no                | planned effects ("would delete ...")            |
//! | `preview`    | no                | planned effects plus input validation           |
//! | `validate`   | no                | input schema check only                         |
//! | `sandbox`    | yes               | output, after snapshot; rollback on bad output  |
//! | `production` | yes               | output                                          |
//!
//! Invocations go through the circuit breaker named by the spec's category,
//! race against the execution time limit, and have panics captured. A
//! `degraded` output is a failure unless the fallback policy allows mock
//! data. No
//! failure escapes [`SandboxedExecutor::execute`]; it is reported in the
//! returned [`ExecutionOutcome`].

pub mod error;
pub mod outcome;
pub mod schema;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::capabilities::{Capability, CapabilityOutput, ExecutionContext, Snapshot};
use crate::config::ExecutorConfig;
use crate::registry::CapabilitySpec;
use crate::resilience::{BreakerError, ResilienceLayer};

pub use error::{ErrorCode, ExecutionError, ExecutionFailure};
pub use outcome::{ExecutionOutcome, Preview, RollbackOutcome, SnapshotRef};

/// Staging mode, selected per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Preview,
    Sandbox,
    Validate,
    #[default]
    Production,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::Preview => "preview",
            ExecutionMode::Sandbox => "sandbox",
            ExecutionMode::Validate => "validate",
            ExecutionMode::Production => "production",
        }
    }

    /// Whether this mode performs the side-effecting call.
    pub fn invokes(&self) -> bool {
        matches!(self, ExecutionMode::Sandbox | ExecutionMode::Production)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed invocation, keeping the raw output when the capability produced one.
#[derive(Debug)]
struct InvocationFailure {
    error: ExecutionError,
    output: Option<CapabilityOutput>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct SandboxedExecutor {
    resilience: Arc<ResilienceLayer>,
    config: ExecutorConfig,
}

impl SandboxedExecutor {
    pub fn new(resilience: Arc<ResilienceLayer>, config: ExecutorConfig) -> Self {
        Self { resilience, config }
    }

    /// Time limit for `spec`: its own override, else the configured maximum.
    pub fn time_limit(&self, spec: &CapabilitySpec) -> Duration {
        Duration::from_millis(spec.timeout_ms.unwrap_or(self.config.max_execution_ms))
    }

    pub async fn execute(
        &self,
        capability: Arc<dyn Capability>,
        spec: &CapabilitySpec,
        input: &Value,
        ctx: &ExecutionContext,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let mut outcome = match ctx.mode {
            ExecutionMode::DryRun => self.dry_run(capability.as_ref(), input),
            ExecutionMode::Preview => self.preview(capability.as_ref(), spec, input).await,
            ExecutionMode::Validate => Self::validate(spec, input),
            ExecutionMode::Sandbox | ExecutionMode::Production => {
                self.invoke(capability, spec, input, ctx).await
            }
        };
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        match &outcome.error {
            Some(err) => log::warn!(
                "[Executor] {} ({}) failed: {}",
                spec.id(),
                ctx.mode,
                err
            ),
            None => log::debug!(
                "[Executor] {} ({}) ok in {}ms",
                spec.id(),
                ctx.mode,
                outcome.duration_ms
            ),
        }
        outcome
    }

    fn dry_run(&self, capability: &dyn Capability, input: &Value) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::new(ExecutionMode::DryRun);
        outcome.preview = Some(Preview::from_effects(capability.plan(input)));
        outcome.succeeded()
    }

    async fn preview(
        &self,
        capability: &dyn Capability,
        spec: &CapabilitySpec,
        input: &Value,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::new(ExecutionMode::Preview);
        let mut preview = Preview::from_effects(capability.plan(input));

        let mut problems = schema::validate_input(&spec.io_schema, input)
            .err()
            .unwrap_or_default();
        let accepted = AssertUnwindSafe(capability.validate(input))
            .catch_unwind()
            .await
            .unwrap_or(false);
        if !accepted {
            problems.push(format!("{} rejected the input", spec.name));
        }

        preview.valid = Some(problems.is_empty());
        preview.validation_errors = problems.clone();
        outcome.preview = Some(preview);

        if problems.is_empty() {
            outcome.succeeded()
        } else {
            outcome.failed(ExecutionError::ValidationFailed(problems.join("; ")))
        }
    }

    fn validate(spec: &CapabilitySpec, input: &Value) -> ExecutionOutcome {
        let outcome = ExecutionOutcome::new(ExecutionMode::Validate);
        match schema::validate_input(&spec.io_schema, input) {
            Ok(()) => outcome.succeeded(),
            Err(problems) => outcome.failed(ExecutionError::ValidationFailed(problems.join("; "))),
        }
    }

    async fn invoke(
        &self,
        capability: Arc<dyn Capability>,
        spec: &CapabilitySpec,
        input: &Value,
        ctx: &ExecutionContext,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::new(ctx.mode);

        if let Err(problems) = schema::validate_input(&spec.io_schema, input) {
            return outcome.failed(ExecutionError::ValidationFailed(problems.join("; ")));
        }

        let snapshot = if ctx.mode == ExecutionMode::Sandbox {
            match Self::take_snapshot(capability.as_ref(), input).await {
                Ok(snapshot) => snapshot,
                Err(err) => return outcome.failed(err),
            }
        } else {
            None
        };
        outcome.snapshot = snapshot.as_ref().map(SnapshotRef::from);

        let limit = self.time_limit(spec);
        let breaker = self.resilience.breaker(spec.breaker_key());
        let target = capability.as_ref();
        let call = breaker
            .execute(move || async move {
                let guarded = AssertUnwindSafe(target.execute(input, ctx)).catch_unwind();
                match tokio::time::timeout(limit, guarded).await {
                    Err(_) => Err(InvocationFailure {
                        error: ExecutionError::ExecutionTimeout {
                            timeout_ms: limit.as_millis() as u64,
                        },
                        output: None,
                    }),
                    Ok(Err(panic)) => Err(InvocationFailure {
                        error: ExecutionError::CapabilityPanicked(panic_message(panic.as_ref())),
                        output: None,
                    }),
                    Ok(Ok(output)) if !output.success => Err(InvocationFailure {
                        error: ExecutionError::CapabilityFailed(
                            output
                                .error
                                .clone()
                                .unwrap_or_else(|| "capability reported failure".to_string()),
                        ),
                        output: Some(output),
                    }),
                    Ok(Ok(output)) if output.degraded && !ctx.fallback.allows_mock() => {
                        Err(InvocationFailure {
                            error: ExecutionError::CapabilityFailed(
                                "degraded output while fallback is disabled".to_string(),
                            ),
                            output: Some(output),
                        })
                    }
                    Ok(Ok(output)) => Ok(output),
                }
            })
            .await;

        let output = match call {
            Ok(output) => output,
            Err(BreakerError::Open(err)) => return outcome.failed(ExecutionError::from(err)),
            Err(BreakerError::Inner(failure)) => {
                outcome.executed = true;
                if let Some(output) = &failure.output {
                    if let Err(problems) = schema::validate_output(&spec.io_schema, output) {
                        log::warn!(
                            "[Executor] {} failure output is malformed: {}",
                            spec.id(),
                            problems.join("; ")
                        );
                    }
                }
                outcome.output = failure.output;
                return outcome.failed(failure.error);
            }
        };

        outcome.executed = true;
        let validation = schema::validate_output(&spec.io_schema, &output);
        outcome.output = Some(output);

        match validation {
            Ok(()) => outcome.succeeded(),
            Err(problems) => {
                if let Some(snapshot) = &snapshot {
                    outcome.rollback = Some(Self::restore(capability.as_ref(), snapshot).await);
                }
                outcome.failed(ExecutionError::OutputValidationFailed(problems.join("; ")))
            }
        }
    }

    async fn take_snapshot(
        capability: &dyn Capability,
        input: &Value,
    ) -> Result<Option<Snapshot>, ExecutionError> {
        match AssertUnwindSafe(capability.snapshot(input)).catch_unwind().await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(err)) => Err(ExecutionError::SnapshotFailed(err.to_string())),
            Err(panic) => Err(ExecutionError::SnapshotFailed(panic_message(panic.as_ref()))),
        }
    }

    async fn restore(capability: &dyn Capability, snapshot: &Snapshot) -> RollbackOutcome {
        let result = match AssertUnwindSafe(capability.rollback(snapshot))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };
        match &result {
            Ok(()) => log::info!(
                "[Executor] Rolled back {} from snapshot {}",
                snapshot.resource,
                snapshot.id
            ),
            Err(err) => log::error!(
                "[Executor] Rollback of {} failed: {}",
                snapshot.resource,
                err
            ),
        }
        RollbackOutcome {
            snapshot_id: snapshot.id.clone(),
            success: result.is_ok(),
            error: result.err(),
        }
    }
}
