//! # capability-engine
//!
//! A versioned capability registry with a safe execution pipeline.
//!
//! Capabilities are registered under a semver-versioned [`CapabilitySpec`]
//! and executed through the [`ExecutionCoordinator`], which resolves a
//! version, checks dependencies, applies rate limits and human approval for
//! risky work, runs the capability behind a circuit breaker in one of five
//! staging modes, and records every attempt in the execution ledger.
//!
//! [`CapabilitySpec`]: registry::CapabilitySpec

pub mod approval;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod registry;
pub mod resilience;
pub mod server;

pub use capabilities::{Capability, CapabilityOutput, ExecutionContext};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use coordinator::{ExecutionCoordinator, ExecutionRequest, ExecutionResult};
pub use executor::{ExecutionMode, SandboxedExecutor};
pub use registry::{CapabilityRegistry, CapabilitySpec, Version, VersionRange};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
