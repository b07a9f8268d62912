//! # Capability Registry
//!
//! Versioned, immutable capability specs bound to their implementations.
//!
//! ## Resolution Flow
//!
//! 1. A caller asks for `ai.call` with range `^1.2.0` (or no range)
//! 2. `CapabilityRegistry::get` picks the highest matching active version
//! 3. `CapabilityRegistry::validate_dependencies` checks the declared
//!    dependency ranges against what is registered
//! 4. The returned [`Registration`] carries both the spec and the
//!    `Arc<dyn Capability>` the executor invokes

pub mod capability_registry;
pub mod error;
pub mod semver;
pub mod spec;

pub use capability_registry::{
    CapabilityRegistry, CapabilitySummary, CleanupOptions, DependencyReport, MissingDependency,
    MissingReason, Registration, SatisfiedDependency, VersionInfo,
};
pub use error::RegistryError;
pub use semver::{Comparator, Version, VersionError, VersionRange};
pub use spec::{
    CapabilitySpec, CapabilityStatus, ChangelogEntry, DependencySpec, DeprecationInfo, IoSchema,
    RiskLevel,
};
