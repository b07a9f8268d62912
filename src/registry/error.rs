//! Registry errors.

use thiserror::Error;

use super::semver::{Version, VersionError};

/// Errors raised synchronously by registry writes and spec loading.
///
/// A failed registration never partially applies.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// `(name, version)` is already registered.
    #[error("Capability {name}@{version} is already registered")]
    DuplicateVersion { name: String, version: Version },

    /// Registering the spec would close a dependency cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// The spec is malformed or does not match its implementation.
    #[error("Invalid capability spec: {0}")]
    InvalidSpec(String),

    /// No such capability (or version).
    #[error("Capability not found: {name}{}", .version.map(|v| format!("@{}", v)).unwrap_or_default())]
    NotFound {
        name: String,
        version: Option<Version>,
    },

    /// A version or range string failed to parse.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// YAML parsing failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
