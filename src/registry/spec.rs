//! Capability spec — the immutable, versioned descriptor of a capability.
//!
//! A spec declares:
//! - Identity (`name`, `version`) and lifecycle `status`
//! - Risk classification used by the approval gate
//! - Dependencies on other capabilities, as semver ranges
//! - The I/O schema used by the executor for input and output validation
//!
//! Specs can be built in code or loaded from YAML.

use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::RegistryError;
use super::semver::{Version, VersionRange};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_\-]*(\.[a-z0-9_\-]+)*$").expect("valid name regex"));

/// A capability spec.
///
/// Example YAML:
/// ```yaml
/// capability:
///   name: "file.delete"
///   version: "1.0.0"
///   description: "Delete a file from the workspace"
///   status: active
///   risk_level: high
///   category: "filesystem"
///   dependencies:
///     - name: "file.read"
///       version: "^1.0.0"
///   io_schema:
///     required_inputs: ["path"]
///     success_fields: ["deleted"]
///     failure_fields: ["error"]
///   tags: ["files"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Dotted identifier, e.g. `file.read` or `ai.call`.
    pub name: String,

    pub version: Version,

    #[serde(default)]
    pub description: String,

    /// Declared status; the registry tracks later lifecycle changes separately.
    #[serde(default)]
    pub status: CapabilityStatus,

    #[serde(default)]
    pub risk_level: RiskLevel,

    /// Free-form grouping tag. Also names the circuit breaker guarding the capability.
    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    #[serde(default)]
    pub io_schema: IoSchema,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub changelog: Vec<ChangelogEntry>,

    /// Always route through the approval gate, regardless of risk level.
    #[serde(default)]
    pub requires_approval: bool,

    /// Per-capability execution time limit, overriding the executor default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Lifecycle status of a capability version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    #[default]
    Active,
    Beta,
    Experimental,
    Deprecated,
    Disabled,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Active => "active",
            CapabilityStatus::Beta => "beta",
            CapabilityStatus::Experimental => "experimental",
            CapabilityStatus::Deprecated => "deprecated",
            CapabilityStatus::Disabled => "disabled",
        }
    }
}

/// Risk classification, ordered from `Low` to `Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// A dependency on another capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,

    /// Accepted versions, e.g. `^1.0.0`.
    #[serde(rename = "version", default)]
    pub version_range: VersionRange,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>, version_range: VersionRange) -> Self {
        Self {
            name: name.into(),
            version_range,
        }
    }
}

/// Declared input and output field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSchema {
    #[serde(default)]
    pub required_inputs: Vec<String>,

    #[serde(default)]
    pub optional_inputs: Vec<String>,

    /// Fields that must be present in `data` on a successful output.
    #[serde(default)]
    pub success_fields: Vec<String>,

    /// Fields that must be present on a failed output (`error` counts).
    #[serde(default)]
    pub failure_fields: Vec<String>,
}

/// One changelog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub version: Version,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Recorded when a version is deprecated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprecationInfo {
    pub reason: String,
    pub replacement: Option<String>,
    pub deprecated_at: DateTime<Utc>,
}

impl CapabilitySpec {
    /// Create a spec with defaults: active, low risk, no dependencies.
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            status: CapabilityStatus::Active,
            risk_level: RiskLevel::Low,
            category: String::new(),
            dependencies: Vec::new(),
            io_schema: IoSchema::default(),
            tags: Vec::new(),
            changelog: Vec::new(),
            requires_approval: false,
            timeout_ms: None,
        }
    }

    /// Builder: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set the declared status.
    pub fn with_status(mut self, status: CapabilityStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: set the risk level.
    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Builder: set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Builder: append a dependency.
    pub fn with_dependency(mut self, name: impl Into<String>, range: VersionRange) -> Self {
        self.dependencies.push(DependencySpec::new(name, range));
        self
    }

    /// Builder: set the I/O schema.
    pub fn with_io_schema(mut self, io_schema: IoSchema) -> Self {
        self.io_schema = io_schema;
        self
    }

    /// Builder: append a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder: always require approval.
    pub fn with_requires_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    /// Builder: per-capability execution time limit.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Parse a spec from a YAML string (nested under `capability:`).
    pub fn from_yaml(yaml: &str) -> Result<Self, RegistryError> {
        let wrapper: SpecWrapper = serde_yaml::from_str(yaml)?;
        wrapper.capability.validate()?;
        Ok(wrapper.capability)
    }

    /// Parse a spec from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// `name@version`.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Name of the circuit breaker protecting this capability.
    pub fn breaker_key(&self) -> &str {
        if self.category.is_empty() {
            &self.name
        } else {
            &self.category
        }
    }

    /// Structural checks performed before registration.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if !NAME_RE.is_match(&self.name) {
            return Err(RegistryError::InvalidSpec(format!(
                "name '{}' must be lowercase dotted segments",
                self.name
            )));
        }

        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                return Err(RegistryError::InvalidSpec(format!(
                    "{} declares a dependency with an empty name",
                    self.id()
                )));
            }
        }

        if let Some(field) = self
            .io_schema
            .required_inputs
            .iter()
            .find(|f| self.io_schema.optional_inputs.contains(f))
        {
            return Err(RegistryError::InvalidSpec(format!(
                "input '{}' is declared both required and optional",
                field
            )));
        }

        if self.timeout_ms == Some(0) {
            return Err(RegistryError::InvalidSpec(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// YAML wrapper (the spec is nested under `capability:`).
#[derive(Debug, Deserialize)]
struct SpecWrapper {
    capability: CapabilitySpec,
}
