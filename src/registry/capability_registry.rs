//! Capability registry — versioned storage and resolution of capabilities.
//!
//! The registry holds `name → version → Registration`. Reads share a
//! `parking_lot::RwLock`; every write runs its validation and the mutation
//! under a single write guard, so concurrent writers never observe or
//! produce a partially applied update.
//!
//! Resolution is by name plus an optional [`VersionRange`]:
//! `registry.get("file.read", Some(&"^1.0.0".parse()?))`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::error::RegistryError;
use super::semver::{Version, VersionRange};
use super::spec::{CapabilitySpec, CapabilityStatus, DeprecationInfo, RiskLevel};
use crate::capabilities::Capability;
use crate::events::{EventBus, EventPayload};

/// A spec bound to its implementation, plus lifecycle state.
#[derive(Clone)]
pub struct Registration {
    pub spec: Arc<CapabilitySpec>,
    pub capability: Arc<dyn Capability>,
    /// Current status. Starts as the spec's declared status.
    pub status: CapabilityStatus,
    pub deprecation: Option<DeprecationInfo>,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("spec", &self.spec.id())
            .field("status", &self.status)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Options for [`CapabilityRegistry::cleanup`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Remove every deprecated version.
    #[serde(default)]
    pub remove_deprecated: bool,
    /// Keep only the N highest versions per name.
    #[serde(default)]
    pub keep_latest: Option<usize>,
}

/// Result of [`CapabilityRegistry::validate_dependencies`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub capability: String,
    pub version: Version,
    pub valid: bool,
    pub missing: Vec<MissingDependency>,
    pub satisfied: Vec<SatisfiedDependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingDependency {
    pub name: String,
    pub version_range: VersionRange,
    pub reason: MissingReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissingReason {
    /// No version of the dependency is registered.
    NotRegistered,
    /// Versions exist, none in range.
    VersionMismatch { available: Vec<Version> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatisfiedDependency {
    pub name: String,
    pub version_range: VersionRange,
    pub resolved: Version,
}

/// One row of [`CapabilityRegistry::list_capabilities`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub name: String,
    pub description: String,
    pub category: String,
    /// Highest active version, if any.
    pub latest_version: Option<Version>,
    pub risk_level: RiskLevel,
    pub version_count: usize,
}

/// One row of [`CapabilityRegistry::list_versions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub status: CapabilityStatus,
    pub risk_level: RiskLevel,
    pub registered_at: DateTime<Utc>,
    pub deprecation: Option<DeprecationInfo>,
    pub tags: Vec<String>,
}

type VersionMap = BTreeMap<Version, Registration>;

/// The capability registry.
pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, VersionMap>>,
    events: Arc<EventBus>,
}

impl CapabilityRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Register `capability` under `spec`.
    ///
    /// Fails without side effects on an invalid spec, a name mismatch, a
    /// duplicate `(name, version)` or a dependency cycle.
    pub fn register(
        &self,
        spec: CapabilitySpec,
        capability: Arc<dyn Capability>,
    ) -> Result<(), RegistryError> {
        spec.validate()?;
        if capability.name() != spec.name {
            return Err(RegistryError::InvalidSpec(format!(
                "implementation '{}' registered under spec '{}'",
                capability.name(),
                spec.name
            )));
        }

        let name = spec.name.clone();
        let version = spec.version;
        {
            let mut entries = self.entries.write();

            if entries
                .get(&name)
                .map_or(false, |versions| versions.contains_key(&version))
            {
                return Err(RegistryError::DuplicateVersion { name, version });
            }

            if let Some(cycle) = find_cycle(&entries, &spec) {
                log::warn!(
                    "[CapabilityRegistry] Rejected {}: cycle {}",
                    spec.id(),
                    cycle.join(" -> ")
                );
                return Err(RegistryError::CyclicDependency { cycle });
            }

            let registration = Registration {
                status: spec.status,
                spec: Arc::new(spec),
                capability,
                deprecation: None,
                registered_at: Utc::now(),
            };
            entries
                .entry(name.clone())
                .or_default()
                .insert(version, registration);
        }

        log::info!("[CapabilityRegistry] Registered {}@{}", name, version);
        self.events
            .emit(EventPayload::SkillRegistered { name, version });
        Ok(())
    }

    /// Parse a YAML spec and register `capability` under it.
    pub fn register_from_yaml(
        &self,
        yaml: &str,
        capability: Arc<dyn Capability>,
    ) -> Result<(), RegistryError> {
        let spec = CapabilitySpec::from_yaml(yaml)?;
        self.register(spec, capability)
    }

    /// Remove a single version. Returns the removed registration.
    pub fn unregister(&self, name: &str, version: &Version) -> Result<Registration, RegistryError> {
        let mut entries = self.entries.write();
        let versions = entries.get_mut(name).ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
            version: Some(*version),
        })?;
        let removed = versions.remove(version).ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
            version: Some(*version),
        })?;
        if versions.is_empty() {
            entries.remove(name);
        }
        log::info!("[CapabilityRegistry] Unregistered {}@{}", name, version);
        Ok(removed)
    }

    /// Mark a version deprecated. Returns `true` if the status changed.
    ///
    /// Deprecated versions stay resolvable by exact version but drop out of
    /// "latest" and range lookups.
    pub fn deprecate(
        &self,
        name: &str,
        version: &Version,
        reason: &str,
        replacement: Option<&str>,
    ) -> Result<bool, RegistryError> {
        {
            let mut entries = self.entries.write();
            let registration = entries
                .get_mut(name)
                .and_then(|versions| versions.get_mut(version))
                .ok_or_else(|| RegistryError::NotFound {
                    name: name.to_string(),
                    version: Some(*version),
                })?;

            if registration.status == CapabilityStatus::Deprecated {
                return Ok(false);
            }
            registration.status = CapabilityStatus::Deprecated;
            registration.deprecation = Some(DeprecationInfo {
                reason: reason.to_string(),
                replacement: replacement.map(str::to_string),
                deprecated_at: Utc::now(),
            });
        }

        log::info!(
            "[CapabilityRegistry] Deprecated {}@{}: {}",
            name,
            version,
            reason
        );
        self.events.emit(EventPayload::SkillDeprecated {
            name: name.to_string(),
            version: *version,
            reason: reason.to_string(),
            replacement: replacement.map(str::to_string),
        });
        Ok(true)
    }

    /// Drop deprecated versions and/or all but the newest N per name.
    /// Returns the number of versions removed.
    pub fn cleanup(&self, options: &CleanupOptions) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;

        for versions in entries.values_mut() {
            let mut doomed: BTreeSet<Version> = BTreeSet::new();

            if options.remove_deprecated {
                doomed.extend(
                    versions
                        .iter()
                        .filter(|(_, reg)| reg.status == CapabilityStatus::Deprecated)
                        .map(|(v, _)| *v),
                );
            }
            if let Some(keep) = options.keep_latest {
                doomed.extend(versions.keys().rev().skip(keep).copied());
            }

            for version in &doomed {
                versions.remove(version);
            }
            removed += doomed.len();
        }
        entries.retain(|_, versions| !versions.is_empty());

        if removed > 0 {
            log::info!("[CapabilityRegistry] Cleanup removed {} version(s)", removed);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Resolve a capability.
    ///
    /// - `None` or `*`: highest `active` version.
    /// - exact version: that version, unless disabled.
    /// - any other range: highest `active` version in range.
    pub fn get(&self, name: &str, range: Option<&VersionRange>) -> Option<Registration> {
        let entries = self.entries.read();
        let versions = entries.get(name)?;

        if let Some(exact) = range.and_then(VersionRange::exact) {
            return versions
                .get(&exact)
                .filter(|reg| reg.status != CapabilityStatus::Disabled)
                .cloned();
        }

        let range = range.cloned().unwrap_or_default();
        versions
            .iter()
            .rev()
            .find(|(version, reg)| {
                reg.status == CapabilityStatus::Active && range.matches(version)
            })
            .map(|(_, reg)| reg.clone())
    }

    /// Look up an exact version regardless of status.
    pub fn get_exact(&self, name: &str, version: &Version) -> Option<Registration> {
        self.entries
            .read()
            .get(name)
            .and_then(|versions| versions.get(version))
            .cloned()
    }

    /// Check every declared dependency of `name@version` against the registry.
    pub fn validate_dependencies(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<DependencyReport, RegistryError> {
        let entries = self.entries.read();
        let registration = entries
            .get(name)
            .and_then(|versions| versions.get(version))
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
                version: Some(*version),
            })?;

        let mut missing = Vec::new();
        let mut satisfied = Vec::new();

        for dep in &registration.spec.dependencies {
            let available: Vec<Version> = entries
                .get(&dep.name)
                .map(|versions| {
                    versions
                        .iter()
                        .filter(|(_, reg)| reg.status != CapabilityStatus::Disabled)
                        .map(|(v, _)| *v)
                        .collect()
                })
                .unwrap_or_default();

            match dep.version_range.best_match(&available) {
                Some(resolved) => satisfied.push(SatisfiedDependency {
                    name: dep.name.clone(),
                    version_range: dep.version_range.clone(),
                    resolved,
                }),
                None => {
                    let reason = if available.is_empty() {
                        MissingReason::NotRegistered
                    } else {
                        MissingReason::VersionMismatch { available }
                    };
                    missing.push(MissingDependency {
                        name: dep.name.clone(),
                        version_range: dep.version_range.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(DependencyReport {
            capability: name.to_string(),
            version: *version,
            valid: missing.is_empty(),
            missing,
            satisfied,
        })
    }

    /// One summary row per capability name, sorted by name.
    pub fn list_capabilities(&self) -> Vec<CapabilitySummary> {
        self.entries
            .read()
            .iter()
            .filter_map(|(name, versions)| {
                let latest_active = versions
                    .iter()
                    .rev()
                    .find(|(_, reg)| reg.status == CapabilityStatus::Active);
                let (_, shown) = latest_active.or_else(|| versions.iter().next_back())?;
                Some(CapabilitySummary {
                    name: name.clone(),
                    description: shown.spec.description.clone(),
                    category: shown.spec.category.clone(),
                    latest_version: latest_active.map(|(v, _)| *v),
                    risk_level: shown.spec.risk_level,
                    version_count: versions.len(),
                })
            })
            .collect()
    }

    /// All versions of `name`, newest first.
    pub fn list_versions(&self, name: &str) -> Vec<VersionInfo> {
        self.entries
            .read()
            .get(name)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .map(|(version, reg)| VersionInfo {
                        version: *version,
                        status: reg.status,
                        risk_level: reg.spec.risk_level,
                        registered_at: reg.registered_at,
                        deprecation: reg.deprecation.clone(),
                        tags: reg.spec.tags.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered `(name, version)` pairs.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of distinct capability names.
    pub fn capability_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("versions", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Depth-first search over the name-level dependency graph with `candidate`
/// added. Returns the cycle path (starting and ending at the candidate) if
/// one exists. Edges from every registered version of a name are merged.
fn find_cycle(
    entries: &BTreeMap<String, VersionMap>,
    candidate: &CapabilitySpec,
) -> Option<Vec<String>> {
    let mut graph: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for (name, versions) in entries {
        for registration in versions.values() {
            for dep in &registration.spec.dependencies {
                graph.entry(name.as_str()).or_default().insert(dep.name.as_str());
            }
        }
    }
    for dep in &candidate.dependencies {
        graph
            .entry(candidate.name.as_str())
            .or_default()
            .insert(dep.name.as_str());
    }

    fn visit<'a>(
        node: &'a str,
        target: &str,
        graph: &HashMap<&'a str, BTreeSet<&'a str>>,
        seen: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> bool {
        let Some(next_nodes) = graph.get(node) else {
            return false;
        };
        for &next in next_nodes {
            if next == target {
                path.push(next);
                return true;
            }
            if seen.insert(next) {
                path.push(next);
                if visit(next, target, graph, seen, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let start = candidate.name.as_str();
    let mut seen = HashSet::from([start]);
    let mut path = vec![start];
    if visit(start, start, &graph, &mut seen, &mut path) {
        Some(path.into_iter().map(str::to_string).collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityOutput, FnCapability};
    use crate::events::EventTopic;
    use serde_json::json;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(Arc::new(EventBus::default()))
    }

    fn cap(name: &str) -> Arc<dyn Capability> {
        Arc::new(FnCapability::new(name, |_input, _ctx| {
            Box::pin(async { CapabilityOutput::ok(json!({})) })
        }))
    }

    fn spec(name: &str, version: &str) -> CapabilitySpec {
        CapabilitySpec::new(name, version.parse().unwrap())
    }

    fn range(expr: &str) -> VersionRange {
        VersionRange::parse(expr).unwrap()
    }

    fn snapshot(registry: &CapabilityRegistry) -> Vec<(String, Vec<Version>)> {
        registry
            .list_capabilities()
            .into_iter()
            .map(|c| {
                let versions = registry
                    .list_versions(&c.name)
                    .into_iter()
                    .map(|v| v.version)
                    .collect();
                (c.name, versions)
            })
            .collect()
    }

    #[test]
    fn test_register_then_get_exact() {
        let registry = registry();
        registry.register(spec("file.read", "1.0.0"), cap("file.read")).unwrap();

        let found = registry.get("file.read", Some(&range("1.0.0"))).unwrap();
        assert_eq!(found.spec.version, Version::new(1, 0, 0));
        assert_eq!(found.capability.name(), "file.read");
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let registry = registry();
        registry.register(spec("file.read", "1.0.0"), cap("file.read")).unwrap();

        let err = registry
            .register(spec("file.read", "1.0.0"), cap("file.read"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateVersion { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let registry = registry();
        let err = registry
            .register(spec("file.read", "1.0.0"), cap("file.write"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSpec(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_latest_active_resolution() {
        let registry = registry();
        registry.register(spec("ai.call", "1.0.0"), cap("ai.call")).unwrap();
        registry.register(spec("ai.call", "1.4.0"), cap("ai.call")).unwrap();
        registry
            .register(
                spec("ai.call", "2.0.0").with_status(CapabilityStatus::Beta),
                cap("ai.call"),
            )
            .unwrap();

        assert_eq!(
            registry.get("ai.call", None).unwrap().spec.version,
            Version::new(1, 4, 0)
        );
        assert_eq!(
            registry.get("ai.call", Some(&range("~1.0.0"))).unwrap().spec.version,
            Version::new(1, 0, 0)
        );
        assert!(registry.get("ai.call", Some(&range("^2.0.0"))).is_none());
        assert!(registry.get("missing", None).is_none());
    }

    #[test]
    fn test_deprecated_excluded_from_latest_but_exact_resolvable() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe(EventTopic::SkillDeprecated);
        let registry = CapabilityRegistry::new(bus);
        registry.register(spec("ai.call", "1.0.0"), cap("ai.call")).unwrap();
        registry.register(spec("ai.call", "1.1.0"), cap("ai.call")).unwrap();

        let v110 = Version::new(1, 1, 0);
        assert!(registry
            .deprecate("ai.call", &v110, "token leak", Some("1.0.0"))
            .unwrap());
        assert!(!registry.deprecate("ai.call", &v110, "again", None).unwrap());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        assert_eq!(
            registry.get("ai.call", None).unwrap().spec.version,
            Version::new(1, 0, 0)
        );
        let exact = registry.get("ai.call", Some(&range("1.1.0"))).unwrap();
        assert_eq!(exact.status, CapabilityStatus::Deprecated);
        assert_eq!(exact.deprecation.unwrap().replacement.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_disabled_never_resolves() {
        let registry = registry();
        registry
            .register(
                spec("shell.exec", "1.0.0").with_status(CapabilityStatus::Disabled),
                cap("shell.exec"),
            )
            .unwrap();
        assert!(registry.get("shell.exec", Some(&range("1.0.0"))).is_none());
        assert!(registry.get_exact("shell.exec", &Version::new(1, 0, 0)).is_some());
    }

    #[test]
    fn test_cycle_rejected_and_registry_unchanged() {
        let registry = registry();
        registry
            .register(
                spec("a.one", "1.0.0").with_dependency("b.two", range("^1.0.0")),
                cap("a.one"),
            )
            .unwrap();
        registry
            .register(
                spec("b.two", "1.0.0").with_dependency("c.three", range("^1.0.0")),
                cap("b.two"),
            )
            .unwrap();

        let before = snapshot(&registry);
        let err = registry
            .register(
                spec("c.three", "1.0.0").with_dependency("a.one", range("^1.0.0")),
                cap("c.three"),
            )
            .unwrap_err();

        match err {
            RegistryError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["c.three", "a.one", "b.two", "c.three"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert_eq!(snapshot(&registry), before);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let registry = registry();
        let err = registry
            .register(
                spec("ai.call", "1.0.0").with_dependency("ai.call", range("^1.0.0")),
                cap("ai.call"),
            )
            .unwrap_err();

        match err {
            RegistryError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["ai.call", "ai.call"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_validate_dependencies_reports_missing() {
        let registry = registry();
        registry.register(spec("file.read", "1.2.0"), cap("file.read")).unwrap();
        registry
            .register(
                spec("file.summarize", "1.0.0")
                    .with_dependency("file.read", range("^1.0.0"))
                    .with_dependency("ai.call", range("^2.0.0")),
                cap("file.summarize"),
            )
            .unwrap();
        registry.register(spec("ai.call", "1.0.0"), cap("ai.call")).unwrap();

        let report = registry
            .validate_dependencies("file.summarize", &Version::new(1, 0, 0))
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.satisfied[0].resolved, Version::new(1, 2, 0));
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].name, "ai.call");
        assert_eq!(
            report.missing[0].reason,
            MissingReason::VersionMismatch {
                available: vec![Version::new(1, 0, 0)]
            }
        );
    }

    #[test]
    fn test_dependency_goes_missing_after_unregister() {
        let registry = registry();
        registry.register(spec("file.read", "1.0.0"), cap("file.read")).unwrap();
        registry
            .register(
                spec("file.copy", "1.0.0").with_dependency("file.read", range("^1.0.0")),
                cap("file.copy"),
            )
            .unwrap();

        let v1 = Version::new(1, 0, 0);
        let report = registry.validate_dependencies("file.copy", &v1).unwrap();
        assert!(report.valid);
        assert!(report.missing.is_empty());

        registry.unregister("file.read", &v1).unwrap();
        let report = registry.validate_dependencies("file.copy", &v1).unwrap();
        assert!(!report.valid);
        assert_eq!(report.missing[0].name, "file.read");
        assert_eq!(report.missing[0].reason, MissingReason::NotRegistered);
    }

    #[test]
    fn test_cleanup_removes_deprecated_and_trims() {
        let registry = registry();
        for v in ["1.0.0", "1.1.0", "1.2.0", "1.3.0"] {
            registry.register(spec("ai.call", v), cap("ai.call")).unwrap();
        }
        registry
            .deprecate("ai.call", &Version::new(1, 3, 0), "regression", None)
            .unwrap();

        let removed = registry.cleanup(&CleanupOptions {
            remove_deprecated: true,
            keep_latest: Some(2),
        });
        assert_eq!(removed, 3);
        let versions: Vec<Version> = registry
            .list_versions("ai.call")
            .into_iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![Version::new(1, 2, 0)]);
    }

    #[test]
    fn test_registration_emits_event() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe(EventTopic::SkillRegistered);
        let registry = CapabilityRegistry::new(bus);
        registry.register(spec("file.read", "1.0.0"), cap("file.read")).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.payload,
            EventPayload::SkillRegistered {
                name: "file.read".to_string(),
                version: Version::new(1, 0, 0),
            }
        );
    }
}
