//! Engine configuration.
//!
//! Every section has working defaults, so an empty YAML document is a valid
//! config. Values can be loaded from a file and then overlaid with
//! `CAPENGINE_*` environment variables:
//!
//! ```yaml
//! circuit_breaker:
//!   failure_threshold: 3
//!   open_duration_ms: 10000
//! approval:
//!   timeout_ms: 30000
//!   min_risk_level: critical
//! ledger:
//!   capacity: 5000
//! fallback: mock_data
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RiskLevel;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An environment variable held an unparseable value.
    #[error("Invalid value '{value}' for {var}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Whether capabilities may answer with mock data when their real
/// integration is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Missing credentials or upstreams are failures.
    #[default]
    Disabled,
    /// Capabilities may return clearly flagged (`degraded`) mock data.
    MockData,
}

impl FallbackPolicy {
    pub fn allows_mock(&self) -> bool {
        matches!(self, FallbackPolicy::MockData)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-breaker overrides keyed by breaker name (category or capability).
    pub circuit_breaker_overrides: HashMap<String, CircuitBreakerConfig>,
    pub watchdog: WatchdogConfig,
    pub rate_limiter: RateLimiterConfig,
    pub metrics: MetricsConfig,
    pub executor: ExecutorConfig,
    pub approval: ApprovalConfig,
    pub ledger: LedgerConfig,
    pub events: EventsConfig,
    pub alerts: AlertsConfig,
    pub fallback: FallbackPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time an open circuit rejects calls before allowing a trial.
    pub open_duration_ms: u64,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_duration_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 10_000,
            max_missed_heartbeats: 3,
        }
    }
}

impl WatchdogConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// Global refill rate in tokens per second.
    pub requests_per_second: f64,
    /// Global bucket capacity.
    pub burst_size: u32,
    /// Also limit each key (capability name) separately.
    pub per_key_limit: bool,
    pub per_key_requests_per_second: f64,
    pub per_key_burst_size: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100.0,
            burst_size: 150,
            per_key_limit: true,
            per_key_requests_per_second: 10.0,
            per_key_burst_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Points retained per metric name.
    pub history_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { history_size: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default execution time limit for sandbox and production runs.
    pub max_execution_ms: u64,
    /// Refuse to execute when declared dependencies are unsatisfied.
    pub enforce_dependencies: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_execution_ms: 30_000,
            enforce_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// How long a pending approval waits before resolving as rejected.
    pub timeout_ms: u64,
    /// Capabilities at or above this risk level always need approval.
    pub min_risk_level: RiskLevel,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            min_risk_level: RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum retained execution records.
    pub capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Buffered events per topic before slow subscribers start lagging.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Threshold alerts over recent execution outcomes per capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    /// Outcomes kept per capability.
    pub window: usize,
    /// Outcomes needed before any threshold is evaluated.
    pub min_samples: usize,
    /// Failure fraction of the window that raises an alert.
    pub failure_rate_threshold: f64,
    /// Average successful duration above which an alert is raised.
    pub latency_threshold_ms: u64,
    /// Quiet period per capability and alert kind after an alert.
    pub cooldown_ms: u64,
    /// Raised alerts retained for `/alerts`.
    pub history_size: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            min_samples: 5,
            failure_rate_threshold: 0.5,
            latency_threshold_ms: 10_000,
            cooldown_ms: 300_000,
            history_size: 100,
        }
    }
}

impl AlertsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl EngineConfig {
    /// Parse from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Defaults overlaid with `CAPENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overlay `CAPENGINE_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup (used by `apply_env`).
    ///
    /// Recognised keys:
    /// `CAPENGINE_CB_FAILURE_THRESHOLD`, `CAPENGINE_CB_SUCCESS_THRESHOLD`,
    /// `CAPENGINE_CB_OPEN_DURATION_MS`, `CAPENGINE_RATE_LIMIT_ENABLED`,
    /// `CAPENGINE_RATE_LIMIT_RPS`, `CAPENGINE_MAX_EXECUTION_MS`,
    /// `CAPENGINE_APPROVAL_TIMEOUT_MS`, `CAPENGINE_LEDGER_CAPACITY`,
    /// `CAPENGINE_WATCHDOG_INTERVAL_MS`, `CAPENGINE_FALLBACK`.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }

        macro_rules! overlay {
            ($var:literal => $field:expr) => {
                if let Some(value) = lookup($var) {
                    $field = parse($var, value)?;
                }
            };
        }

        overlay!("CAPENGINE_CB_FAILURE_THRESHOLD" => self.circuit_breaker.failure_threshold);
        overlay!("CAPENGINE_CB_SUCCESS_THRESHOLD" => self.circuit_breaker.success_threshold);
        overlay!("CAPENGINE_CB_OPEN_DURATION_MS" => self.circuit_breaker.open_duration_ms);
        overlay!("CAPENGINE_RATE_LIMIT_ENABLED" => self.rate_limiter.enabled);
        overlay!("CAPENGINE_RATE_LIMIT_RPS" => self.rate_limiter.requests_per_second);
        overlay!("CAPENGINE_MAX_EXECUTION_MS" => self.executor.max_execution_ms);
        overlay!("CAPENGINE_APPROVAL_TIMEOUT_MS" => self.approval.timeout_ms);
        overlay!("CAPENGINE_LEDGER_CAPACITY" => self.ledger.capacity);
        overlay!("CAPENGINE_WATCHDOG_INTERVAL_MS" => self.watchdog.heartbeat_interval_ms);

        if let Some(value) = lookup("CAPENGINE_FALLBACK") {
            self.fallback = match value.trim() {
                "disabled" => FallbackPolicy::Disabled,
                "mock_data" => FallbackPolicy::MockData,
                _ => {
                    return Err(ConfigError::Env {
                        var: "CAPENGINE_FALLBACK".to_string(),
                        value,
                    })
                }
            };
        }

        Ok(self)
    }

    /// Check value ranges. Returns every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let mut check_breaker = |label: &str, cb: &CircuitBreakerConfig| {
            if cb.failure_threshold == 0 {
                problems.push(format!("{label}.failure_threshold must be > 0"));
            }
            if cb.success_threshold == 0 {
                problems.push(format!("{label}.success_threshold must be > 0"));
            }
            if cb.half_open_max_calls == 0 {
                problems.push(format!("{label}.half_open_max_calls must be > 0"));
            }
        };
        check_breaker("circuit_breaker", &self.circuit_breaker);
        for (name, cb) in &self.circuit_breaker_overrides {
            check_breaker(&format!("circuit_breaker_overrides.{name}"), cb);
        }

        if self.watchdog.heartbeat_interval_ms == 0 {
            problems.push("watchdog.heartbeat_interval_ms must be > 0".to_string());
        }
        if self.watchdog.max_missed_heartbeats == 0 {
            problems.push("watchdog.max_missed_heartbeats must be > 0".to_string());
        }
        if self.rate_limiter.enabled {
            if self.rate_limiter.requests_per_second <= 0.0 || self.rate_limiter.burst_size == 0 {
                problems.push("rate_limiter global rate and burst must be > 0".to_string());
            }
            if self.rate_limiter.per_key_limit
                && (self.rate_limiter.per_key_requests_per_second <= 0.0
                    || self.rate_limiter.per_key_burst_size == 0)
            {
                problems.push("rate_limiter per-key rate and burst must be > 0".to_string());
            }
        }
        if self.metrics.history_size == 0 {
            problems.push("metrics.history_size must be > 0".to_string());
        }
        if self.executor.max_execution_ms == 0 {
            problems.push("executor.max_execution_ms must be > 0".to_string());
        }
        if self.approval.timeout_ms == 0 {
            problems.push("approval.timeout_ms must be > 0".to_string());
        }
        if self.ledger.capacity == 0 {
            problems.push("ledger.capacity must be > 0".to_string());
        }
        if self.events.channel_capacity == 0 {
            problems.push("events.channel_capacity must be > 0".to_string());
        }
        if self.alerts.enabled {
            if self.alerts.window == 0 || self.alerts.history_size == 0 {
                problems.push("alerts.window and alerts.history_size must be > 0".to_string());
            }
            if self.alerts.min_samples == 0 || self.alerts.min_samples > self.alerts.window {
                problems.push("alerts.min_samples must be in 1..=alerts.window".to_string());
            }
            if !(self.alerts.failure_rate_threshold > 0.0
                && self.alerts.failure_rate_threshold <= 1.0)
            {
                problems.push("alerts.failure_rate_threshold must be in (0, 1]".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
