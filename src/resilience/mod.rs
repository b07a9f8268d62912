//! # Resilience Layer
//!
//! Fault-tolerance primitives shared by every execution:
//!
//! - [`CircuitBreakerRegistry`]: one breaker per resource name
//! - [`WatchdogRegistry`]: heartbeat monitoring per process name
//! - [`RateLimiter`]: global and per-capability token buckets
//! - [`MetricStream`]: bounded numeric history per metric name
//! - [`AlertMonitor`]: failure-rate and latency alerts per capability

pub mod alerts;
pub mod circuit_breaker;
pub mod metrics;
pub mod rate_limiter;
pub mod watchdog;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::events::EventBus;

pub use alerts::{Alert, AlertKind, AlertLevel, AlertMonitor, AlertStats};
pub use circuit_breaker::{
    BreakerError, CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitOpenError, CircuitState, StateTransition,
};
pub use metrics::{MetricAggregate, MetricSample, MetricStream};
pub use rate_limiter::{RateLimitExceeded, RateLimiter, RateLimiterStats, TokenBucket};
pub use watchdog::{Watchdog, WatchdogRegistry, WatchdogStatus};

/// The resilience components of one engine.
pub struct ResilienceLayer {
    pub breakers: CircuitBreakerRegistry,
    pub watchdogs: WatchdogRegistry,
    pub rate_limiter: RateLimiter,
    pub metrics: MetricStream,
    pub alerts: Arc<AlertMonitor>,
}

/// Combined snapshot for `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceStats {
    pub breakers: Vec<CircuitBreakerStats>,
    pub watchdogs: Vec<WatchdogStatus>,
    pub rate_limiter: RateLimiterStats,
    pub metrics: Vec<String>,
    pub alerts: AlertStats,
}

impl ResilienceLayer {
    pub fn from_config(config: &EngineConfig, events: Arc<EventBus>) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(
                config.circuit_breaker.clone(),
                config.circuit_breaker_overrides.clone(),
                events.clone(),
            ),
            watchdogs: WatchdogRegistry::new(config.watchdog.clone(), events.clone()),
            rate_limiter: RateLimiter::new("capabilities", config.rate_limiter.clone()),
            metrics: MetricStream::new(config.metrics.history_size, events.clone()),
            alerts: Arc::new(AlertMonitor::new(config.alerts.clone(), events)),
        }
    }

    /// Breaker for a resource name.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(name)
    }

    pub fn stats(&self) -> ResilienceStats {
        ResilienceStats {
            breakers: self.breakers.all_stats(),
            watchdogs: self.watchdogs.statuses(),
            rate_limiter: self.rate_limiter.stats(),
            metrics: self.metrics.names(),
            alerts: self.alerts.stats(),
        }
    }
}

impl std::fmt::Debug for ResilienceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceLayer")
            .field("breakers", &self.breakers.len())
            .field("rate_limiter", &self.rate_limiter)
            .finish()
    }
}
