//! Engine context.
//!
//! Built once at process start and shared by reference. Owns exactly one
//! instance of each engine component; nothing in the crate reaches for a
//! global.

use std::sync::Arc;

use crate::approval::ApprovalGate;
use crate::config::{ConfigError, EngineConfig};
use crate::events::EventBus;
use crate::ledger::MetricsCollector;
use crate::registry::CapabilityRegistry;
use crate::resilience::ResilienceLayer;

pub struct EngineContext {
    pub config: EngineConfig,
    pub events: Arc<EventBus>,
    pub registry: Arc<CapabilityRegistry>,
    pub resilience: Arc<ResilienceLayer>,
    pub approvals: Arc<ApprovalGate>,
    pub ledger: Arc<MetricsCollector>,
}

impl EngineContext {
    /// Validate `config` and build every component from it.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// A context with default configuration.
    pub fn with_defaults() -> Self {
        Self::build(EngineConfig::default())
    }

    fn build(config: EngineConfig) -> Self {
        let events = Arc::new(EventBus::new(config.events.channel_capacity));
        let registry = Arc::new(CapabilityRegistry::new(events.clone()));
        let resilience = Arc::new(ResilienceLayer::from_config(&config, events.clone()));
        let approvals = Arc::new(ApprovalGate::new(config.approval.clone(), events.clone()));
        let ledger = Arc::new(MetricsCollector::new(config.ledger.capacity, events.clone()));

        log::debug!(
            "[EngineContext] Ready (ledger capacity {}, approval timeout {}ms)",
            config.ledger.capacity,
            config.approval.timeout_ms
        );

        Self {
            config,
            events,
            registry,
            resilience,
            approvals,
            ledger,
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("approvals", &self.approvals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_share_one_bus() {
        let ctx = EngineContext::with_defaults();
        ctx.resilience.metrics.record("x", 1.0);
        ctx.ledger
            .record(crate::ledger::ExecutionRecord::new("y", 1, true));
        assert_eq!(ctx.events.emitted(), 2);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.ledger.capacity = 0;
        assert!(matches!(
            EngineContext::new(config),
            Err(ConfigError::Invalid(_))
        ));
    }
}
