//! Circuit breaker keyed by resource name.
//!
//! ```text
//!   CLOSED ──(failures ≥ threshold)──▶ OPEN
//!     ▲                                  │
//!     │                        (open_duration elapsed)
//!     │                                  ▼
//!     └──(successes ≥ threshold)──── HALF_OPEN ──(any failure)──▶ OPEN
//! ```
//!
//! The admission decision is synchronous and never awaits. Time is read
//! from `tokio::time::Instant`, so paused-clock tests can drive the
//! open window.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::events::{EventBus, EventPayload};

const RESPONSE_WINDOW: usize = 100;
const TRANSITION_HISTORY: usize = 100;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Whether `self → to` is one of the four legal transitions.
    pub fn can_transition_to(&self, to: CircuitState) -> bool {
        matches!(
            (self, to),
            (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::Open, CircuitState::HalfOpen)
                | (CircuitState::HalfOpen, CircuitState::Closed)
                | (CircuitState::HalfOpen, CircuitState::Open)
        )
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a call is rejected without being invoked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is open, retry after {}ms", .retry_after.as_millis())]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

/// Outcome of [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("{0}")]
    Inner(E),
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub open_count: u64,
    /// Mean over the last 100 completed calls.
    pub avg_response_ms: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    open_count: u64,
    response_times: VecDeque<f64>,
    transitions: VecDeque<StateTransition>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            half_open_in_flight: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            open_count: 0,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    /// Apply a transition. Returns it for emission once the lock is released.
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return None;
        }
        self.state = to;
        match to {
            CircuitState::Open => {
                self.open_count += 1;
                self.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes = 0;
                self.half_open_in_flight = 0;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
        }
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(StateTransition {
            from,
            to,
            at: Utc::now(),
        });
        Some((from, to))
    }

    fn record_response(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed.as_secs_f64() * 1000.0);
    }
}

/// Admission ticket for one call. Report the outcome with
/// [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure); dropping it unreported only
/// frees the half-open slot.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial, self.started.elapsed());
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial, self.started.elapsed());
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            let mut state = self.breaker.state.lock();
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: Arc<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, events: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as last recorded. An open breaker whose window has
    /// elapsed reports `OPEN` until the next admission attempt.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Decide whether a call may proceed.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut trial = false;
        let mut changed = None;
        let result = {
            let mut state = self.state.lock();
            let open_for = self.config.open_duration();
            let mut retry_after = None;

            if state.state == CircuitState::Open {
                let elapsed = state
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(open_for);
                if elapsed < open_for {
                    retry_after = Some(open_for - elapsed);
                } else {
                    changed = state.transition(CircuitState::HalfOpen);
                }
            }

            if retry_after.is_none() && state.state == CircuitState::HalfOpen {
                if state.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                    retry_after = Some(Duration::ZERO);
                } else {
                    state.half_open_in_flight += 1;
                    trial = true;
                }
            }

            match retry_after {
                Some(retry_after) => {
                    state.rejected_calls += 1;
                    Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_after,
                    })
                }
                None => Ok(()),
            }
        };

        self.publish(changed);
        result.map(|()| CallPermit {
            breaker: self,
            trial,
            started: Instant::now(),
            settled: false,
        })
    }

    /// Run `operation` under the breaker.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(BreakerError::Open)?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                permit.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn on_success(&self, trial: bool, elapsed: Duration) {
        let changed = {
            let mut state = self.state.lock();
            if trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
            state.total_calls += 1;
            state.successful_calls += 1;
            state.last_success_at = Some(Utc::now());
            state.record_response(elapsed);
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;

            if state.state == CircuitState::HalfOpen
                && state.consecutive_successes >= self.config.success_threshold
            {
                state.transition(CircuitState::Closed)
            } else {
                None
            }
        };
        self.publish(changed);
    }

    fn on_failure(&self, trial: bool, elapsed: Duration) {
        let changed = {
            let mut state = self.state.lock();
            if trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
            state.total_calls += 1;
            state.failed_calls += 1;
            state.record_response(elapsed);
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            state.last_failure = Some(Instant::now());
            state.last_failure_at = Some(Utc::now());

            match state.state {
                CircuitState::Closed
                    if state.consecutive_failures >= self.config.failure_threshold =>
                {
                    state.transition(CircuitState::Open)
                }
                CircuitState::HalfOpen => state.transition(CircuitState::Open),
                _ => None,
            }
        };
        self.publish(changed);
    }

    fn publish(&self, changed: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = changed {
            match to {
                CircuitState::Open => {
                    log::warn!("[CircuitBreaker] '{}' {} -> {}", self.name, from, to)
                }
                _ => log::info!("[CircuitBreaker] '{}' {} -> {}", self.name, from, to),
            }
            self.events.emit(EventPayload::CircuitStateChange {
                breaker: self.name.clone(),
                from,
                to,
            });
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        let avg_response_ms = if state.response_times.is_empty() {
            0.0
        } else {
            state.response_times.iter().sum::<f64>() / state.response_times.len() as f64
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            open_count: state.open_count,
            avg_response_ms,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
        }
    }

    /// Recent transitions, oldest first (at most 100).
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.state.lock().transitions.iter().cloned().collect()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Breakers created on demand by name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    events: Arc<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides,
            events,
        }
    }

    /// The breaker for `name`, created with its configured settings if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                log::debug!("[CircuitBreaker] Created '{}'", name);
                Arc::new(CircuitBreaker::new(name, config, self.events.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Stats for every breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTopic;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failure_threshold: u32, success_threshold: u32, open_ms: u64) -> CircuitBreaker {
        let config = CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            open_duration_ms: open_ms,
            half_open_max_calls: 1,
        };
        CircuitBreaker::new("test", config, Arc::new(EventBus::default()))
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_at_threshold_and_short_circuits() {
        let cb = breaker(3, 1, 30_000);
        let counter = AtomicUsize::new(0);
        let invoked = &counter;

        for _ in 0..3 {
            let result = cb
                .execute(move || async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb
            .execute(move || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        match result {
            Err(BreakerError::Open(err)) => {
                assert_eq!(err.name, "test");
                assert!(err.retry_after > Duration::ZERO);
            }
            other => panic!("expected open error, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(cb.stats().rejected_calls, 1);
        assert_eq!(cb.stats().open_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let cb = breaker(1, 2, 1_000);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        let path: Vec<_> = cb.transitions().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 1, 500);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(600)).await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open(_))));
        assert!(cb
            .transitions()
            .iter()
            .all(|t| t.from.can_transition_to(t.to)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_limited_trials() {
        let cb = breaker(1, 1, 100);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(150)).await;

        let permit = cb.try_acquire().expect("first trial admitted");
        assert!(cb.try_acquire().is_err());
        drop(permit);
        // Dropped without an outcome: the slot is free again.
        cb.try_acquire().expect("slot released").record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 1, 1_000);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 1);
        assert_eq!(cb.stats().total_calls, 4);
    }

    #[tokio::test]
    async fn test_state_change_event() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe(EventTopic::CircuitStateChange);
        let cb = CircuitBreaker::new(
            "files",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            events,
        );
        fail(&cb).await.unwrap_err();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.payload,
            EventPayload::CircuitStateChange {
                breaker: "files".to_string(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
    }

    #[test]
    fn test_registry_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "ai".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 9,
                ..Default::default()
            },
        );
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            overrides,
            Arc::new(EventBus::default()),
        );

        let ai = registry.get_or_create("ai");
        assert_eq!(ai.config().failure_threshold, 9);
        assert!(Arc::ptr_eq(&ai, &registry.get_or_create("ai")));
        assert_eq!(registry.get_or_create("files").config().failure_threshold, 5);
        assert_eq!(registry.all_stats().len(), 2);
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
    }
}
