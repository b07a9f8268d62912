//! Threshold alerts over execution outcomes.
//!
//! [`AlertMonitor`] keeps the last `window` outcomes of every capability and
//! raises `alert:raised` when the window's failure rate reaches
//! `failure_rate_threshold`, or when the average duration of its successful
//! runs exceeds `latency_threshold_ms`. An alert of one kind for one
//! capability is not raised again until `cooldown_ms` has passed; repeats
//! inside the cooldown are only counted.
//!
//! [`AlertMonitor::start`] feeds the monitor from the bus: each executed
//! `execution:complete` is a success, each `execution:error` raised by the
//! capability itself (failure, panic, timeout, bad output) is a failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::AlertsConfig;
use crate::events::{EventBus, EventPayload, EventTopic};
use crate::executor::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FailureRate,
    Latency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    /// Every run in the window failed, or latency is at least twice the threshold.
    Critical,
}

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub capability: String,
    pub kind: AlertKind,
    pub level: AlertLevel,
    /// Observed failure fraction, or average duration in milliseconds.
    pub value: f64,
    pub threshold: f64,
    /// Outcomes in the window when the alert was raised.
    pub samples: usize,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStats {
    pub enabled: bool,
    pub raised: u64,
    pub suppressed: u64,
    pub tracked_capabilities: usize,
}

#[derive(Clone, Copy)]
struct Outcome {
    success: bool,
    duration_ms: Option<u64>,
}

pub struct AlertMonitor {
    config: AlertsConfig,
    windows: DashMap<String, VecDeque<Outcome>>,
    last_raised: DashMap<(String, AlertKind), Instant>,
    history: Mutex<VecDeque<Alert>>,
    raised: AtomicU64,
    suppressed: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventBus>,
}

impl AlertMonitor {
    pub fn new(config: AlertsConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            last_raised: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            raised: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            task: Mutex::new(None),
            events,
        }
    }

    /// Subscribe to execution outcomes on the bus. A no-op when alerts are
    /// disabled or the subscriber is already running.
    ///
    /// The task holds only a weak reference and exits once the monitor is dropped.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let mut completed = self.events.subscribe(EventTopic::ExecutionComplete);
        let mut failed = self.events.subscribe(EventTopic::ExecutionError);
        let weak: Weak<Self> = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    event = completed.recv() => event,
                    event = failed.recv() => event,
                };
                let event = match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("[AlertMonitor] Skipped {} execution events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match weak.upgrade() {
                    Some(monitor) => {
                        monitor.handle(&event.payload);
                    }
                    None => break,
                }
            }
        }));
        log::debug!("[AlertMonitor] Subscribed to execution outcomes");
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    fn handle(&self, payload: &EventPayload) {
        match payload {
            EventPayload::ExecutionComplete {
                capability,
                duration_ms,
                executed: true,
                ..
            } => {
                self.observe(capability, true, Some(*duration_ms));
            }
            EventPayload::ExecutionError {
                capability, code, ..
            } if counts_as_failure(*code) => {
                self.observe(capability, false, None);
            }
            _ => {}
        }
    }

    /// Record one outcome and return the alerts it raised.
    pub fn observe(&self, capability: &str, success: bool, duration_ms: Option<u64>) -> Vec<Alert> {
        if !self.config.enabled {
            return Vec::new();
        }

        let candidates = {
            let mut window = self.windows.entry(capability.to_string()).or_default();
            window.push_back(Outcome {
                success,
                duration_ms,
            });
            while window.len() > self.config.window {
                window.pop_front();
            }
            self.evaluate(&window)
        };

        candidates
            .into_iter()
            .filter_map(|(kind, value, samples)| self.raise(capability, kind, value, samples))
            .collect()
    }

    fn evaluate(&self, window: &VecDeque<Outcome>) -> Vec<(AlertKind, f64, usize)> {
        let samples = window.len();
        if samples < self.config.min_samples {
            return Vec::new();
        }

        let mut found = Vec::new();
        let failures = window.iter().filter(|o| !o.success).count();
        let failure_rate = failures as f64 / samples as f64;
        if failure_rate >= self.config.failure_rate_threshold {
            found.push((AlertKind::FailureRate, failure_rate, samples));
        }

        let durations: Vec<u64> = window
            .iter()
            .filter(|o| o.success)
            .filter_map(|o| o.duration_ms)
            .collect();
        if !durations.is_empty() {
            let average = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
            if average > self.config.latency_threshold_ms as f64 {
                found.push((AlertKind::Latency, average, samples));
            }
        }
        found
    }

    fn raise(&self, capability: &str, kind: AlertKind, value: f64, samples: usize) -> Option<Alert> {
        let now = Instant::now();
        let key = (capability.to_string(), kind);
        if let Some(last) = self.last_raised.get(&key) {
            if now.duration_since(*last) < self.config.cooldown() {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        self.last_raised.insert(key, now);

        let (threshold, level, message) = match kind {
            AlertKind::FailureRate => {
                let threshold = self.config.failure_rate_threshold;
                let level = if value >= 1.0 {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                };
                let message = format!(
                    "'{}' failed {:.0}% of the last {} runs",
                    capability,
                    value * 100.0,
                    samples
                );
                (threshold, level, message)
            }
            AlertKind::Latency => {
                let threshold = self.config.latency_threshold_ms as f64;
                let level = if value >= threshold * 2.0 {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                };
                let message = format!(
                    "'{}' averages {:.0}ms over {} runs (threshold {}ms)",
                    capability, value, samples, self.config.latency_threshold_ms
                );
                (threshold, level, message)
            }
        };

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            capability: capability.to_string(),
            kind,
            level,
            value,
            threshold,
            samples,
            message,
            raised_at: Utc::now(),
        };
        match level {
            AlertLevel::Critical => log::error!("[AlertMonitor] {}", alert.message),
            AlertLevel::Warning => log::warn!("[AlertMonitor] {}", alert.message),
        }

        {
            let mut history = self.history.lock();
            history.push_back(alert.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.events.emit(EventPayload::AlertRaised {
            alert: alert.clone(),
        });
        Some(alert)
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Forget the window and cooldowns of one capability.
    pub fn reset(&self, capability: &str) {
        self.windows.remove(capability);
        self.last_raised.retain(|(name, _), _| name != capability);
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            enabled: self.config.enabled,
            raised: self.raised.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            tracked_capabilities: self.windows.len(),
        }
    }
}

impl Drop for AlertMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AlertMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertMonitor")
            .field("config", &self.config)
            .field("tracked", &self.windows.len())
            .finish()
    }
}

/// Errors the capability itself is responsible for.
fn counts_as_failure(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::CapabilityFailed
            | ErrorCode::CapabilityPanicked
            | ErrorCode::ExecutionTimeout
            | ErrorCode::OutputValidationFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> AlertsConfig {
        AlertsConfig {
            enabled: true,
            window: 4,
            min_samples: 4,
            failure_rate_threshold: 0.5,
            latency_threshold_ms: 100,
            cooldown_ms: 1_000,
            history_size: 10,
        }
    }

    fn raised(rx: &mut tokio::sync::broadcast::Receiver<crate::events::EngineEvent>) -> Vec<Alert> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| match e.payload {
                EventPayload::AlertRaised { alert } => alert,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failure_rate_needs_min_samples() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe(EventTopic::AlertRaised);
        let monitor = AlertMonitor::new(config(), events);

        assert!(monitor.observe("files.read", false, None).is_empty());
        assert!(monitor.observe("files.read", false, None).is_empty());
        assert!(monitor.observe("files.read", true, Some(5)).is_empty());

        let alerts = monitor.observe("files.read", true, Some(5));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::FailureRate);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].value, 0.5);
        assert_eq!(alerts[0].samples, 4);

        let published = raised(&mut rx);
        assert_eq!(published, alerts);
    }

    #[tokio::test]
    async fn test_window_slides_out_old_failures() {
        let monitor = AlertMonitor::new(config(), Arc::new(EventBus::default()));
        monitor.observe("x", false, None);
        for _ in 0..3 {
            monitor.observe("x", true, Some(1));
        }
        assert!(monitor.observe("x", true, Some(1)).is_empty());
        assert_eq!(monitor.stats().raised, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeats() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe(EventTopic::AlertRaised);
        let monitor = AlertMonitor::new(config(), events);

        for _ in 0..3 {
            monitor.observe("ai.call", false, None);
        }
        let first = monitor.observe("ai.call", false, None);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].level, AlertLevel::Critical);

        assert!(monitor.observe("ai.call", false, None).is_empty());
        assert_eq!(monitor.stats().suppressed, 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(monitor.observe("ai.call", false, None).len(), 1);

        assert_eq!(raised(&mut rx).len(), 2);
        let stats = monitor.stats();
        assert_eq!(stats.raised, 2);
        assert_eq!(stats.tracked_capabilities, 1);
        assert_eq!(monitor.recent(1)[0].id, monitor.recent(2)[0].id);
        assert_eq!(monitor.recent(10).len(), 2);
    }

    #[tokio::test]
    async fn test_latency_alert_uses_successful_runs() {
        let monitor = AlertMonitor::new(config(), Arc::new(EventBus::default()));
        monitor.observe("slow", true, Some(150));
        monitor.observe("slow", true, Some(250));
        monitor.observe("slow", true, Some(150));
        let alerts = monitor.observe("slow", true, Some(250));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Latency);
        assert_eq!(alerts[0].value, 200.0);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].threshold, 100.0);
    }

    #[tokio::test]
    async fn test_reset_clears_window_and_cooldown() {
        let monitor = AlertMonitor::new(config(), Arc::new(EventBus::default()));
        for _ in 0..4 {
            monitor.observe("x", false, None);
        }
        assert_eq!(monitor.stats().raised, 1);

        monitor.reset("x");
        for _ in 0..3 {
            assert!(monitor.observe("x", false, None).is_empty());
        }
        assert_eq!(monitor.observe("x", false, None).len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_monitor_ignores_outcomes() {
        let mut cfg = config();
        cfg.enabled = false;
        let monitor = Arc::new(AlertMonitor::new(cfg, Arc::new(EventBus::default())));
        monitor.start();
        assert!(!monitor.is_running());
        for _ in 0..4 {
            assert!(monitor.observe("x", false, None).is_empty());
        }
        assert_eq!(monitor.stats().tracked_capabilities, 0);
    }

    #[tokio::test]
    async fn test_subscriber_counts_capability_errors_only() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe(EventTopic::AlertRaised);
        let monitor = Arc::new(AlertMonitor::new(config(), events.clone()));
        monitor.start();
        assert!(monitor.is_running());

        let error = |code: ErrorCode| EventPayload::ExecutionError {
            request_id: Uuid::new_v4().to_string(),
            capability: "ai.call".to_string(),
            code,
            message: "boom".to_string(),
        };
        // Rejections happen before the capability runs.
        for _ in 0..4 {
            events.emit(error(ErrorCode::ApprovalRejected));
        }
        events.emit(EventPayload::ExecutionComplete {
            request_id: "dry".to_string(),
            capability: "ai.call".to_string(),
            duration_ms: 0,
            executed: false,
        });
        for _ in 0..4 {
            events.emit(error(ErrorCode::CapabilityFailed));
        }

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event.payload {
            EventPayload::AlertRaised { alert } => {
                assert_eq!(alert.capability, "ai.call");
                assert_eq!(alert.kind, AlertKind::FailureRate);
                assert_eq!(alert.samples, 4);
                assert_eq!(alert.level, AlertLevel::Critical);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
