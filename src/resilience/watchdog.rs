//! Heartbeat watchdog.
//!
//! A monitored process calls [`Watchdog::heartbeat`]. A background task
//! started with [`Watchdog::start`] runs [`Watchdog::check`] every
//! `heartbeat_interval_ms`; each check that finds the last heartbeat older
//! than one interval counts a miss and emits `watchdog:alert`.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::WatchdogConfig;
use crate::events::{EventBus, EventPayload, WatchdogAlertKind};

struct HeartbeatState {
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
    missed_heartbeats: u32,
    /// `unresponsive` already emitted for the current episode.
    alerted: bool,
}

/// Health snapshot of one watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub name: String,
    pub healthy: bool,
    pub missed_heartbeats: u32,
    pub max_missed_heartbeats: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub running: bool,
}

pub struct Watchdog {
    name: String,
    config: WatchdogConfig,
    state: Mutex<HeartbeatState>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventBus>,
}

impl Watchdog {
    pub fn new(name: impl Into<String>, config: WatchdogConfig, events: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(HeartbeatState {
                last_heartbeat: Instant::now(),
                last_heartbeat_at: Utc::now(),
                missed_heartbeats: 0,
                alerted: false,
            }),
            task: Mutex::new(None),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the periodic check. Calling `start` on a running watchdog is a no-op.
    ///
    /// The task holds only a weak reference and exits once the watchdog is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let period = self.config.heartbeat_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(watchdog) => {
                        watchdog.check();
                    }
                    None => break,
                }
            }
        }));
        log::debug!(
            "[Watchdog] '{}' started ({}ms interval)",
            self.name,
            self.config.heartbeat_interval_ms
        );
    }

    /// Cancel the periodic check.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            log::debug!("[Watchdog] '{}' stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Record a heartbeat, ending any unresponsive episode.
    pub fn heartbeat(&self) {
        let mut state = self.state.lock();
        if state.missed_heartbeats > 0 {
            log::info!(
                "[Watchdog] '{}' recovered after {} missed heartbeats",
                self.name,
                state.missed_heartbeats
            );
        }
        state.last_heartbeat = Instant::now();
        state.last_heartbeat_at = Utc::now();
        state.missed_heartbeats = 0;
        state.alerted = false;
    }

    /// Run one check. Returns the miss counter after the check.
    pub fn check(&self) -> u32 {
        let mut alerts = Vec::new();
        let missed = {
            let mut state = self.state.lock();
            if state.last_heartbeat.elapsed() > self.config.heartbeat_interval() {
                state.missed_heartbeats = state.missed_heartbeats.saturating_add(1);
                alerts.push(WatchdogAlertKind::HeartbeatMissed);
                if state.missed_heartbeats >= self.config.max_missed_heartbeats && !state.alerted {
                    state.alerted = true;
                    alerts.push(WatchdogAlertKind::Unresponsive);
                }
            }
            state.missed_heartbeats
        };

        for alert in alerts {
            match alert {
                WatchdogAlertKind::Unresponsive => log::error!(
                    "[Watchdog] '{}' unresponsive ({} missed heartbeats)",
                    self.name,
                    missed
                ),
                WatchdogAlertKind::HeartbeatMissed => {
                    log::warn!("[Watchdog] '{}' missed heartbeat #{}", self.name, missed)
                }
            }
            self.events.emit(EventPayload::WatchdogAlert {
                process: self.name.clone(),
                alert,
                missed_heartbeats: missed,
            });
        }
        missed
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.state.lock().missed_heartbeats
    }

    pub fn is_healthy(&self) -> bool {
        self.missed_heartbeats() < self.config.max_missed_heartbeats
    }

    pub fn status(&self) -> WatchdogStatus {
        let (missed, last) = {
            let state = self.state.lock();
            (state.missed_heartbeats, state.last_heartbeat_at)
        };
        WatchdogStatus {
            name: self.name.clone(),
            healthy: missed < self.config.max_missed_heartbeats,
            missed_heartbeats: missed,
            max_missed_heartbeats: self.config.max_missed_heartbeats,
            last_heartbeat: last,
            running: self.is_running(),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Watchdogs keyed by monitored-process name.
pub struct WatchdogRegistry {
    watchdogs: DashMap<String, Arc<Watchdog>>,
    config: WatchdogConfig,
    events: Arc<EventBus>,
}

impl WatchdogRegistry {
    pub fn new(config: WatchdogConfig, events: Arc<EventBus>) -> Self {
        Self {
            watchdogs: DashMap::new(),
            config,
            events,
        }
    }

    /// The watchdog for `name`, created (not started) if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<Watchdog> {
        self.watchdogs
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Watchdog::new(name, self.config.clone(), self.events.clone()))
            })
            .clone()
    }

    /// Create and start a watchdog for `name` if watchdogs are enabled.
    pub fn watch(&self, name: &str) -> Arc<Watchdog> {
        let watchdog = self.get_or_create(name);
        if self.config.enabled {
            watchdog.start();
        }
        watchdog
    }

    /// Heartbeat for `name`. Returns false for an unknown process.
    pub fn heartbeat(&self, name: &str) -> bool {
        match self.watchdogs.get(name) {
            Some(watchdog) => {
                watchdog.heartbeat();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for watchdog in self.watchdogs.iter() {
            watchdog.stop();
        }
    }

    /// Status of every watchdog, sorted by name.
    pub fn statuses(&self) -> Vec<WatchdogStatus> {
        let mut statuses: Vec<_> = self.watchdogs.iter().map(|w| w.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}
