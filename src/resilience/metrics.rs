//! Bounded per-name metric history.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, EventPayload};

/// One recorded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over the retained history of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub last: f64,
}

pub struct MetricStream {
    history_size: usize,
    series: DashMap<String, VecDeque<MetricSample>>,
    events: Arc<EventBus>,
}

impl MetricStream {
    pub fn new(history_size: usize, events: Arc<EventBus>) -> Self {
        Self {
            history_size: history_size.max(1),
            series: DashMap::new(),
            events,
        }
    }

    /// Append a point, dropping the oldest when the history is full.
    pub fn record(&self, name: &str, value: f64) {
        {
            let mut series = self.series.entry(name.to_string()).or_default();
            if series.len() == self.history_size {
                series.pop_front();
            }
            series.push_back(MetricSample {
                value,
                timestamp: Utc::now(),
            });
        }
        self.events.emit(EventPayload::MetricPoint {
            metric: name.to_string(),
            value,
        });
    }

    pub fn latest(&self, name: &str) -> Option<MetricSample> {
        self.series.get(name).and_then(|s| s.back().cloned())
    }

    /// Retained points, oldest first.
    pub fn history(&self, name: &str) -> Vec<MetricSample> {
        self.series
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn aggregate(&self, name: &str) -> Option<MetricAggregate> {
        let series = self.series.get(name)?;
        let last = series.back()?.value;
        let (min, max, sum) = series.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), s| (min.min(s.value), max.max(s.value), sum + s.value),
        );
        Some(MetricAggregate {
            count: series.len(),
            min,
            max,
            mean: sum / series.len() as f64,
            last,
        })
    }

    /// Metric names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.series.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
