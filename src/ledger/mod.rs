//! # Execution Ledger
//!
//! Append-only, bounded record of every execution, with per-capability
//! summaries, ROI and export.
//!
//! The ledger is a FIFO: once `capacity` records are held, each append
//! evicts the oldest. Records are never mutated after append.

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::{EventBus, EventPayload};
use crate::executor::{ErrorCode, ExecutionMode};
use crate::registry::Version;

/// Success-rate change between window halves that decides the trend.
const TREND_SUCCESS_DELTA: f64 = 0.10;
/// Relative average-duration change that decides the trend otherwise.
const TREND_DURATION_DELTA: f64 = 0.10;
const EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Unknown export format: {0}")]
    UnknownFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Units and money spent by one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub units_used: f64,
    pub estimated_currency: f64,
    #[serde(default)]
    pub provider: Option<String>,
}

impl CostInfo {
    pub fn new(units_used: f64, estimated_currency: f64) -> Self {
        Self {
            units_used,
            estimated_currency,
            provider: None,
        }
    }

    /// Builder: set the provider.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub capability_name: String,
    /// `None` when resolution failed.
    pub capability_version: Option<Version>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// `None` when no approval was needed.
    pub approved: Option<bool>,
    pub mode: ExecutionMode,
    pub cost: Option<CostInfo>,
    pub triggered_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ExecutionRecord {
    /// A successful record completed now; adjust with struct update syntax.
    pub fn new(capability_name: impl Into<String>, duration_ms: u64, success: bool) -> Self {
        let completed_at = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            capability_name: capability_name.into(),
            capability_version: None,
            started_at: completed_at - ChronoDuration::milliseconds(duration_ms as i64),
            completed_at,
            duration_ms,
            success,
            error: None,
            error_code: None,
            approved: None,
            mode: ExecutionMode::Production,
            cost: None,
            triggered_by: "system".to_string(),
            tags: Vec::new(),
        }
    }
}

/// Direction of a capability's recent behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Summary of one capability over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMetrics {
    pub capability: String,
    pub window_days: u32,
    pub total_executions: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: u64,
    pub total_cost: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiReport {
    pub capability: String,
    pub executions: usize,
    pub hours_saved_per_execution: f64,
    pub hourly_rate: f64,
    pub value_generated: f64,
    pub total_cost: f64,
    pub roi_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub capacity: usize,
    pub retained: usize,
    pub total_recorded: u64,
    pub evicted: u64,
    pub successes: usize,
    pub failures: usize,
    pub by_capability: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(LedgerError::UnknownFormat(other.to_string())),
        }
    }
}

const CSV_HEADER: &str = "id,capability_name,capability_version,started_at,completed_at,\
duration_ms,success,error,error_code,approved,mode,units_used,estimated_currency,provider,\
triggered_by,tags";

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(r: &ExecutionRecord) -> String {
    let opt = |v: Option<String>| v.unwrap_or_default();
    let fields = [
        r.id.clone(),
        r.capability_name.clone(),
        opt(r.capability_version.map(|v| v.to_string())),
        r.started_at.to_rfc3339(),
        r.completed_at.to_rfc3339(),
        r.duration_ms.to_string(),
        r.success.to_string(),
        opt(r.error.clone()),
        opt(r.error_code.map(|c| c.as_str().to_string())),
        opt(r.approved.map(|a| a.to_string())),
        r.mode.as_str().to_string(),
        opt(r.cost.as_ref().map(|c| c.units_used.to_string())),
        opt(r.cost.as_ref().map(|c| c.estimated_currency.to_string())),
        opt(r.cost.as_ref().and_then(|c| c.provider.clone())),
        r.triggered_by.clone(),
        r.tags.join(";"),
    ];
    fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

fn success_rate(records: &[&ExecutionRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().filter(|r| r.success).count() as f64 / records.len() as f64
}

fn avg_duration(records: &[&ExecutionRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / records.len() as f64
}

/// Compare the older and newer halves of a chronologically ordered window.
fn trend(records: &[&ExecutionRecord]) -> Trend {
    if records.len() < 4 {
        return Trend::Stable;
    }
    let (older, newer) = records.split_at(records.len() / 2);

    let rate_delta = success_rate(newer) - success_rate(older);
    if rate_delta.abs() + EPSILON >= TREND_SUCCESS_DELTA {
        return if rate_delta > 0.0 {
            Trend::Improving
        } else {
            Trend::Degrading
        };
    }

    let before = avg_duration(older);
    if before <= 0.0 {
        return Trend::Stable;
    }
    let change = (avg_duration(newer) - before) / before;
    if change < -TREND_DURATION_DELTA {
        Trend::Improving
    } else if change > TREND_DURATION_DELTA {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

/// Earliest completion time inside a window of `days` ending at `now`.
/// Windows reaching past the representable range start at the minimum.
fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    ChronoDuration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The bounded ledger plus its analytics.
pub struct MetricsCollector {
    records: RwLock<VecDeque<ExecutionRecord>>,
    capacity: usize,
    total: AtomicU64,
    evicted: AtomicU64,
    events: Arc<EventBus>,
}

impl MetricsCollector {
    pub fn new(capacity: usize, events: Arc<EventBus>) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            events,
        }
    }

    /// Append a record, evicting the oldest if full.
    pub fn record(&self, record: ExecutionRecord) {
        let payload = EventPayload::LedgerEntry {
            record_id: record.id.clone(),
            capability: record.capability_name.clone(),
            success: record.success,
            duration_ms: record.duration_ms,
        };
        {
            let mut records = self.records.write();
            if records.len() == self.capacity {
                records.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            records.push_back(record);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.events.emit(payload);
    }

    /// Retained records, oldest first, optionally for one capability.
    pub fn records(&self, capability: Option<&str>) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| capability.map_or(true, |name| r.capability_name == name))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Summary of `capability` over the last `window_days` days.
    pub fn summary(&self, capability: &str, window_days: u32) -> SkillMetrics {
        let since = window_start(Utc::now(), window_days);
        let records = self.records.read();
        let mut window: Vec<&ExecutionRecord> = records
            .iter()
            .filter(|r| r.capability_name == capability && r.completed_at >= since)
            .collect();
        window.sort_by_key(|r| r.completed_at);

        let total = window.len();
        let successes = window.iter().filter(|r| r.success).count();
        let mut durations: Vec<u64> = window.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();
        let p95 = if durations.is_empty() {
            0
        } else {
            let index = ((0.95 * total as f64).ceil() as usize).saturating_sub(1);
            durations[index.min(total - 1)]
        };

        SkillMetrics {
            capability: capability.to_string(),
            window_days,
            total_executions: total,
            successes,
            failures: total - successes,
            success_rate: success_rate(&window),
            avg_duration_ms: avg_duration(&window),
            p95_duration_ms: p95,
            total_cost: window
                .iter()
                .filter_map(|r| r.cost.as_ref())
                .map(|c| c.estimated_currency)
                .sum(),
            trend: trend(&window),
        }
    }

    /// Return on investment across all retained records of `capability`.
    pub fn calculate_roi(&self, capability: &str, hours_saved: f64, hourly_rate: f64) -> RoiReport {
        let (executions, total_cost) = self
            .records
            .read()
            .iter()
            .filter(|r| r.capability_name == capability)
            .fold((0usize, 0.0f64), |(count, cost), r| {
                (
                    count + 1,
                    cost + r.cost.as_ref().map_or(0.0, |c| c.estimated_currency),
                )
            });
        let value_generated = executions as f64 * hours_saved * hourly_rate;
        RoiReport {
            capability: capability.to_string(),
            executions,
            hours_saved_per_execution: hours_saved,
            hourly_rate,
            value_generated,
            total_cost,
            roi_percent: (value_generated - total_cost) / total_cost.max(0.01) * 100.0,
        }
    }

    /// Render every retained record.
    pub fn export(&self, format: ExportFormat) -> Result<String, LedgerError> {
        let records = self.records.read();
        match format {
            ExportFormat::Json => {
                let all: Vec<&ExecutionRecord> = records.iter().collect();
                Ok(serde_json::to_string_pretty(&all)?)
            }
            ExportFormat::Csv => {
                let mut out = String::from(CSV_HEADER);
                out.push('\n');
                for record in records.iter() {
                    out.push_str(&csv_row(record));
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }

    pub fn stats(&self) -> LedgerStats {
        let records = self.records.read();
        let mut by_capability = BTreeMap::new();
        let mut successes = 0;
        for record in records.iter() {
            *by_capability
                .entry(record.capability_name.clone())
                .or_insert(0) += 1;
            if record.success {
                successes += 1;
            }
        }
        LedgerStats {
            capacity: self.capacity,
            retained: records.len(),
            total_recorded: self.total.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            successes,
            failures: records.len() - successes,
            by_capability,
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("capacity", &self.capacity)
            .field("retained", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTopic;

    fn collector(capacity: usize) -> MetricsCollector {
        MetricsCollector::new(capacity, Arc::new(EventBus::default()))
    }

    fn record(name: &str, duration_ms: u64, success: bool) -> ExecutionRecord {
        ExecutionRecord::new(name, duration_ms, success)
    }

    #[test]
    fn test_summary_avg_and_p95() {
        let ledger = collector(100);
        for _ in 0..9 {
            ledger.record(record("ai.call", 100, true));
        }
        ledger.record(record("ai.call", 1000, true));
        ledger.record(record("other", 5, false));

        let summary = ledger.summary("ai.call", 7);
        assert_eq!(summary.total_executions, 10);
        assert_eq!(summary.avg_duration_ms, 190.0);
        assert_eq!(summary.p95_duration_ms, 1000);
        assert_eq!(summary.success_rate, 1.0);
    }

    #[test]
    fn test_fifo_eviction() {
        let ledger = collector(3);
        let ids: Vec<String> = (0..5)
            .map(|i| {
                let r = record("x", i, true);
                let id = r.id.clone();
                ledger.record(r);
                id
            })
            .collect();

        let kept: Vec<String> = ledger.records(None).into_iter().map(|r| r.id).collect();
        assert_eq!(kept, ids[2..].to_vec());
        let stats = ledger.stats();
        assert_eq!(stats.retained, 3);
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.total_recorded, 5);
    }

    #[test]
    fn test_window_excludes_old_records() {
        let ledger = collector(10);
        let mut old = record("x", 10, true);
        old.completed_at = Utc::now() - ChronoDuration::days(10);
        ledger.record(old);
        ledger.record(record("x", 20, true));

        assert_eq!(ledger.summary("x", 7).total_executions, 1);
        assert_eq!(ledger.summary("x", 30).total_executions, 2);
        assert_eq!(ledger.summary("missing", 7).total_executions, 0);
    }

    #[test]
    fn test_unbounded_window_covers_everything() {
        let ledger = collector(10);
        let mut ancient = record("x", 10, true);
        ancient.completed_at = Utc::now() - ChronoDuration::days(365 * 100);
        ledger.record(ancient);
        ledger.record(record("x", 20, true));

        let summary = ledger.summary("x", u32::MAX);
        assert_eq!(summary.window_days, u32::MAX);
        assert_eq!(summary.total_executions, 2);
        assert_eq!(window_start(Utc::now(), u32::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_trend() {
        let ledger = collector(50);
        for i in 0..8 {
            ledger.record(record("flaky", 100, i >= 4));
        }
        assert_eq!(ledger.summary("flaky", 1).trend, Trend::Improving);

        for i in 0..8 {
            ledger.record(record("slowing", if i < 4 { 100 } else { 200 }, true));
        }
        assert_eq!(ledger.summary("slowing", 1).trend, Trend::Degrading);

        for _ in 0..3 {
            ledger.record(record("new", 100, false));
        }
        assert_eq!(ledger.summary("new", 1).trend, Trend::Stable);
    }

    #[test]
    fn test_roi() {
        let ledger = collector(10);
        for _ in 0..4 {
            let mut r = record("report.build", 50, true);
            r.cost = Some(CostInfo::new(1000.0, 0.5).with_provider("openai"));
            ledger.record(r);
        }
        let roi = ledger.calculate_roi("report.build", 0.5, 40.0);
        assert_eq!(roi.executions, 4);
        assert_eq!(roi.value_generated, 80.0);
        assert_eq!(roi.total_cost, 2.0);
        assert_eq!(roi.roi_percent, 3900.0);

        let free = ledger.calculate_roi("missing", 1.0, 10.0);
        assert_eq!(free.roi_percent, 0.0);
    }

    #[test]
    fn test_export_formats() {
        let ledger = collector(10);
        let mut r = record("msg.send", 12, false);
        r.error = Some("bad \"recipient\", retry".to_string());
        r.tags = vec!["degraded".to_string(), "batch".to_string()];
        ledger.record(r);

        let csv = ledger.export(ExportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].contains("\"bad \"\"recipient\"\", retry\""));
        assert!(lines[1].ends_with("degraded;batch"));

        let json: serde_json::Value =
            serde_json::from_str(&ledger.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["capability_name"], "msg.send");

        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(LedgerError::UnknownFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_record_emits_event() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe(EventTopic::MetricRecorded);
        let ledger = MetricsCollector::new(10, events);
        ledger.record(record("x", 5, true));

        match rx.recv().await.unwrap().payload {
            EventPayload::LedgerEntry {
                capability,
                success,
                ..
            } => {
                assert_eq!(capability, "x");
                assert!(success);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
