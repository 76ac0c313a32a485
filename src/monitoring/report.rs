use super::alerts::{Alert, AlertEngine};
use super::dispatcher::AlertHistory;
use super::metrics::{MetricData, MetricStore};
use super::sampler::gauges;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;

/// Latest resident memory (MB) above which a leak investigation is suggested
pub const MEMORY_RECOMMENDATION_MB: f64 = 512.0;
/// Live task count above which a task leak investigation is suggested
pub const LIVE_TASKS_RECOMMENDATION: f64 = 500.0;
/// Process CPU percentage above which profiling is suggested
pub const CPU_RECOMMENDATION_PERCENT: f64 = 80.0;

/// Aggregates over one metric's retained history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
    pub samples: usize,
}

impl MetricSummary {
    /// `None` for a metric with no history
    pub fn from_metric(metric: &MetricData) -> Option<Self> {
        let mean = metric.mean()?;
        let min = metric.history.iter().copied().fold(f64::INFINITY, f64::min);
        let max = metric
            .history
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            mean,
            min,
            max,
            latest: metric.value,
            samples: metric.history.len(),
        })
    }
}

/// Static host facts plus current runtime counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub os_version: Option<String>,
    pub host_name: Option<String>,
    pub cpu_cores: usize,
    pub physical_cores: Option<usize>,
    pub total_memory_mb: f64,
    pub monitor_uptime_secs: u64,
    pub live_tasks: Option<usize>,
    pub runtime_workers: Option<usize>,
    pub dropped_alerts: u64,
}

/// Point-in-time performance report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub time_range: String,
    pub summary: BTreeMap<String, MetricSummary>,
    pub metrics: HashMap<String, MetricData>,
    pub recent_alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
    pub system_info: SystemInfo,
}

impl PerformanceReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone)]
struct HostFacts {
    os_version: Option<String>,
    host_name: Option<String>,
    cpu_cores: usize,
    physical_cores: Option<usize>,
    total_memory_mb: f64,
}

impl HostFacts {
    fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            os_version: System::long_os_version(),
            host_name: System::host_name(),
            cpu_cores,
            physical_cores: System::physical_core_count(),
            total_memory_mb: system.total_memory() as f64 / (1024.0 * 1024.0),
        }
    }
}

/// Builds reports from a snapshot of the store and the alert history
pub struct ReportGenerator {
    store: Arc<MetricStore>,
    engine: Arc<AlertEngine>,
    history: Arc<AlertHistory>,
    started_at: Instant,
    recent_alert_limit: usize,
    host: HostFacts,
}

impl ReportGenerator {
    pub fn new(
        store: Arc<MetricStore>,
        engine: Arc<AlertEngine>,
        history: Arc<AlertHistory>,
        recent_alert_limit: usize,
    ) -> Self {
        Self {
            store,
            engine,
            history,
            started_at: Instant::now(),
            recent_alert_limit,
            host: HostFacts::collect(),
        }
    }

    /// Generate a report. Reads only; nothing in the store or engine changes.
    pub fn generate(&self, time_range: &str) -> PerformanceReport {
        let metrics = self.store.snapshot();
        let dropped_alerts = self.engine.dropped();

        let summary = metrics
            .iter()
            .filter_map(|(name, metric)| {
                MetricSummary::from_metric(metric).map(|s| (name.clone(), s))
            })
            .collect();

        let recommendations = recommendations(&metrics, dropped_alerts);
        let system_info = self.system_info(dropped_alerts);

        PerformanceReport {
            generated_at: Utc::now(),
            time_range: time_range.to_string(),
            summary,
            recent_alerts: self.history.recent(self.recent_alert_limit),
            metrics,
            recommendations,
            system_info,
        }
    }

    fn system_info(&self, dropped_alerts: u64) -> SystemInfo {
        let (live_tasks, runtime_workers) = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let metrics = handle.metrics();
                (Some(metrics.num_alive_tasks()), Some(metrics.num_workers()))
            }
            Err(_) => (None, None),
        };

        SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_version: self.host.os_version.clone(),
            host_name: self.host.host_name.clone(),
            cpu_cores: self.host.cpu_cores,
            physical_cores: self.host.physical_cores,
            total_memory_mb: self.host.total_memory_mb,
            monitor_uptime_secs: self.started_at.elapsed().as_secs(),
            live_tasks,
            runtime_workers,
            dropped_alerts,
        }
    }
}

/// Heuristic advice derived from the latest metric values.
/// Every check runs; several recommendations may apply at once.
pub fn recommendations(metrics: &HashMap<String, MetricData>, dropped_alerts: u64) -> Vec<String> {
    let latest = |name: &str| metrics.get(name).map(|m| m.value);
    let mut advice = Vec::new();

    if let Some(memory) = latest(gauges::MEMORY_USAGE_MB) {
        if memory > MEMORY_RECOMMENDATION_MB {
            advice.push(format!(
                "Memory usage is {:.0} MB (above {:.0} MB); investigate possible memory leaks and oversized caches",
                memory, MEMORY_RECOMMENDATION_MB
            ));
        }
    }

    if let Some(tasks) = latest(gauges::LIVE_TASKS) {
        if tasks > LIVE_TASKS_RECOMMENDATION {
            advice.push(format!(
                "{:.0} live tasks (above {:.0}); look for leaked tasks that never complete",
                tasks, LIVE_TASKS_RECOMMENDATION
            ));
        }
    }

    if let Some(cpu) = latest(gauges::PROCESS_CPU_PERCENT) {
        if cpu > CPU_RECOMMENDATION_PERCENT {
            advice.push(format!(
                "Process CPU usage is {:.1}% (above {:.0}%); profile hot paths",
                cpu, CPU_RECOMMENDATION_PERCENT
            ));
        }
    }

    if dropped_alerts > 0 {
        advice.push(format!(
            "{} alerts were dropped on a full queue; raise alert_queue_capacity or speed up notifiers",
            dropped_alerts
        ));
    }

    advice
}
