use super::alerts::AlertEngine;
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Descriptive key/value pairs attached to a metric
pub type Labels = HashMap<String, String>;

/// Metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// A single named metric with bounded history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricData {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    /// Oldest first, at most `max_history` entries
    pub history: VecDeque<f64>,
}

impl MetricData {
    fn new(name: &str, kind: MetricKind, max_history: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value: 0.0,
            labels: Labels::new(),
            timestamp: Utc::now(),
            history: VecDeque::with_capacity(max_history),
        }
    }

    fn write(&mut self, value: f64, labels: Labels, max_history: usize) {
        self.value = value;
        if !labels.is_empty() {
            self.labels = labels;
        }
        self.timestamp = Utc::now();

        while self.history.len() >= max_history {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }

    /// Arithmetic mean over the retained history
    pub fn mean(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
    }
}

/// Concurrency-safe table of named metrics
///
/// A single exclusive lock guards the table. Gauge writes evaluate the alert
/// rules before the lock is released, so alerts are observed in write order.
pub struct MetricStore {
    metrics: Mutex<HashMap<String, MetricData>>,
    max_history: usize,
    engine: Arc<AlertEngine>,
    clock: Arc<dyn Clock>,
}

impl MetricStore {
    /// Create a new metric store feeding gauge writes into `engine`
    pub fn new(max_history: usize, engine: Arc<AlertEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            max_history: max_history.max(1),
            engine,
            clock,
        }
    }

    /// Set a gauge value and evaluate alert rules targeting it
    pub fn record_gauge(&self, name: &str, value: f64, labels: Labels) {
        let mut metrics = self.metrics.lock();
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| MetricData::new(name, MetricKind::Gauge, self.max_history));

        if metric.kind != MetricKind::Gauge {
            warn!("gauge write to counter metric name={} value={}", name, value);
        }
        metric.write(value, labels, self.max_history);

        self.engine.evaluate(name, value, self.clock.now());
    }

    /// Increment a counter by one
    pub fn increment_counter(&self, name: &str, labels: Labels) {
        let mut metrics = self.metrics.lock();
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| MetricData::new(name, MetricKind::Counter, self.max_history));

        if metric.kind != MetricKind::Counter {
            warn!("counter increment on gauge metric name={}", name);
        }
        let next = metric.value + 1.0;
        metric.write(next, labels, self.max_history);
    }

    /// Deep copy of every metric, consistent at the instant the lock is taken
    pub fn snapshot(&self) -> HashMap<String, MetricData> {
        self.metrics.lock().clone()
    }

    /// Copy of a single metric
    pub fn get(&self, name: &str) -> Option<MetricData> {
        self.metrics.lock().get(name).cloned()
    }

    /// Number of distinct metric names
    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }
}
