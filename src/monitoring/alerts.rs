use super::metrics::Labels;
use crate::config::{duration_ms, option_duration_ms};
use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Comparison applied between a gauge value and a rule threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Condition {
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    /// Equal within the engine's epsilon
    Equal,
}

impl Condition {
    /// Whether `value` satisfies the condition against `threshold`
    pub fn is_met(self, value: f64, threshold: f64, epsilon: f64) -> bool {
        match self {
            Condition::GreaterThan => value > threshold,
            Condition::LessThan => value < threshold,
            Condition::GreaterOrEqual => value >= threshold,
            Condition::LessOrEqual => value <= threshold,
            Condition::Equal => (value - threshold).abs() <= epsilon,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Condition::GreaterThan => ">",
            Condition::LessThan => "<",
            Condition::GreaterOrEqual => ">=",
            Condition::LessOrEqual => "<=",
            Condition::Equal => "==",
        }
    }
}

impl FromStr for Condition {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            ">" => Ok(Condition::GreaterThan),
            "<" => Ok(Condition::LessThan),
            ">=" => Ok(Condition::GreaterOrEqual),
            "<=" => Ok(Condition::LessOrEqual),
            "==" => Ok(Condition::Equal),
            other => Err(MonitorError::UnknownCondition(other.to_string())),
        }
    }
}

impl TryFrom<String> for Condition {
    type Error = MonitorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.as_str().to_string()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, carried by each rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// Log level used when the alert is dispatched
    pub fn log_level(self) -> log::Level {
        match self {
            AlertSeverity::Low => log::Level::Info,
            AlertSeverity::Medium => log::Level::Warn,
            AlertSeverity::High | AlertSeverity::Critical => log::Level::Error,
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        match name.to_ascii_lowercase().as_str() {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            _ => Err(MonitorError::UnknownSeverity(name.to_string())),
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Threshold rule evaluated against gauge writes
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub condition: Condition,
    pub threshold: f64,
    pub severity: AlertSeverity,
    /// Minimum time between two firings
    pub cool_down: Duration,
    /// How long the condition must hold before the rule fires
    pub for_duration: Option<Duration>,
    pub enabled: bool,
    /// Copied onto every alert the rule produces
    pub labels: Labels,
    last_fired: Option<Instant>,
    violation_since: Option<Instant>,
}

impl AlertRule {
    /// Create an enabled rule with a one minute cooldown
    pub fn new(
        name: impl Into<String>,
        metric_name: impl Into<String>,
        condition: Condition,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            name: name.into(),
            metric_name: metric_name.into(),
            condition,
            threshold,
            severity,
            cool_down: Duration::from_secs(60),
            for_duration: None,
            enabled: true,
            labels: Labels::new(),
            last_fired: None,
            violation_since: None,
        }
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    pub fn with_for_duration(mut self, for_duration: Duration) -> Self {
        self.for_duration = Some(for_duration);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// When the rule last fired, if ever
    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| MonitorError::InvalidRule {
            rule: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.metric_name.trim().is_empty() {
            return Err(invalid("metric name must not be empty"));
        }
        if !self.threshold.is_finite() {
            return Err(invalid("threshold must be finite"));
        }
        Ok(())
    }

    fn in_cool_down(&self, now: Instant) -> bool {
        match self.last_fired {
            Some(fired) => now.saturating_duration_since(fired) < self.cool_down,
            None => false,
        }
    }

    /// Apply the sustain window. Returns true once the condition has held long enough.
    fn sustained(&mut self, triggered: bool, now: Instant) -> bool {
        if !triggered {
            self.violation_since = None;
            return false;
        }
        match self.for_duration {
            None => true,
            Some(required) => {
                let since = *self.violation_since.get_or_insert(now);
                now.saturating_duration_since(since) >= required
            }
        }
    }
}

/// Rule definition as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub metric_name: String,
    pub condition: String,
    pub threshold: f64,
    pub severity: String,
    #[serde(rename = "cool_down_ms", with = "duration_ms", default = "default_cool_down")]
    pub cool_down: Duration,
    #[serde(rename = "for_ms", with = "option_duration_ms", default)]
    pub for_duration: Option<Duration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub labels: Labels,
}

fn default_cool_down() -> Duration {
    Duration::from_secs(60)
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<AlertRuleConfig> for AlertRule {
    type Error = MonitorError;

    fn try_from(config: AlertRuleConfig) -> Result<Self> {
        let condition: Condition = config.condition.parse()?;
        let severity: AlertSeverity = config.severity.parse()?;

        let mut rule = AlertRule::new(
            config.name,
            config.metric_name,
            condition,
            config.threshold,
            severity,
        )
        .with_cool_down(config.cool_down);
        rule.for_duration = config.for_duration;
        rule.enabled = config.enabled;
        rule.labels = config.labels;
        Ok(rule)
    }
}

/// An alert produced by a rule trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_name: String,
    pub metric_name: String,
    pub value: f64,
    pub threshold: f64,
    pub condition: Condition,
    pub severity: AlertSeverity,
    pub message: String,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    fn from_rule(rule: &AlertRule, value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            metric_name: rule.metric_name.clone(),
            value,
            threshold: rule.threshold,
            condition: rule.condition,
            severity: rule.severity,
            message: format!(
                "{}: {} is {:.2} ({} {:.2})",
                rule.name, rule.metric_name, value, rule.condition, rule.threshold
            ),
            labels: rule.labels.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Evaluates gauge writes against registered rules
///
/// Triggered alerts go onto a bounded queue with drop-on-full semantics, so
/// evaluation never waits on the consumer.
pub struct AlertEngine {
    rules: Mutex<Vec<AlertRule>>,
    sender: Mutex<mpsc::Sender<Alert>>,
    capacity: usize,
    epsilon: f64,
    dropped: AtomicU64,
}

impl AlertEngine {
    /// Create an engine and the receiving end of its alert queue
    pub fn new(capacity: usize, epsilon: f64) -> (Self, mpsc::Receiver<Alert>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let engine = Self {
            rules: Mutex::new(Vec::new()),
            sender: Mutex::new(tx),
            capacity,
            epsilon,
            dropped: AtomicU64::new(0),
        };
        (engine, rx)
    }

    /// Register a rule. Names must be unique.
    pub fn register(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;

        let mut rules = self.rules.lock();
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(MonitorError::DuplicateRule(rule.name));
        }
        debug!(
            "registered alert rule name={} metric={} condition={} threshold={} severity={}",
            rule.name, rule.metric_name, rule.condition, rule.threshold, rule.severity
        );
        rules.push(rule);
        Ok(())
    }

    /// Enable or disable a registered rule
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| MonitorError::RuleNotFound(name.to_string()))?;
        rule.enabled = enabled;
        if !enabled {
            rule.violation_since = None;
        }
        Ok(())
    }

    /// Copy of all registered rules, in registration order
    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.lock().clone()
    }

    /// Evaluate every enabled rule targeting `metric_name`
    pub fn evaluate(&self, metric_name: &str, value: f64, now: Instant) {
        let mut rules = self.rules.lock();

        for rule in rules
            .iter_mut()
            .filter(|r| r.enabled && r.metric_name == metric_name)
        {
            if rule.in_cool_down(now) {
                continue;
            }

            let triggered = rule.condition.is_met(value, rule.threshold, self.epsilon);
            if !rule.sustained(triggered, now) {
                continue;
            }

            self.enqueue(Alert::from_rule(rule, value));

            // Cooldown starts even if the alert was dropped
            rule.last_fired = Some(now);
            rule.violation_since = None;
        }
    }

    fn enqueue(&self, alert: Alert) {
        let sender = self.sender.lock();
        match sender.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "alert queue full, dropping alert rule={} metric={} value={}",
                    alert.rule_name, alert.metric_name, alert.value
                );
            }
            Err(TrySendError::Closed(alert)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "alert queue closed, dropping alert rule={} metric={}",
                    alert.rule_name, alert.metric_name
                );
            }
        }
    }

    /// Replace the alert queue, returning the new receiver
    pub(crate) fn reset_queue(&self) -> mpsc::Receiver<Alert> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.sender.lock() = tx;
        rx
    }

    /// Alerts dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }
}
