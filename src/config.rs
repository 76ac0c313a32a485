use crate::error::{MonitorError, Result};
use crate::monitoring::alerts::AlertRuleConfig;
use crate::monitoring::notifier::WebhookConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Monitor configuration
///
/// Every field has a default, so a JSON document only needs to name the
/// values it overrides. Durations are written as milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Number of samples kept per metric
    pub max_history: usize,
    /// Capacity of the bounded alert queue
    pub alert_queue_capacity: usize,
    /// Number of dispatched alerts kept for reports
    pub recent_alert_capacity: usize,
    /// Interval between system samples
    #[serde(rename = "sample_interval_ms", with = "duration_ms")]
    pub sample_interval: Duration,
    /// Upper bound on a single notifier call
    #[serde(rename = "notify_timeout_ms", with = "duration_ms")]
    pub notify_timeout: Duration,
    /// Default deadline used by `Monitor::stop`
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Tolerance used by the `==` condition
    pub equality_epsilon: f64,
    /// Whether `start()` launches the system sampler
    pub enable_sampler: bool,
    /// Rules registered at construction
    pub rules: Vec<AlertRuleConfig>,
    /// Optional webhook notifier registered at construction
    pub webhook: Option<WebhookConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            alert_queue_capacity: 100,
            recent_alert_capacity: 100,
            sample_interval: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            equality_epsilon: 1e-9,
            enable_sampler: true,
            rules: Vec::new(),
            webhook: None,
        }
    }
}

impl MonitorConfig {
    /// Parse a configuration from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MonitorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject values the monitor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_history == 0 {
            return Err(MonitorError::InvalidConfig(
                "max_history must be at least 1".to_string(),
            ));
        }
        if self.alert_queue_capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "alert_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "sample_interval must be non-zero".to_string(),
            ));
        }
        if self.notify_timeout.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "notify_timeout must be non-zero".to_string(),
            ));
        }
        if !self.equality_epsilon.is_finite() || self.equality_epsilon < 0.0 {
            return Err(MonitorError::InvalidConfig(format!(
                "equality_epsilon must be a non-negative finite number, got {}",
                self.equality_epsilon
            )));
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as `duration_ms` for optional durations
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
