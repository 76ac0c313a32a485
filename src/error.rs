use std::time::Duration;
use thiserror::Error;

/// Errors surfaced synchronously by the monitor's public API
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("unknown alert condition operator: {0:?}")]
    UnknownCondition(String),

    #[error("unknown alert severity: {0:?}")]
    UnknownSeverity(String),

    #[error("invalid alert rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("alert rule {0} is already registered")]
    DuplicateRule(String),

    #[error("alert rule {0} is not registered")]
    RuleNotFound(String),

    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("monitor workers require a running tokio runtime")]
    NoRuntime,
}

/// Errors returned by alert notifiers
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),

    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notifier rejected alert: {0}")]
    Rejected(String),

    #[error("notification task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors raised while reading host runtime facts
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot resolve current process: {0}")]
    ProcessUnavailable(String),

    #[error("sampling panicked: {0}")]
    Panicked(String),

    #[error("runtime probe is no longer available")]
    Unavailable,
}
