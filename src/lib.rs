pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitoring;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MonitorConfig;
pub use error::{MonitorError, NotifyError, ProbeError, Result};
pub use logging::init_logging;
pub use monitoring::{
    Alert, AlertNotifier, AlertRule, AlertRuleConfig, AlertSeverity, Condition, HealthCheckResult,
    HealthStatus, Labels, MetricData, MetricKind, Monitor, PerformanceReport, ShutdownOutcome,
};
