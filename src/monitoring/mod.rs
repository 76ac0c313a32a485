//! Metrics collection, threshold alerting and reporting
pub mod alerts;
pub mod dispatcher;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod notifier;
pub mod report;
pub mod sampler;

pub use alerts::{Alert, AlertEngine, AlertRule, AlertRuleConfig, AlertSeverity, Condition};
pub use dispatcher::{AlertDispatcher, AlertHistory};
pub use health::{ComponentHealth, HealthCheckResult, HealthStatus};
pub use metrics::{Labels, MetricData, MetricKind, MetricStore};
pub use monitor::{Monitor, ShutdownOutcome};
pub use notifier::{AlertNotifier, FnNotifier, WebhookConfig, WebhookNotifier};
pub use report::{MetricSummary, PerformanceReport, ReportGenerator, SystemInfo};
pub use sampler::{gauges, RuntimeProbe, RuntimeSample, SamplerStats, SysinfoProbe, SystemSampler};
