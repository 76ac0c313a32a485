use log::{error, info, LevelFilter};
use perf_monitor::{
    init_logging, AlertRule, AlertSeverity, Condition, Labels, Monitor, MonitorConfig,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn load_config() -> Result<MonitorConfig, Box<dyn std::error::Error + Send + Sync>> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!("loading monitor configuration from {}", path);
            Ok(MonitorConfig::from_json_file(path)?)
        }
        None => Ok(MonitorConfig {
            sample_interval: Duration::from_secs(1),
            ..MonitorConfig::default()
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LevelFilter::Info)?;

    let config = load_config()?;
    let monitor = Arc::new(Monitor::new(config)?);

    monitor.register_alert_rule(
        AlertRule::new(
            "SlowRequests",
            "request_latency_ms",
            Condition::GreaterThan,
            250.0,
            AlertSeverity::Medium,
        )
        .with_cool_down(Duration::from_secs(2)),
    )?;
    monitor.register_notify_hook(|alert| {
        println!("notify: [{}] {}", alert.severity, alert.message);
    });

    monitor.start().await?;

    let mut labels = Labels::new();
    labels.insert("endpoint".to_string(), "/orders".to_string());
    for latency in [120.0, 180.0, 320.0, 410.0, 90.0] {
        monitor.record_gauge("request_latency_ms", latency, labels.clone());
        monitor.increment_counter("requests_total", labels.clone());
        sleep(Duration::from_millis(300)).await;
    }

    sleep(Duration::from_secs(2)).await;

    let report = monitor.generate_report("demo");
    match report.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => error!("failed to encode report: {}", e),
    }

    let health = monitor.health();
    info!("health status={:?} message={}", health.status, health.message);

    let outcome = monitor.stop().await;
    info!("shutdown outcome={:?}", outcome);
    Ok(())
}
