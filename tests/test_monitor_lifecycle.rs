//! Lifecycle, sampling and concurrency behaviour of the monitor

use async_trait::async_trait;
use perf_monitor::monitoring::{gauges, AlertNotifier, RuntimeProbe, RuntimeSample};
use perf_monitor::{
    Alert, AlertRule, AlertSeverity, Condition, HealthStatus, Labels, Monitor, MonitorConfig,
    NotifyError, ProbeError, ShutdownOutcome, SystemClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Probe returning fixed values and counting calls
struct CountingProbe {
    calls: Arc<AtomicUsize>,
    resident_mb: u64,
}

impl RuntimeProbe for CountingProbe {
    fn sample(&mut self) -> Result<RuntimeSample, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RuntimeSample {
            resident_memory_bytes: self.resident_mb * 1024 * 1024,
            virtual_memory_bytes: 2 * self.resident_mb * 1024 * 1024,
            process_cpu_percent: 5.0,
            system_memory_used_bytes: 1024 * 1024 * 1024,
            live_tasks: Some(3),
            runtime_workers: Some(1),
        })
    }
}

/// Probe that blocks its thread for a while before answering
struct SlowProbe {
    delay: Duration,
}

impl RuntimeProbe for SlowProbe {
    fn sample(&mut self) -> Result<RuntimeSample, ProbeError> {
        thread::sleep(self.delay);
        Ok(RuntimeSample {
            resident_memory_bytes: 64 * 1024 * 1024,
            ..RuntimeSample::default()
        })
    }
}

struct HangingNotifier;

#[async_trait]
impl AlertNotifier for HangingNotifier {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn notify(&self, _alert: &Alert) -> Result<(), NotifyError> {
        sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

fn sampling_monitor(calls: Arc<AtomicUsize>, resident_mb: u64) -> Monitor {
    let config = MonitorConfig {
        sample_interval: Duration::from_millis(20),
        ..MonitorConfig::default()
    };
    Monitor::with_components(
        config,
        Arc::new(SystemClock),
        Box::new(CountingProbe { calls, resident_mb }),
    )
    .unwrap()
}

#[tokio::test]
async fn test_no_sampling_after_stop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let monitor = sampling_monitor(calls.clone(), 128);

    monitor.start().await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(monitor.stop().await, ShutdownOutcome::Graceful);

    let calls_at_stop = calls.load(Ordering::SeqCst);
    let history_at_stop = monitor.snapshot()[gauges::MEMORY_USAGE_MB].history.len();
    assert!(calls_at_stop >= 2);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), calls_at_stop);
    assert_eq!(
        monitor.snapshot()[gauges::MEMORY_USAGE_MB].history.len(),
        history_at_stop
    );
}

#[tokio::test]
async fn test_sampler_restarts_with_same_probe() {
    let calls = Arc::new(AtomicUsize::new(0));
    let monitor = sampling_monitor(calls.clone(), 64);

    monitor.start().await.unwrap();
    sleep(Duration::from_millis(60)).await;
    monitor.stop().await;
    let first_run = calls.load(Ordering::SeqCst);

    monitor.start().await.unwrap();
    sleep(Duration::from_millis(60)).await;
    monitor.stop().await;

    assert!(calls.load(Ordering::SeqCst) > first_run);
    assert_eq!(monitor.snapshot()[gauges::MEMORY_USAGE_MB].value, 64.0);
}

#[tokio::test]
async fn test_sampled_gauges_feed_rules_and_report() {
    let calls = Arc::new(AtomicUsize::new(0));
    let monitor = sampling_monitor(calls, 600);
    monitor
        .register_alert_rule(AlertRule::new(
            "HighMem",
            gauges::MEMORY_USAGE_MB,
            Condition::GreaterThan,
            500.0,
            AlertSeverity::Critical,
        ))
        .unwrap();

    let mut alerts = monitor.subscribe();
    monitor.start().await.unwrap();
    let alert = timeout(Duration::from_secs(1), alerts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.rule_name, "HighMem");

    let report = monitor.generate_report("last_minute");
    monitor.stop().await;

    assert_eq!(report.summary[gauges::MEMORY_USAGE_MB].mean, 600.0);
    assert_eq!(report.summary[gauges::LIVE_TASKS].latest, 3.0);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("memory leaks")));
    assert_eq!(report.recent_alerts.len(), 1);
    assert!(report.system_info.runtime_workers.is_some());
}

#[test]
fn test_concurrent_increments_are_exact() {
    let monitor = Monitor::new(MonitorConfig {
        enable_sampler: false,
        ..MonitorConfig::default()
    })
    .unwrap();

    let threads = 32;
    let per_thread = 250;
    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                for _ in 0..per_thread {
                    monitor.increment_counter("hits", Labels::new());
                }
            });
        }
    });

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot["hits"].value, (threads * per_thread) as f64);
    assert!(snapshot["hits"].history.len() <= monitor.config().max_history);
}

#[tokio::test]
async fn test_hanging_notifier_is_abandoned_at_deadline() {
    let monitor = Monitor::new(MonitorConfig {
        enable_sampler: false,
        notify_timeout: Duration::from_secs(3600),
        ..MonitorConfig::default()
    })
    .unwrap();
    monitor.register_notifier(Arc::new(HangingNotifier));
    monitor
        .register_alert_rule(
            AlertRule::new("r", "cpu", Condition::GreaterThan, 1.0, AlertSeverity::Low)
                .with_cool_down(Duration::ZERO),
        )
        .unwrap();

    let mut alerts = monitor.subscribe();
    monitor.start().await.unwrap();
    monitor.record_gauge("cpu", 5.0, Labels::new());
    timeout(Duration::from_secs(1), alerts.recv())
        .await
        .unwrap()
        .unwrap();

    let outcome = timeout(
        Duration::from_secs(2),
        monitor.stop_with_deadline(Duration::from_millis(100)),
    )
    .await
    .expect("stop exceeded its deadline");
    assert_eq!(outcome, ShutdownOutcome::Abandoned);
    assert!(!monitor.is_running());

    // The queue was rebuilt, so a restarted monitor still delivers alerts
    monitor.start().await.unwrap();
    monitor.record_gauge("cpu", 6.0, Labels::new());
    let alert = timeout(Duration::from_secs(1), alerts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.value, 6.0);
    monitor.stop_with_deadline(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_sampler_writes_nothing_after_stop() {
    let monitor = Monitor::with_components(
        MonitorConfig {
            sample_interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        },
        Arc::new(SystemClock),
        Box::new(SlowProbe {
            delay: Duration::from_millis(300),
        }),
    )
    .unwrap();

    // First sample lands around 300ms, the second is in flight when stop is called
    monitor.start().await.unwrap();
    sleep(Duration::from_millis(400)).await;
    let outcome = monitor.stop_with_deadline(Duration::from_millis(50)).await;
    assert_eq!(outcome, ShutdownOutcome::Abandoned);

    let history_len = |monitor: &Monitor| {
        monitor
            .snapshot()
            .get(gauges::MEMORY_USAGE_MB)
            .map_or(0, |m| m.history.len())
    };
    let at_stop = history_len(&monitor);
    sleep(Duration::from_millis(500)).await;
    assert_eq!(history_len(&monitor), at_stop);
}

#[tokio::test]
async fn test_health_while_running() {
    let calls = Arc::new(AtomicUsize::new(0));
    let monitor = sampling_monitor(calls, 32);

    monitor.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let health = monitor.health();
    monitor.stop().await;

    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.checks.len(), 3);
    assert_eq!(monitor.health().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_shared_monitor_across_tasks() {
    let monitor = Arc::new(
        Monitor::new(MonitorConfig {
            enable_sampler: false,
            ..MonitorConfig::default()
        })
        .unwrap(),
    );
    monitor.start().await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let monitor = monitor.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                monitor.record_gauge(&format!("worker_{}", worker), i as f64, Labels::new());
                monitor.increment_counter("events", Labels::new());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    monitor.stop().await;

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot["events"].value, 80.0);
    assert_eq!(snapshot["worker_3"].value, 9.0);
    assert_eq!(snapshot.len(), 9);
}
