use super::alerts::{Alert, AlertEngine, AlertRule, AlertRuleConfig};
use super::dispatcher::{AlertDispatcher, AlertHistory, NotifierList};
use super::health::{ComponentHealth, HealthCheckResult, HealthStatus};
use super::metrics::{Labels, MetricData, MetricStore};
use super::notifier::{AlertNotifier, FnNotifier, WebhookNotifier};
use super::report::{PerformanceReport, ReportGenerator};
use super::sampler::{RuntimeProbe, SamplerStats, SysinfoProbe, SystemSampler};
use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

/// Upper bound on waiting for an aborted worker to unwind
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// How a call to `stop` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Both workers exited before the deadline
    Graceful,
    /// The deadline passed and the remaining workers were aborted
    Abandoned,
    /// The monitor was not running
    NotRunning,
}

enum Lifecycle {
    Stopped {
        rx: mpsc::Receiver<Alert>,
        probe: Option<Box<dyn RuntimeProbe>>,
    },
    Running {
        stop: watch::Sender<bool>,
        sampler: Option<JoinHandle<Option<Box<dyn RuntimeProbe>>>>,
        dispatcher: JoinHandle<mpsc::Receiver<Alert>>,
    },
    /// Transient, only visible while the lifecycle lock is held
    Transitioning,
}

/// In-process metrics, alerting and reporting engine
///
/// Owns one metric store, one alert engine and the two background workers
/// (system sampler and alert dispatcher). Several monitors can live in the
/// same process; nothing here is global.
pub struct Monitor {
    config: MonitorConfig,
    engine: Arc<AlertEngine>,
    store: Arc<MetricStore>,
    history: Arc<AlertHistory>,
    notifiers: NotifierList,
    broadcast: broadcast::Sender<Alert>,
    reports: ReportGenerator,
    sampler_stats: Arc<SamplerStats>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
}

impl Monitor {
    /// Create a monitor using the system clock and the sysinfo probe
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_components(config, Arc::new(SystemClock), Box::new(SysinfoProbe::new()))
    }

    /// Create a monitor with an explicit clock and runtime probe
    pub fn with_components(
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
        probe: Box<dyn RuntimeProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let (engine, rx) = AlertEngine::new(config.alert_queue_capacity, config.equality_epsilon);
        let engine = Arc::new(engine);
        let store = Arc::new(MetricStore::new(config.max_history, engine.clone(), clock));
        let history = Arc::new(AlertHistory::new(config.recent_alert_capacity));
        let (broadcast, _) = broadcast::channel(config.alert_queue_capacity);
        let reports = ReportGenerator::new(
            store.clone(),
            engine.clone(),
            history.clone(),
            config.recent_alert_capacity,
        );

        let monitor = Self {
            engine,
            store,
            history,
            notifiers: Arc::new(RwLock::new(Vec::new())),
            broadcast,
            reports,
            sampler_stats: Arc::new(SamplerStats::default()),
            lifecycle: Mutex::new(Lifecycle::Stopped {
                rx,
                probe: Some(probe),
            }),
            running: AtomicBool::new(false),
            config,
        };

        for rule in monitor.config.rules.clone() {
            monitor.register_rule_config(rule)?;
        }
        if let Some(webhook) = monitor.config.webhook.clone() {
            info!("registering webhook notifier url={}", webhook.url);
            monitor.register_notifier(Arc::new(WebhookNotifier::new(webhook)));
        }

        Ok(monitor)
    }

    /// Set a gauge value and evaluate matching alert rules
    pub fn record_gauge(&self, name: &str, value: f64, labels: Labels) {
        self.store.record_gauge(name, value, labels);
    }

    /// Increment a counter by one
    pub fn increment_counter(&self, name: &str, labels: Labels) {
        self.store.increment_counter(name, labels);
    }

    /// Register an alert rule
    pub fn register_alert_rule(&self, rule: AlertRule) -> Result<()> {
        self.engine.register(rule)
    }

    /// Register a rule given in configuration form, rejecting unknown operators
    pub fn register_rule_config(&self, config: AlertRuleConfig) -> Result<()> {
        let rule = AlertRule::try_from(config)?;
        self.engine.register(rule)
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.engine.set_enabled(name, enabled)
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.engine.rules()
    }

    /// Run `hook` for every dispatched alert
    pub fn register_notify_hook<F>(&self, hook: F)
    where
        F: Fn(Alert) + Send + Sync + 'static,
    {
        self.register_notifier(Arc::new(FnNotifier::new("hook", hook)));
    }

    pub fn register_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        debug!("registered notifier {}", notifier.name());
        self.notifiers.write().push(notifier);
    }

    /// Receive every alert the dispatcher delivers from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.broadcast.subscribe()
    }

    /// Deep copy of all metrics
    pub fn snapshot(&self) -> HashMap<String, MetricData> {
        self.store.snapshot()
    }

    pub fn generate_report(&self, time_range: &str) -> PerformanceReport {
        self.reports.generate(time_range)
    }

    /// Most recently dispatched alerts, newest first
    pub fn recent_alerts(&self, count: usize) -> Vec<Alert> {
        self.history.recent(count)
    }

    /// Alerts dropped by the backpressure policy
    pub fn dropped_alerts(&self) -> u64 {
        self.engine.dropped()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Launch the sampler and dispatcher. Calling it while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;

        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running { .. }) {
            debug!("monitor already running");
            return Ok(());
        }

        let (rx, probe) = match std::mem::replace(&mut *lifecycle, Lifecycle::Transitioning) {
            Lifecycle::Stopped { rx, probe } => (rx, probe),
            // Transitioning never outlives a lock guard
            _ => (self.engine.reset_queue(), None),
        };

        let (stop, stop_rx) = watch::channel(false);

        let dispatcher = AlertDispatcher::new(
            rx,
            self.notifiers.clone(),
            self.history.clone(),
            self.broadcast.clone(),
            self.config.notify_timeout,
        );
        let dispatcher = handle.spawn(dispatcher.run(stop_rx.clone()));

        let sampler = if self.config.enable_sampler {
            let probe = probe.unwrap_or_else(|| Box::new(SysinfoProbe::new()));
            let sampler = SystemSampler::new(
                self.store.clone(),
                probe,
                self.config.sample_interval,
                self.sampler_stats.clone(),
            );
            Some(handle.spawn(sampler.run(stop_rx)))
        } else {
            None
        };

        *lifecycle = Lifecycle::Running {
            stop,
            sampler,
            dispatcher,
        };
        self.running.store(true, Ordering::SeqCst);

        info!(
            "monitor started sampler={} interval={:?} queue_capacity={}",
            self.config.enable_sampler,
            self.config.sample_interval,
            self.engine.queue_capacity()
        );
        Ok(())
    }

    /// Stop both workers, waiting at most the configured shutdown timeout
    pub async fn stop(&self) -> ShutdownOutcome {
        self.stop_with_deadline(self.config.shutdown_timeout).await
    }

    /// Stop both workers, waiting at most `deadline` for them to exit.
    ///
    /// Workers still running at the deadline are aborted and the alert queue
    /// is rebuilt so the monitor can be started again.
    pub async fn stop_with_deadline(&self, deadline: Duration) -> ShutdownOutcome {
        let mut lifecycle = self.lifecycle.lock().await;

        let (stop, mut sampler, mut dispatcher) =
            match std::mem::replace(&mut *lifecycle, Lifecycle::Transitioning) {
                Lifecycle::Running {
                    stop,
                    sampler,
                    dispatcher,
                } => (stop, sampler, dispatcher),
                other => {
                    *lifecycle = other;
                    return ShutdownOutcome::NotRunning;
                }
            };

        info!("monitor stopping deadline={:?}", deadline);
        let _ = stop.send(true);

        let joined = time::timeout(deadline, async {
            let probe = match sampler.as_mut() {
                Some(handle) => Some(handle.await),
                None => None,
            };
            let rx = (&mut dispatcher).await;
            (probe, rx)
        })
        .await;

        let (outcome, rx, probe) = match joined {
            Ok((probe, rx)) => {
                let rx = rx.unwrap_or_else(|e| {
                    warn!("alert dispatcher exited abnormally: {}", e);
                    self.engine.reset_queue()
                });
                let probe = match probe {
                    Some(Ok(probe)) => probe,
                    Some(Err(e)) => {
                        warn!("system sampler exited abnormally: {}", e);
                        None
                    }
                    None => None,
                };
                (ShutdownOutcome::Graceful, rx, probe)
            }
            Err(_) => {
                warn!("monitor workers did not exit within {:?}, aborting", deadline);
                if let Some(handle) = sampler {
                    handle.abort();
                    Self::await_aborted("system sampler", handle).await;
                }
                dispatcher.abort();
                Self::await_aborted("alert dispatcher", dispatcher).await;
                (ShutdownOutcome::Abandoned, self.engine.reset_queue(), None)
            }
        };

        *lifecycle = Lifecycle::Stopped { rx, probe };
        self.running.store(false, Ordering::SeqCst);
        info!("monitor stopped outcome={:?}", outcome);
        outcome
    }

    /// Wait for an aborted worker to unwind so it cannot touch shared state afterwards
    async fn await_aborted<T>(worker: &str, handle: JoinHandle<T>) {
        match time::timeout(ABORT_GRACE, handle).await {
            Ok(Err(e)) if e.is_cancelled() => debug!("{} aborted", worker),
            Ok(_) => debug!("{} finished while aborting", worker),
            Err(_) => warn!("{} still running {:?} after abort", worker, ABORT_GRACE),
        }
    }

    /// Health of the lifecycle, alert queue and sampler
    pub fn health(&self) -> HealthCheckResult {
        let lifecycle = if self.is_running() {
            ComponentHealth::new("lifecycle", HealthStatus::Healthy, "running")
        } else {
            ComponentHealth::new("lifecycle", HealthStatus::Degraded, "stopped")
        };

        let dropped = self.dropped_alerts();
        let alert_queue = if dropped == 0 {
            ComponentHealth::new("alert_queue", HealthStatus::Healthy, "no alerts dropped")
        } else {
            ComponentHealth::new(
                "alert_queue",
                HealthStatus::Degraded,
                format!("{} alerts dropped", dropped),
            )
        };

        let stats = &self.sampler_stats;
        let sampler = if !self.config.enable_sampler {
            ComponentHealth::new("sampler", HealthStatus::Healthy, "disabled")
        } else if stats.last_failed() {
            ComponentHealth::new(
                "sampler",
                HealthStatus::Degraded,
                format!("last sample failed ({} failures total)", stats.failures()),
            )
        } else {
            ComponentHealth::new(
                "sampler",
                HealthStatus::Healthy,
                format!("{} samples recorded", stats.samples()),
            )
        };

        HealthCheckResult::from_components(vec![lifecycle, alert_queue, sampler])
    }
}
