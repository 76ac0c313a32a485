use super::alerts::Alert;
use super::notifier::AlertNotifier;
use crate::error::NotifyError;
use futures_util::future::join_all;
use log::{debug, info, log, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Shared list of registered notifiers
pub type NotifierList = Arc<RwLock<Vec<Arc<dyn AlertNotifier>>>>;

/// Bounded record of dispatched alerts
pub struct AlertHistory {
    alerts: Mutex<VecDeque<Alert>>,
    max_alerts: usize,
}

impl AlertHistory {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(max_alerts)),
            max_alerts,
        }
    }

    fn push(&self, alert: Alert) {
        if self.max_alerts == 0 {
            return;
        }
        let mut alerts = self.alerts.lock();
        while alerts.len() >= self.max_alerts {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Most recent alerts, newest first
    pub fn recent(&self, count: usize) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        alerts.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background worker draining the alert queue
///
/// Each alert is logged at a level derived from its severity, recorded in
/// the history, broadcast to subscribers and handed to every notifier. A
/// notifier call runs in its own task and is abandoned after
/// `notify_timeout`.
pub struct AlertDispatcher {
    rx: mpsc::Receiver<Alert>,
    notifiers: NotifierList,
    history: Arc<AlertHistory>,
    broadcast: broadcast::Sender<Alert>,
    notify_timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(
        rx: mpsc::Receiver<Alert>,
        notifiers: NotifierList,
        history: Arc<AlertHistory>,
        broadcast: broadcast::Sender<Alert>,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            rx,
            notifiers,
            history,
            broadcast,
            notify_timeout,
        }
    }

    /// Drain alerts until stopped; returns the queue receiver for reuse.
    ///
    /// Alerts already queued when the stop signal arrives are still dispatched.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> mpsc::Receiver<Alert> {
        info!("alert dispatcher started");

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(alert) => self.dispatch(alert).await,
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let mut drained = 0usize;
        while let Ok(alert) = self.rx.try_recv() {
            self.dispatch(alert).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("alert dispatcher drained {} queued alerts on stop", drained);
        }

        info!("alert dispatcher stopped");
        self.rx
    }

    async fn dispatch(&self, alert: Alert) {
        log!(
            alert.severity.log_level(),
            "alert fired rule={} metric={} value={} condition={} threshold={} severity={}: {}",
            alert.rule_name,
            alert.metric_name,
            alert.value,
            alert.condition,
            alert.threshold,
            alert.severity,
            alert.message
        );

        self.history.push(alert.clone());
        // No subscribers is not an error
        let _ = self.broadcast.send(alert.clone());

        // Notifiers run concurrently, so one alert costs at most one `notify_timeout`
        let notifiers: Vec<Arc<dyn AlertNotifier>> = self.notifiers.read().clone();
        let results = join_all(
            notifiers
                .iter()
                .map(|notifier| self.notify(notifier.clone(), alert.clone())),
        )
        .await;

        for (notifier, result) in notifiers.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "notifier {} failed for alert rule={}: {}",
                    notifier.name(),
                    alert.rule_name,
                    e
                );
            }
        }
    }

    async fn notify(&self, notifier: Arc<dyn AlertNotifier>, alert: Alert) -> Result<(), NotifyError> {
        let mut task = AbortOnDrop(tokio::spawn(async move { notifier.notify(&alert).await }));

        match tokio::time::timeout(self.notify_timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(NotifyError::Task(join_error.to_string())),
            Err(_) => Err(NotifyError::Timeout(self.notify_timeout)),
        }
    }
}

/// Aborts the notification task when the dispatcher gives up on it or is itself aborted
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
