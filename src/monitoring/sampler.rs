//! Periodic sampling of process and runtime resource usage.
//!
//! The sampler reads a [`RuntimeSample`] from a [`RuntimeProbe`] on a fixed
//! interval and writes each field into the metric store under the names in
//! [`gauges`]. Failures are logged and the loop moves on to the next tick.

use super::metrics::{Labels, MetricStore};
use crate::error::ProbeError;
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task;
use tokio::time::{self, MissedTickBehavior};

/// Gauge names written by the sampler
pub mod gauges {
    pub const MEMORY_USAGE_MB: &str = "memory_usage_mb";
    pub const VIRTUAL_MEMORY_MB: &str = "virtual_memory_mb";
    pub const PROCESS_CPU_PERCENT: &str = "process_cpu_percent";
    pub const SYSTEM_MEMORY_USED_MB: &str = "system_memory_used_mb";
    pub const LIVE_TASKS: &str = "live_tasks";
    pub const RUNTIME_WORKERS: &str = "runtime_workers";
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resource facts read in one sampling pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSample {
    pub resident_memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub process_cpu_percent: f32,
    pub system_memory_used_bytes: u64,
    /// `None` when not called from inside a tokio runtime
    pub live_tasks: Option<usize>,
    pub runtime_workers: Option<usize>,
}

/// Source of runtime resource facts
#[cfg_attr(test, mockall::automock)]
pub trait RuntimeProbe: Send {
    fn sample(&mut self) -> Result<RuntimeSample, ProbeError>;
}

/// Probe reading the current process through `sysinfo` and the ambient tokio runtime
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("cannot resolve current pid, process gauges disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeProbe for SysinfoProbe {
    fn sample(&mut self) -> Result<RuntimeSample, ProbeError> {
        let pid = self
            .pid
            .ok_or_else(|| ProbeError::ProcessUnavailable("pid unknown".to_string()))?;

        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let process = self
            .system
            .process(pid)
            .ok_or_else(|| ProbeError::ProcessUnavailable(format!("pid {} not found", pid)))?;

        let (live_tasks, runtime_workers) = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let metrics = handle.metrics();
                (Some(metrics.num_alive_tasks()), Some(metrics.num_workers()))
            }
            Err(_) => (None, None),
        };

        Ok(RuntimeSample {
            resident_memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            process_cpu_percent: process.cpu_usage(),
            system_memory_used_bytes: self.system.used_memory(),
            live_tasks,
            runtime_workers,
        })
    }
}

/// Counters describing sampler progress, shared with the health check
#[derive(Debug, Default)]
pub struct SamplerStats {
    samples: AtomicU64,
    failures: AtomicU64,
    last_failed: AtomicBool,
}

impl SamplerStats {
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_failed(&self) -> bool {
        self.last_failed.load(Ordering::Relaxed)
    }

    fn record(&self, ok: bool) {
        if ok {
            self.samples.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_failed.store(!ok, Ordering::Relaxed);
    }
}

/// Background worker pushing resource gauges into the metric store
pub struct SystemSampler {
    store: Arc<MetricStore>,
    /// `None` only while a sample is being taken on the blocking pool
    probe: Option<Box<dyn RuntimeProbe>>,
    interval: Duration,
    stats: Arc<SamplerStats>,
}

impl SystemSampler {
    pub fn new(
        store: Arc<MetricStore>,
        probe: Box<dyn RuntimeProbe>,
        interval: Duration,
        stats: Arc<SamplerStats>,
    ) -> Self {
        Self {
            store,
            probe: Some(probe),
            interval,
            stats,
        }
    }

    /// Take one sample on the calling thread and record it. Panics inside the probe are caught.
    pub fn sample_once(&mut self) -> Result<(), ProbeError> {
        let result = match self.probe.as_mut() {
            Some(probe) => read_probe(&mut **probe),
            None => Err(ProbeError::Unavailable),
        };
        self.apply(result)
    }

    fn apply(&self, result: Result<RuntimeSample, ProbeError>) -> Result<(), ProbeError> {
        let result = result.map(|sample| self.record(&sample));
        self.stats.record(result.is_ok());
        result
    }

    /// Read the probe on the blocking pool so the sampler task stays abortable.
    ///
    /// Returns `None` when the blocking task itself failed and the probe is gone.
    async fn sample_blocking(&mut self) -> Option<Result<RuntimeSample, ProbeError>> {
        let mut probe = self.probe.take()?;
        let joined = task::spawn_blocking(move || {
            let result = read_probe(probe.as_mut());
            (probe, result)
        })
        .await;

        match joined {
            Ok((probe, result)) => {
                self.probe = Some(probe);
                Some(result)
            }
            Err(e) => {
                error!("system sample task failed, probe lost: {}", e);
                None
            }
        }
    }

    fn record(&self, sample: &RuntimeSample) {
        let gauge = |name: &str, value: f64| self.store.record_gauge(name, value, Labels::new());

        gauge(
            gauges::MEMORY_USAGE_MB,
            sample.resident_memory_bytes as f64 / BYTES_PER_MB,
        );
        gauge(
            gauges::VIRTUAL_MEMORY_MB,
            sample.virtual_memory_bytes as f64 / BYTES_PER_MB,
        );
        gauge(
            gauges::PROCESS_CPU_PERCENT,
            sample.process_cpu_percent as f64,
        );
        gauge(
            gauges::SYSTEM_MEMORY_USED_MB,
            sample.system_memory_used_bytes as f64 / BYTES_PER_MB,
        );
        if let Some(tasks) = sample.live_tasks {
            gauge(gauges::LIVE_TASKS, tasks as f64);
        }
        if let Some(workers) = sample.runtime_workers {
            gauge(gauges::RUNTIME_WORKERS, workers as f64);
        }
    }

    /// Sample on every tick until the stop signal flips to `true`; returns the probe for reuse.
    ///
    /// A sample that completes after the stop signal is discarded, so nothing
    /// is written once a stop has been requested.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Option<Box<dyn RuntimeProbe>> {
        info!("system sampler started interval={:?}", self.interval);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let Some(result) = self.sample_blocking().await else {
                        break;
                    };
                    if *stop.borrow() {
                        debug!("discarding system sample taken during shutdown");
                        break;
                    }
                    match self.apply(result) {
                        Ok(()) => debug!("system sample recorded"),
                        Err(e) => error!("system sample failed, retrying next tick: {}", e),
                    }
                }
                changed = stop.changed() => {
                    // Sender gone means the monitor was dropped
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("system sampler stopped");
        self.probe
    }
}

fn read_probe(probe: &mut dyn RuntimeProbe) -> Result<RuntimeSample, ProbeError> {
    match panic::catch_unwind(AssertUnwindSafe(|| probe.sample())) {
        Ok(result) => result,
        Err(payload) => Err(ProbeError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::monitoring::alerts::AlertEngine;

    fn store() -> Arc<MetricStore> {
        let (engine, _rx) = AlertEngine::new(4, 1e-9);
        Arc::new(MetricStore::new(10, Arc::new(engine), Arc::new(SystemClock)))
    }

    fn sample() -> RuntimeSample {
        RuntimeSample {
            resident_memory_bytes: 256 * 1024 * 1024,
            virtual_memory_bytes: 1024 * 1024 * 1024,
            process_cpu_percent: 12.5,
            system_memory_used_bytes: 4096 * 1024 * 1024,
            live_tasks: Some(42),
            runtime_workers: Some(4),
        }
    }

    #[test]
    fn test_sample_writes_fixed_gauges() {
        let store = store();
        let mut probe = MockRuntimeProbe::new();
        probe.expect_sample().times(1).returning(|| Ok(sample()));

        let stats = Arc::new(SamplerStats::default());
        let mut sampler =
            SystemSampler::new(store.clone(), Box::new(probe), Duration::from_secs(1), stats.clone());
        sampler.sample_once().unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot[gauges::MEMORY_USAGE_MB].value, 256.0);
        assert_eq!(snapshot[gauges::VIRTUAL_MEMORY_MB].value, 1024.0);
        assert_eq!(snapshot[gauges::PROCESS_CPU_PERCENT].value, 12.5);
        assert_eq!(snapshot[gauges::SYSTEM_MEMORY_USED_MB].value, 4096.0);
        assert_eq!(snapshot[gauges::LIVE_TASKS].value, 42.0);
        assert_eq!(snapshot[gauges::RUNTIME_WORKERS].value, 4.0);
        assert_eq!(stats.samples(), 1);
        assert!(!stats.last_failed());
    }

    #[test]
    fn test_runtime_gauges_skipped_outside_runtime() {
        let store = store();
        let mut probe = MockRuntimeProbe::new();
        probe.expect_sample().returning(|| {
            Ok(RuntimeSample {
                live_tasks: None,
                runtime_workers: None,
                ..sample()
            })
        });

        let mut sampler = SystemSampler::new(
            store.clone(),
            Box::new(probe),
            Duration::from_secs(1),
            Arc::new(SamplerStats::default()),
        );
        sampler.sample_once().unwrap();

        assert!(store.get(gauges::LIVE_TASKS).is_none());
        assert!(store.get(gauges::MEMORY_USAGE_MB).is_some());
    }

    #[test]
    fn test_probe_error_is_reported_not_recorded() {
        let store = store();
        let mut probe = MockRuntimeProbe::new();
        probe
            .expect_sample()
            .returning(|| Err(ProbeError::ProcessUnavailable("gone".to_string())));

        let stats = Arc::new(SamplerStats::default());
        let mut sampler =
            SystemSampler::new(store.clone(), Box::new(probe), Duration::from_secs(1), stats.clone());

        assert!(sampler.sample_once().is_err());
        assert!(store.is_empty());
        assert_eq!(stats.failures(), 1);
        assert!(stats.last_failed());
    }

    #[test]
    fn test_probe_panic_is_contained() {
        struct PanickingProbe;

        impl RuntimeProbe for PanickingProbe {
            fn sample(&mut self) -> Result<RuntimeSample, ProbeError> {
                panic!("probe exploded")
            }
        }

        let mut sampler = SystemSampler::new(
            store(),
            Box::new(PanickingProbe),
            Duration::from_secs(1),
            Arc::new(SamplerStats::default()),
        );

        match sampler.sample_once() {
            Err(ProbeError::Panicked(message)) => assert!(message.contains("probe exploded")),
            other => panic!("expected contained panic, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_keeps_going_after_failures_and_stops_on_signal() {
        let store = store();
        let mut calls = 0u32;
        let mut probe = MockRuntimeProbe::new();
        probe.expect_sample().returning(move || {
            calls += 1;
            if calls % 2 == 1 {
                Err(ProbeError::ProcessUnavailable("flaky".to_string()))
            } else {
                Ok(sample())
            }
        });

        let stats = Arc::new(SamplerStats::default());
        let sampler = SystemSampler::new(
            store.clone(),
            Box::new(probe),
            Duration::from_millis(10),
            stats.clone(),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(stop_rx));

        time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler did not stop")
            .unwrap();

        assert!(stats.failures() >= 1);
        assert!(stats.samples() >= 1);
        assert!(store.get(gauges::MEMORY_USAGE_MB).is_some());
    }

    #[tokio::test]
    async fn test_sample_finishing_after_stop_is_discarded() {
        struct SlowProbe;

        impl RuntimeProbe for SlowProbe {
            fn sample(&mut self) -> Result<RuntimeSample, ProbeError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(sample())
            }
        }

        let store = store();
        let stats = Arc::new(SamplerStats::default());
        let sampler = SystemSampler::new(
            store.clone(),
            Box::new(SlowProbe),
            Duration::from_millis(10),
            stats.clone(),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(stop_rx));

        // The first sample is still in flight when the stop arrives
        time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let probe = time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler did not stop")
            .unwrap();

        assert!(probe.is_some());
        assert!(store.is_empty());
        assert_eq!(stats.samples(), 0);
    }

    #[tokio::test]
    async fn test_sysinfo_probe_reads_current_process() {
        let mut probe = SysinfoProbe::new();
        let sample = probe.sample().unwrap();

        assert!(sample.resident_memory_bytes > 0);
        assert!(sample.runtime_workers.is_some());
    }
}
