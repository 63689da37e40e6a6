//! Resource sampling and threshold alerts.
//!
//! A background task samples CPU and memory at a configurable interval,
//! compares each metric against warning/critical thresholds, and
//! raises/retires alerts as thresholds are crossed. The adaptive execution
//! strategy consults the derived pressure level to shrink step fan-out
//! without failing the run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One CPU/memory sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// Metric a threshold applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cpu => write!(f, "cpu"),
            Metric::Memory => write!(f, "memory"),
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// An active threshold crossing.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceAlert {
    pub metric: Metric,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Warning/critical cutoffs for one metric, in percent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            warning: 80.0,
            critical: 95.0,
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitoring_interval: Duration,
    pub cpu: MetricThresholds,
    pub memory: MetricThresholds,

    /// Rolling window size for statistics.
    pub window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(5),
            cpu: MetricThresholds::default(),
            memory: MetricThresholds::default(),
            window: 60,
        }
    }
}

/// Derived pressure level over all active alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Elevated,
    Critical,
}

/// Rolling statistics over the sample window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceStatistics {
    pub samples: usize,
    pub cpu_avg: f64,
    pub cpu_max: f64,
    pub memory_avg: f64,
    pub memory_max: f64,
    pub active_alerts: usize,
}

/// Source of resource samples; swapped out for a scripted one in tests.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceSnapshot;
}

/// sysinfo-backed sampler.
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSnapshot {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let cpu_percent = self.sys.global_cpu_info().cpu_usage() as f64;
        let memory_percent = if self.sys.total_memory() == 0 {
            0.0
        } else {
            self.sys.used_memory() as f64 / self.sys.total_memory() as f64 * 100.0
        };

        ResourceSnapshot {
            cpu_percent,
            memory_percent,
            timestamp: Utc::now(),
        }
    }
}

struct MonitorState {
    window: VecDeque<ResourceSnapshot>,
    current: Option<ResourceSnapshot>,
    active: HashMap<Metric, ResourceAlert>,
}

/// Samples resources and tracks threshold alerts.
pub struct ResourceMonitor {
    config: MonitorConfig,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    state: Arc<Mutex<MonitorState>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_sampler(config, Box::new(SystemSampler::new()))
    }

    pub fn with_sampler(config: MonitorConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            config,
            sampler: Mutex::new(sampler),
            state: Arc::new(Mutex::new(MonitorState {
                window: VecDeque::new(),
                current: None,
                active: HashMap::new(),
            })),
            task: Mutex::new(None),
        }
    }

    /// Take one sample and update alerts. Also used by the background task.
    pub fn sample_once(&self) -> ResourceSnapshot {
        let snapshot = self.sampler.lock().expect("sampler lock poisoned").sample();

        let mut state = self.state.lock().expect("monitor state poisoned");
        if state.window.len() == self.config.window {
            state.window.pop_front();
        }
        state.window.push_back(snapshot);
        state.current = Some(snapshot);

        Self::update_alert(&mut state, Metric::Cpu, snapshot.cpu_percent, &self.config.cpu);
        Self::update_alert(
            &mut state,
            Metric::Memory,
            snapshot.memory_percent,
            &self.config.memory,
        );

        snapshot
    }

    fn update_alert(
        state: &mut MonitorState,
        metric: Metric,
        value: f64,
        thresholds: &MetricThresholds,
    ) {
        let severity = if value >= thresholds.critical {
            Some((AlertSeverity::Critical, thresholds.critical))
        } else if value >= thresholds.warning {
            Some((AlertSeverity::Warning, thresholds.warning))
        } else {
            None
        };

        match severity {
            Some((severity, threshold)) => {
                let stale = state
                    .active
                    .get(&metric)
                    .map(|a| a.severity != severity)
                    .unwrap_or(true);
                if stale {
                    let alert = ResourceAlert {
                        metric,
                        severity,
                        value,
                        threshold,
                        message: format!(
                            "{} at {:.1}% crossed {:?} threshold {:.1}%",
                            metric, value, severity, threshold
                        ),
                        raised_at: Utc::now(),
                    };
                    warn!(metric = %metric, value, threshold, ?severity, "resource alert raised");
                    state.active.insert(metric, alert);
                }
            }
            None => {
                if state.active.remove(&metric).is_some() {
                    info!(metric = %metric, value, "resource alert retired");
                }
            }
        }
    }

    /// Start periodic sampling. No-op if already running. Takes a clone of
    /// the shared handle so the task can outlive the call.
    pub fn start(self: Arc<Self>) {
        let mut task = self.task.lock().expect("task slot poisoned");
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let monitor = Arc::clone(&self);
        let interval = self.config.monitoring_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        monitor.sample_once();
                    }
                }
            }
        });

        *task = Some((token, handle));
    }

    /// Stop periodic sampling. Idempotent.
    pub fn stop(&self) {
        let mut task = self.task.lock().expect("task slot poisoned");
        if let Some((token, handle)) = task.take() {
            token.cancel();
            handle.abort();
        }
    }

    /// Most recent sample, if any.
    pub fn current_snapshot(&self) -> Option<ResourceSnapshot> {
        self.state.lock().expect("monitor state poisoned").current
    }

    /// Currently active alerts.
    pub fn active_alerts(&self) -> Vec<ResourceAlert> {
        self.state
            .lock()
            .expect("monitor state poisoned")
            .active
            .values()
            .cloned()
            .collect()
    }

    /// Highest severity among active alerts.
    pub fn pressure(&self) -> PressureLevel {
        let state = self.state.lock().expect("monitor state poisoned");
        state
            .active
            .values()
            .map(|a| match a.severity {
                AlertSeverity::Warning => PressureLevel::Elevated,
                AlertSeverity::Critical => PressureLevel::Critical,
            })
            .max()
            .unwrap_or(PressureLevel::Normal)
    }

    /// Rolling statistics over the window.
    pub fn statistics(&self) -> ResourceStatistics {
        let state = self.state.lock().expect("monitor state poisoned");
        let samples = state.window.len();
        if samples == 0 {
            return ResourceStatistics {
                active_alerts: state.active.len(),
                ..Default::default()
            };
        }

        let mut cpu_sum = 0.0;
        let mut cpu_max: f64 = 0.0;
        let mut memory_sum = 0.0;
        let mut memory_max: f64 = 0.0;
        for snapshot in &state.window {
            cpu_sum += snapshot.cpu_percent;
            cpu_max = cpu_max.max(snapshot.cpu_percent);
            memory_sum += snapshot.memory_percent;
            memory_max = memory_max.max(snapshot.memory_percent);
        }

        ResourceStatistics {
            samples,
            cpu_avg: cpu_sum / samples as f64,
            cpu_max,
            memory_avg: memory_sum / samples as f64,
            memory_max,
            active_alerts: state.active.len(),
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some((token, handle)) = task.take() {
                token.cancel();
                handle.abort();
            }
        }
    }
}
