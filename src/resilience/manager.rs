//! Per-component failure isolation.
//!
//! Breaker and health state for a component name is shared across every
//! concurrent caller of that component and updated under a per-component
//! exclusive lock. Locks are never held across an await: the breaker is
//! consulted before the call, the call runs unlocked under its timeout, and
//! the outcome is recorded afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::components::ComponentError;
use crate::error::EngineError;

use super::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use super::health::{ComponentHealth, HealthStatus, HealthThresholds};

/// Configuration for the resilience layer.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub health: HealthThresholds,

    /// Rolling window size for health tracking.
    pub health_window: usize,

    /// Interval of the background health sampling task.
    pub monitoring_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            health: HealthThresholds::default(),
            health_window: 20,
            monitoring_interval: Duration::from_secs(10),
        }
    }
}

struct ComponentState {
    breaker: CircuitBreaker,
    health: ComponentHealth,
}

/// Snapshot of one component's resilience state.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_rate: f64,
    pub health: HealthStatus,
    pub total_calls: u64,
}

/// Shared circuit-breaker and health layer.
pub struct ResilienceManager {
    config: ResilienceConfig,
    components: Mutex<HashMap<String, Arc<Mutex<ComponentState>>>>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResilienceManager {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            components: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    fn entry(&self, component: &str) -> Arc<Mutex<ComponentState>> {
        let mut components = self.components.lock().expect("component map poisoned");
        components
            .entry(component.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ComponentState {
                    breaker: CircuitBreaker::new(self.config.breaker.clone()),
                    health: ComponentHealth::new(
                        self.config.health_window,
                        self.config.health.clone(),
                    ),
                }))
            })
            .clone()
    }

    /// Run a component call behind its breaker, under `timeout`.
    ///
    /// An open breaker fails fast with `CircuitOpen` without constructing
    /// the call. A timeout counts as a failure for both breaker and health.
    pub async fn execute_with_resilience<F, Fut>(
        &self,
        component: &str,
        operation: &str,
        timeout: Duration,
        call: F,
    ) -> Result<Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ComponentError>>,
    {
        let entry = self.entry(component);

        {
            let mut state = entry.lock().expect("component state poisoned");
            if !state.breaker.try_acquire() {
                debug!(component, operation, "circuit open, failing fast");
                return Err(EngineError::CircuitOpen {
                    component: component.to_string(),
                });
            }
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, call()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut state = entry.lock().expect("component state poisoned");
        match outcome {
            Ok(Ok(value)) => {
                state.breaker.record_success();
                state.health.record(true);
                Ok(value)
            }
            Ok(Err(err)) => {
                state.breaker.record_failure();
                state.health.record(false);
                warn!(component, operation, error = %err, "component call failed");
                Err(EngineError::Component(err))
            }
            Err(_) => {
                state.breaker.record_failure();
                state.health.record(false);
                warn!(component, operation, elapsed_ms, "component call timed out");
                Err(EngineError::Timeout {
                    component: component.to_string(),
                    operation: operation.to_string(),
                    elapsed_ms,
                })
            }
        }
    }

    /// Current breaker state for a component, if it has been called.
    pub fn breaker_state(&self, component: &str) -> Option<CircuitState> {
        let components = self.components.lock().expect("component map poisoned");
        components
            .get(component)
            .map(|entry| entry.lock().expect("component state poisoned").breaker.state())
    }

    /// Health status for a component, if it has been called.
    pub fn health_status(&self, component: &str) -> Option<HealthStatus> {
        let components = self.components.lock().expect("component map poisoned");
        components
            .get(component)
            .map(|entry| entry.lock().expect("component state poisoned").health.status())
    }

    /// Snapshot of every tracked component.
    pub fn status(&self) -> HashMap<String, ComponentStatus> {
        let components = self.components.lock().expect("component map poisoned");
        components
            .iter()
            .map(|(name, entry)| {
                let state = entry.lock().expect("component state poisoned");
                (
                    name.clone(),
                    ComponentStatus {
                        state: state.breaker.state(),
                        failure_count: state.breaker.failure_count(),
                        success_rate: state.health.success_rate(),
                        health: state.health.status(),
                        total_calls: state.health.total_calls(),
                    },
                )
            })
            .collect()
    }

    /// Start the periodic health sampling task. No-op if already running.
    /// Takes a clone of the shared handle so the task can outlive the call.
    pub fn start_monitoring(self: Arc<Self>) {
        let mut monitor = self.monitor.lock().expect("monitor slot poisoned");
        if monitor.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let manager = Arc::clone(&self);
        let interval = self.config.monitoring_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        for (name, status) in manager.status() {
                            if status.health != HealthStatus::Healthy {
                                warn!(
                                    component = %name,
                                    health = ?status.health,
                                    success_rate = status.success_rate,
                                    "component health degraded"
                                );
                            }
                        }
                    }
                }
            }
        });

        *monitor = Some((token, handle));
    }

    /// Stop the sampling task. Idempotent.
    pub fn stop_monitoring(&self) {
        let mut monitor = self.monitor.lock().expect("monitor slot poisoned");
        if let Some((token, handle)) = monitor.take() {
            token.cancel();
            handle.abort();
        }
    }
}

impl Drop for ResilienceManager {
    fn drop(&mut self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some((token, handle)) = monitor.take() {
                token.cancel();
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(failure_threshold: u32, recovery_ms: u64) -> Arc<ResilienceManager> {
        Arc::new(ResilienceManager::new(ResilienceConfig {
            breaker: BreakerConfig {
                failure_threshold,
                success_threshold: 1,
                recovery_timeout_ms: recovery_ms,
            },
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let manager = manager(3, 10_000);
        let result = manager
            .execute_with_resilience("echo", "run", Duration::from_secs(1), || async {
                Ok(json!("ok"))
            })
            .await
            .unwrap();
        assert_eq!(result, json!("ok"));
        assert_eq!(manager.breaker_state("echo"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_invoking() {
        let manager = manager(2, 10_000);

        for _ in 0..2 {
            let _ = manager
                .execute_with_resilience("flaky", "run", Duration::from_secs(1), || async {
                    Err::<Value, _>(ComponentError::Internal("down".to_string()))
                })
                .await;
        }
        assert_eq!(manager.breaker_state("flaky"), Some(CircuitState::Open));

        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = invoked.clone();
        let result = manager
            .execute_with_resilience("flaky", "run", Duration::from_secs(1), move || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(json!("never"))
            })
            .await;

        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let manager = manager(1, 10_000);

        let result = manager
            .execute_with_resilience("slow", "run", Duration::from_millis(20), || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("late"))
            })
            .await;

        assert!(matches!(result, Err(EngineError::Timeout { .. })));
        assert_eq!(manager.breaker_state("slow"), Some(CircuitState::Open));
        assert_eq!(manager.health_status("slow"), Some(HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn test_recovery_cycle() {
        let manager = manager(1, 20);

        let _ = manager
            .execute_with_resilience("svc", "run", Duration::from_secs(1), || async {
                Err::<Value, _>(ComponentError::Connection("refused".to_string()))
            })
            .await;
        assert_eq!(manager.breaker_state("svc"), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Half-open probe succeeds; success_threshold=1 closes the breaker.
        let result = manager
            .execute_with_resilience("svc", "run", Duration::from_secs(1), || async {
                Ok(json!("recovered"))
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(manager.breaker_state("svc"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_monitoring_stop_idempotent() {
        let manager = manager(3, 10_000);
        Arc::clone(&manager).start_monitoring();
        Arc::clone(&manager).start_monitoring();
        manager.stop_monitoring();
        manager.stop_monitoring();
    }
}
