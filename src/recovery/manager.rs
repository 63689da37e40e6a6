//! Recovery execution: retry, fallback, restart, escalate.
//!
//! Wraps a component call and applies the matched strategy's actions in
//! order. Retries back off exponentially (optionally jittered); fallback
//! consults a handler registered for (component, operation); restart invokes
//! the component's re-initialization hook and grants one follow-up attempt;
//! escalate surfaces the original error immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::components::{Component, ComponentError};
use crate::error::EngineError;

use super::classifier::{ErrorClass, ErrorClassifier, ErrorPattern, RecoveryAction, RecoveryStrategy};

/// Handler invoked when a strategy reaches its Fallback action.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(
        &self,
        component: &str,
        operation: &str,
        error: &EngineError,
    ) -> Result<Value, ComponentError>;
}

/// Accumulated recovery statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    /// Every invocation attempt, first tries included.
    pub total_attempts: u64,

    /// Invocations that returned success.
    pub successful_attempts: u64,

    pub retries: u64,
    pub fallbacks: u64,
    pub restarts: u64,
    pub escalations: u64,
}

/// Maps classified errors to recovery strategies and executes them.
pub struct RecoveryManager {
    classifier: RwLock<ErrorClassifier>,
    fallbacks: RwLock<HashMap<(String, String), Arc<dyn FallbackHandler>>>,
    restart_targets: RwLock<HashMap<String, Arc<dyn Component>>>,
    stats: Mutex<RecoveryStats>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryManager {
    /// Create a manager with default strategies for transient error classes.
    pub fn new() -> Self {
        let mut classifier = ErrorClassifier::new();
        classifier.register(
            ErrorPattern::for_class(ErrorClass::Timeout),
            RecoveryStrategy {
                max_retries: 2,
                initial_delay: Duration::from_millis(500),
                ..Default::default()
            },
        );
        classifier.register(
            ErrorPattern::for_class(ErrorClass::Connection),
            RecoveryStrategy {
                max_retries: 3,
                initial_delay: Duration::from_millis(1000),
                jitter: true,
                ..Default::default()
            },
        );

        Self {
            classifier: RwLock::new(classifier),
            fallbacks: RwLock::new(HashMap::new()),
            restart_targets: RwLock::new(HashMap::new()),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    /// An empty manager with no default strategies registered.
    pub fn bare() -> Self {
        Self {
            classifier: RwLock::new(ErrorClassifier::new()),
            fallbacks: RwLock::new(HashMap::new()),
            restart_targets: RwLock::new(HashMap::new()),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    /// Register an error pattern with its strategy.
    pub fn register_pattern(&self, pattern: ErrorPattern, strategy: RecoveryStrategy) {
        self.classifier
            .write()
            .expect("classifier lock poisoned")
            .register(pattern, strategy);
    }

    /// Register a fallback handler for (component, operation).
    pub fn register_fallback(
        &self,
        component: impl Into<String>,
        operation: impl Into<String>,
        handler: Arc<dyn FallbackHandler>,
    ) {
        self.fallbacks
            .write()
            .expect("fallback lock poisoned")
            .insert((component.into(), operation.into()), handler);
    }

    /// Register the component instance a Restart action re-initializes.
    pub fn register_restart_target(&self, name: impl Into<String>, component: Arc<dyn Component>) {
        self.restart_targets
            .write()
            .expect("restart lock poisoned")
            .insert(name.into(), component);
    }

    /// Current statistics snapshot.
    pub fn statistics(&self) -> RecoveryStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Classify an error against the registered patterns.
    pub fn classify(
        &self,
        error: &EngineError,
        component: &str,
        operation: &str,
    ) -> ErrorClass {
        self.classifier
            .read()
            .expect("classifier lock poisoned")
            .classify(error, component, operation)
            .0
    }

    /// Invoke `call`, applying the matched strategy's actions on failure.
    ///
    /// `default_strategy` is used when no registered pattern matches — for
    /// step invocations this is the step's own retry policy, so exactly one
    /// retry loop governs each invocation.
    pub async fn execute_with_recovery<F, Fut>(
        &self,
        component: &str,
        operation: &str,
        default_strategy: &RecoveryStrategy,
        mut call: F,
    ) -> Result<Value, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, EngineError>>,
    {
        self.bump(|s| s.total_attempts += 1);

        let mut last_error = match call().await {
            Ok(value) => {
                self.bump(|s| s.successful_attempts += 1);
                return Ok(value);
            }
            Err(err) => err,
        };

        let strategy = {
            let classifier = self.classifier.read().expect("classifier lock poisoned");
            let (class, matched) = classifier.classify(&last_error, component, operation);
            debug!(component, operation, ?class, "classified failure");
            matched.cloned().unwrap_or_else(|| default_strategy.clone())
        };

        for action in &strategy.actions {
            match action {
                RecoveryAction::Retry => {
                    for attempt in 1..=strategy.max_retries {
                        let mut delay = strategy.delay_for_retry(attempt);
                        if strategy.jitter {
                            delay = delay.mul_f64(0.5 + rand::random::<f64>());
                        }
                        debug!(component, operation, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        tokio::time::sleep(delay).await;

                        self.bump(|s| {
                            s.total_attempts += 1;
                            s.retries += 1;
                        });

                        match call().await {
                            Ok(value) => {
                                self.bump(|s| s.successful_attempts += 1);
                                return Ok(value);
                            }
                            Err(err) => last_error = err,
                        }
                    }
                }
                RecoveryAction::Fallback => {
                    let handler = {
                        let fallbacks = self.fallbacks.read().expect("fallback lock poisoned");
                        fallbacks
                            .get(&(component.to_string(), operation.to_string()))
                            .cloned()
                    };

                    match handler {
                        Some(handler) => {
                            self.bump(|s| s.fallbacks += 1);
                            match handler.handle(component, operation, &last_error).await {
                                Ok(value) => {
                                    info!(component, operation, "fallback produced a result");
                                    self.bump(|s| s.successful_attempts += 1);
                                    return Ok(value);
                                }
                                Err(err) => {
                                    warn!(component, operation, error = %err, "fallback failed");
                                }
                            }
                        }
                        // No handler: the original error stays in play for
                        // the remaining actions (or surfaces unwrapped).
                        None => {
                            debug!(component, operation, "no fallback handler registered");
                        }
                    }
                }
                RecoveryAction::Restart => {
                    let target = {
                        let targets = self.restart_targets.read().expect("restart lock poisoned");
                        targets.get(component).cloned()
                    };

                    if let Some(target) = target {
                        self.bump(|s| s.restarts += 1);
                        info!(component, "restarting component");
                        if let Err(err) = target.initialize().await {
                            warn!(component, error = %err, "component restart failed");
                            continue;
                        }

                        // One follow-up attempt after a successful restart.
                        self.bump(|s| s.total_attempts += 1);
                        match call().await {
                            Ok(value) => {
                                self.bump(|s| s.successful_attempts += 1);
                                return Ok(value);
                            }
                            Err(err) => last_error = err,
                        }
                    }
                }
                RecoveryAction::Escalate => {
                    self.bump(|s| s.escalations += 1);
                    warn!(component, operation, "escalating failure");
                    return Err(last_error);
                }
            }
        }

        Err(last_error)
    }

    fn bump(&self, f: impl FnOnce(&mut RecoveryStats)) {
        f(&mut self.stats.lock().expect("stats lock poisoned"));
    }
}
