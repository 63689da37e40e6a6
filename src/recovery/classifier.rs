//! Error classification and recovery strategies.
//!
//! Errors are bucketed into coarse classes, then matched against registered
//! patterns. An operation-level pattern overrides a component-level one,
//! which overrides the class default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::components::ComponentError;
use crate::domain::RetryPolicy;
use crate::error::EngineError;

/// Coarse error classes for pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Connection,
    ResourceExhausted,
    InvalidInput,
    CircuitOpen,
    Internal,
    Unknown,
}

impl ErrorClass {
    /// Classify an engine error.
    pub fn of(error: &EngineError) -> Self {
        match error {
            EngineError::Timeout { .. } => ErrorClass::Timeout,
            EngineError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            EngineError::Component(component_error) => match component_error {
                ComponentError::Timeout { .. } => ErrorClass::Timeout,
                ComponentError::Connection(_) => ErrorClass::Connection,
                ComponentError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
                ComponentError::InvalidInput(_) => ErrorClass::InvalidInput,
                ComponentError::UnknownOperation { .. } => ErrorClass::InvalidInput,
                ComponentError::Internal(_) => ErrorClass::Internal,
            },
            _ => ErrorClass::Unknown,
        }
    }
}

/// Match key for a registered recovery strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPattern {
    pub class: ErrorClass,

    /// Restrict to a component; `None` matches any.
    pub component: Option<String>,

    /// Restrict to an operation on that component; `None` matches any.
    pub operation: Option<String>,
}

impl ErrorPattern {
    /// Class-level default pattern.
    pub fn for_class(class: ErrorClass) -> Self {
        Self {
            class,
            component: None,
            operation: None,
        }
    }

    /// Component-level pattern.
    pub fn for_component(class: ErrorClass, component: impl Into<String>) -> Self {
        Self {
            class,
            component: Some(component.into()),
            operation: None,
        }
    }

    /// Operation-level pattern.
    pub fn for_operation(
        class: ErrorClass,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            class,
            component: Some(component.into()),
            operation: Some(operation.into()),
        }
    }

    fn matches(&self, class: ErrorClass, component: &str, operation: &str) -> bool {
        if self.class != class {
            return false;
        }
        if let Some(ref c) = self.component {
            if c != component {
                return false;
            }
        }
        if let Some(ref o) = self.operation {
            if o != operation {
                return false;
            }
        }
        true
    }

    /// Operation-level beats component-level beats class default.
    fn specificity(&self) -> u8 {
        self.component.is_some() as u8 + (self.operation.is_some() as u8) * 2
    }
}

/// Ordered actions a matched strategy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Restart,
    Escalate,
}

/// What to do when a classified error occurs.
#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub actions: Vec<RecoveryAction>,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            jitter: false,
            actions: vec![RecoveryAction::Retry],
        }
    }
}

impl RecoveryStrategy {
    /// Derive a retry-only strategy from a step's retry policy.
    ///
    /// The step's `max_attempts` includes the first invocation, so retries
    /// are one fewer.
    pub fn from_retry_policy(policy: &RetryPolicy) -> Self {
        Self {
            max_retries: policy.max_attempts.saturating_sub(1),
            initial_delay: Duration::from_millis(policy.initial_delay_ms),
            backoff_factor: policy.backoff_multiplier,
            jitter: false,
            actions: vec![RecoveryAction::Retry],
        }
    }

    /// Pre-jitter delay before retry `attempt` (1-indexed).
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Registry of error patterns and their strategies.
#[derive(Default)]
pub struct ErrorClassifier {
    patterns: Vec<(ErrorPattern, RecoveryStrategy)>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern. Among equally specific matches the earliest
    /// registration wins.
    pub fn register(&mut self, pattern: ErrorPattern, strategy: RecoveryStrategy) {
        self.patterns.push((pattern, strategy));
    }

    /// Find the most specific registered strategy for an error.
    pub fn classify(
        &self,
        error: &EngineError,
        component: &str,
        operation: &str,
    ) -> (ErrorClass, Option<&RecoveryStrategy>) {
        let class = ErrorClass::of(error);

        let strategy = self
            .patterns
            .iter()
            .filter(|(pattern, _)| pattern.matches(class, component, operation))
            .max_by_key(|(pattern, _)| pattern.specificity())
            .map(|(_, strategy)| strategy);

        (class, strategy)
    }
}
