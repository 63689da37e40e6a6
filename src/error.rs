//! Error taxonomy for the orchestration engine.
//!
//! Validation errors block execution before it starts. Dependency and
//! circuit-open errors surface resolution failures at dispatch time.
//! Recoverable errors are absorbed by the recovery manager and only appear
//! here once every configured action has been exhausted.

use thiserror::Error;

use crate::components::ComponentError;
use crate::engine::validator::ValidationResult;

/// Errors produced by the engine, resilience, and recovery layers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow definition failed validation; lists every issue found.
    #[error("workflow validation failed: {0}")]
    Validation(ValidationFailure),

    /// No workflow with this id has been defined.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// A step names a component that was never registered.
    #[error("step '{step}' targets unregistered component '{component}'")]
    UnregisteredComponent { step: String, component: String },

    /// Execution was requested for a definition that was never validated.
    #[error("workflow '{0}' has not been validated")]
    NotValidated(String),

    /// Fast-fail from an open circuit breaker; the call was never made.
    #[error("circuit open for component '{component}'")]
    CircuitOpen { component: String },

    /// A call exceeded its configured timeout.
    #[error("'{component}.{operation}' timed out after {elapsed_ms}ms")]
    Timeout {
        component: String,
        operation: String,
        elapsed_ms: u64,
    },

    /// A critical step failed and its recovery actions are exhausted.
    #[error("critical step '{step}' failed: {reason}")]
    Fatal { step: String, reason: String },

    /// The underlying component raised an error.
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// Checkpoint persistence or restore failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Run journal I/O failed.
    #[error("journal error: {0}")]
    Journal(String),
}

/// Aggregated validation failure carrying every issue at once.
#[derive(Debug)]
pub struct ValidationFailure {
    pub result: ValidationResult,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self
            .result
            .issues
            .iter()
            .map(|i| i.to_string())
            .collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl EngineError {
    /// Whether this error is a timeout, regardless of which layer raised it.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. } | EngineError::Component(ComponentError::Timeout { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_display() {
        let err = EngineError::CircuitOpen {
            component: "generator".to_string(),
        };
        assert_eq!(err.to_string(), "circuit open for component 'generator'");
    }

    #[test]
    fn test_is_timeout() {
        let err = EngineError::Timeout {
            component: "a".to_string(),
            operation: "b".to_string(),
            elapsed_ms: 10,
        };
        assert!(err.is_timeout());

        let err = EngineError::Component(ComponentError::Timeout { elapsed_ms: 10 });
        assert!(err.is_timeout());

        let err = EngineError::UnknownWorkflow("w".to_string());
        assert!(!err.is_timeout());
    }
}
