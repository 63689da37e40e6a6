//! Component interfaces for pluggable pipeline stages.
//!
//! Components provide a unified interface for the external AI stages a
//! workflow dispatches to (analyzers, generators, evaluators). The engine
//! only ever sees named operations and JSON parameters; it never inspects
//! a component's internals.

pub mod echo;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use echo::EchoComponent;

/// Keyword-style parameters passed to a component operation.
pub type Params = HashMap<String, Value>;

/// Trait for registered pipeline components.
#[async_trait]
pub trait Component: Send + Sync {
    /// Human-readable component name.
    fn name(&self) -> &str;

    /// Invoke a named operation with keyword-style parameters.
    async fn call(&self, operation: &str, params: &Params) -> Result<Value, ComponentError>;

    /// Re-initialize internal state after a restart request.
    async fn initialize(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Errors raised by component operations.
#[derive(Debug, Clone, Error)]
pub enum ComponentError {
    #[error("unknown operation '{operation}' on component '{component}'")]
    UnknownOperation {
        component: String,
        operation: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("{0}")]
    Internal(String),
}

/// Scores a batch of candidate results.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, batch: &[Value]) -> Result<Vec<f64>, ComponentError>;
}

/// Returns a subset of a population under a named strategy.
#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(
        &self,
        population: &[Value],
        strategy: &str,
        count: usize,
    ) -> Result<Vec<Value>, ComponentError>;
}

/// Version/lineage store for generated variants.
#[async_trait]
pub trait LineageStore: Send + Sync {
    async fn add_variant(&self, parent: Option<&str>, variant: &Value)
        -> Result<String, ComponentError>;

    async fn get_lineage(&self, id: &str) -> Result<Vec<String>, ComponentError>;
}

/// Version-control backend for repository snapshots tied to checkpoints.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Record a repository snapshot for a checkpoint, returning a revision id.
    async fn snapshot(&self, checkpoint_id: &str) -> Result<String, ComponentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_error_display() {
        let err = ComponentError::UnknownOperation {
            component: "evaluator".to_string(),
            operation: "score".to_string(),
        };
        assert!(err.to_string().contains("evaluator"));
        assert!(err.to_string().contains("score"));

        let err = ComponentError::Timeout { elapsed_ms: 1500 };
        assert!(err.to_string().contains("1500ms"));
    }
}
