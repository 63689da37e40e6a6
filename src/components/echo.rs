//! In-process demo component.
//!
//! Echoes its parameters back with a stage label, optionally after a delay.
//! Used by the CLI `run` command when no real components are wired in, and
//! by tests that need a deterministic component.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Component, ComponentError, Params};

/// A component that echoes its input back as the operation result.
pub struct EchoComponent {
    name: String,

    /// Artificial latency per call, for exercising timeouts.
    delay: Option<Duration>,
}

impl EchoComponent {
    /// Create a new echo component with the given registered name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
        }
    }

    /// Add artificial latency to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Component for EchoComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, operation: &str, params: &Params) -> Result<Value, ComponentError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        // The "fail" operation is a deliberate error path for demos/tests.
        if operation == "fail" {
            return Err(ComponentError::Internal(format!(
                "component '{}' asked to fail",
                self.name
            )));
        }

        Ok(json!({
            "component": self.name,
            "operation": operation,
            "params": params,
        }))
    }
}
