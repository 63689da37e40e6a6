//! Workflow definitions and loading.
//!
//! Workflows are defined in YAML as a mapping of named tasks, each targeting
//! a component operation with declared dependencies. A definition is
//! immutable once validated; the engine only executes validated definitions.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Definition format version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Workflow name (doubles as the definition id).
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Number of improvement iterations an orchestrated run performs.
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Execution strategy for the step DAG.
    #[serde(default)]
    pub strategy: ExecutionStrategy,

    /// Take a periodic checkpoint every N iterations.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Ordered list of steps (declaration order from the tasks mapping).
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}
fn default_iterations() -> u32 {
    1
}
fn default_checkpoint_interval() -> u32 {
    1
}

/// Raw YAML document shape: tasks as a name-keyed mapping.
#[derive(Debug, Deserialize)]
struct RawDefinition {
    #[serde(default = "default_version")]
    version: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_iterations")]
    iterations: u32,
    #[serde(default)]
    strategy: ExecutionStrategy,
    #[serde(default = "default_checkpoint_interval")]
    checkpoint_interval: u32,
    tasks: serde_yaml::Mapping,
}

impl WorkflowDefinition {
    /// Load a workflow definition from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a workflow definition from YAML content.
    ///
    /// The `tasks` mapping preserves declaration order, which becomes the
    /// step order used for deterministic tie-breaking in the scheduler.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawDefinition =
            serde_yaml::from_str(content).context("Failed to parse workflow YAML")?;

        let mut steps = Vec::with_capacity(raw.tasks.len());
        for (key, value) in raw.tasks {
            let name: String = serde_yaml::from_value(key).context("Task name must be a string")?;
            let task: TaskSpec = serde_yaml::from_value(value)
                .with_context(|| format!("Failed to parse task '{}'", name))?;
            steps.push(task.into_step(name));
        }

        Ok(Self {
            version: raw.version,
            name: raw.name,
            description: raw.description,
            iterations: raw.iterations,
            strategy: raw.strategy,
            checkpoint_interval: raw.checkpoint_interval,
            steps,
        })
    }

    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// All step names in declaration order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Wire shape of a single task in the YAML mapping.
#[derive(Debug, Deserialize)]
struct TaskSpec {
    /// Target component name (the YAML key is `type`).
    #[serde(rename = "type")]
    component: String,

    operation: String,

    #[serde(default)]
    description: String,

    #[serde(default)]
    parameters: HashMap<String, Value>,

    #[serde(default)]
    dependencies: Vec<String>,

    #[serde(default)]
    on_success: Vec<String>,

    #[serde(default)]
    on_failure: Vec<String>,

    #[serde(default)]
    critical: bool,

    #[serde(default = "default_retry_count")]
    retry_count: u32,

    /// Delay between retries in milliseconds.
    #[serde(default = "default_retry_delay")]
    retry_delay: u64,

    /// Per-step timeout in seconds.
    #[serde(default = "default_step_timeout")]
    timeout: u64,

    #[serde(default)]
    parallel_group: Option<String>,
}

impl TaskSpec {
    fn into_step(self, name: String) -> StepDefinition {
        StepDefinition {
            name,
            component: self.component,
            operation: self.operation,
            description: self.description,
            parameters: self.parameters,
            dependencies: self.dependencies,
            on_success: self.on_success,
            on_failure: self.on_failure,
            critical: self.critical,
            retry: RetryPolicy {
                max_attempts: self.retry_count.max(1),
                initial_delay_ms: self.retry_delay,
                ..RetryPolicy::default()
            },
            timeout_seconds: self.timeout,
            parallel_group: self.parallel_group,
        }
    }
}

fn default_retry_count() -> u32 {
    1
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_step_timeout() -> u64 {
    300
}

/// A single step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name (unique within the definition).
    pub name: String,

    /// Target component.
    pub component: String,

    /// Operation to invoke on the component.
    pub operation: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Keyword-style parameters passed to the operation.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    /// Names of steps that must reach a terminal state first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Steps to prefer next on success (advisory routing).
    #[serde(default)]
    pub on_success: Vec<String>,

    /// Steps to prefer next on failure (advisory routing).
    #[serde(default)]
    pub on_failure: Vec<String>,

    /// An unrecovered failure of a critical step halts the whole run.
    #[serde(default)]
    pub critical: bool,

    /// Retry policy applied when no recovery pattern overrides it.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-step timeout in seconds.
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,

    /// Steps sharing a group have no ordering constraint among themselves.
    #[serde(default)]
    pub parallel_group: Option<String>,
}

impl StepDefinition {
    /// Effective timeout for this step.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// How the step DAG is driven within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One step at a time, honoring dependencies only.
    Sequential,

    /// Every step whose dependencies are satisfied launches concurrently.
    Parallel,

    /// Starts parallel, downgrades fan-out under resource pressure or
    /// repeated step failures.
    Adaptive,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Retry policy for failed step invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the pre-jitter delay before a specific attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
