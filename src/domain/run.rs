//! Run state for a workflow execution.
//!
//! A `WorkflowRun` is the mutable record of one orchestrated execution:
//! its status, current iteration, per-step results, and last error context.
//! Status transitions are monotonic except the Running <-> Paused pair.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single orchestrated execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run.
    pub id: Uuid,

    /// Name of the workflow definition being executed.
    pub workflow: String,

    /// Current status of the run.
    pub status: RunStatus,

    /// Completed iteration count.
    pub iteration: u32,

    /// Step currently executing (if any).
    pub current_step: Option<String>,

    /// Latest result for each step, by step name.
    pub step_results: HashMap<String, StepResult>,

    /// Context of the most recent error, for diagnosis.
    pub last_error: Option<ErrorContext>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state (if it has).
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Create a new run in the NotStarted state.
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.into(),
            status: RunStatus::NotStarted,
            iteration: 0,
            current_step: None,
            step_results: HashMap::new(),
            last_error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Attempt a status transition, rejecting non-monotonic moves.
    ///
    /// Running <-> Paused is the one reversible pair; Completed and Failed
    /// are terminal.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        use RunStatus::*;

        let allowed = match (self.status, next) {
            (NotStarted, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Paused, Failed) => true,
            (current, target) => current == target,
        };

        if allowed {
            self.status = next;
            if next.is_terminal() {
                self.completed_at = Some(Utc::now());
            }
        }
        allowed
    }

    /// Record a step's latest outcome.
    pub fn record_step(&mut self, step: impl Into<String>, result: StepResult) {
        let step = step.into();
        if let Some(ref error) = result.error {
            self.last_error = Some(ErrorContext {
                step: step.clone(),
                message: error.clone(),
                at: Utc::now(),
            });
        }
        self.step_results.insert(step, result);
    }

    /// Whether the run has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a step completed successfully in the latest iteration.
    pub fn is_step_completed(&self, step: &str) -> bool {
        self.step_results
            .get(step)
            .map(|r| r.status == StepStatus::Completed)
            .unwrap_or(false)
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// A step is terminal once it completed, failed, or was skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Latest outcome of a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,

    /// Operation result on success.
    pub output: Option<Value>,

    /// Error message on failure.
    pub error: Option<String>,

    /// Invocation attempts made (including the first).
    pub attempts: u32,

    pub duration_ms: u64,
}

impl StepResult {
    /// A successful result.
    pub fn completed(output: Value, attempts: u32, duration_ms: u64) -> Self {
        Self {
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            attempts,
            duration_ms,
        }
    }

    /// A failed result.
    pub fn failed(error: impl Into<String>, attempts: u32, duration_ms: u64) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            attempts,
            duration_ms,
        }
    }

    /// A skipped result (dependency failed or run aborted).
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            attempts: 0,
            duration_ms: 0,
        }
    }
}

/// Context of the most recent error in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub step: String,
    pub message: String,
    pub at: DateTime<Utc>,
}
