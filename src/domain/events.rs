//! Lifecycle events published on the event bus.
//!
//! Every state change of interest is described by an immutable event.
//! Subscribers (the run journal, external sinks) receive each event
//! at most once per occurrence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Unique identifier for this event.
    pub id: Uuid,

    /// When this event occurred.
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to.
    pub run_id: Uuid,

    /// Step name, for step-scoped events.
    pub step: Option<String>,

    /// What happened.
    pub kind: EventKind,

    /// Human-readable summary.
    pub detail: String,
}

impl WorkflowEvent {
    /// Create a new event with the current timestamp.
    pub fn new(run_id: Uuid, step: Option<String>, kind: EventKind, detail: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step,
            kind,
            detail,
        }
    }

    /// Run-scoped event without a step.
    pub fn run_scoped(run_id: Uuid, kind: EventKind, detail: impl Into<String>) -> Self {
        Self::new(run_id, None, kind, detail.into())
    }

    /// Step-scoped event.
    pub fn step_scoped(
        run_id: Uuid,
        step: impl Into<String>,
        kind: EventKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(run_id, Some(step.into()), kind, detail.into())
    }
}

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A run has started; published exactly once per run.
    WorkflowStarted,

    /// A run completed successfully; exactly once per run.
    WorkflowCompleted,

    /// A run failed; exactly once per run.
    WorkflowFailed,

    /// A step has started execution.
    StepStarted,

    /// A step completed successfully.
    StepCompleted,

    /// A step failed after its configured recovery actions.
    StepFailed,

    /// One improvement iteration finished.
    IterationCompleted,

    /// A checkpoint was written.
    CheckpointCreated,

    /// A resource threshold was crossed.
    ResourceAlert,

    /// A recovery action was applied to a failing call.
    RecoveryApplied,
}
