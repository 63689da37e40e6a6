//! crucible - iterative improvement pipeline orchestrator
//!
//! Runs multi-stage improvement pipelines (analyze, generate, adapt,
//! evaluate, validate) composed of pluggable components, and keeps the
//! pipeline alive under partial failure.
//!
//! # Architecture
//!
//! - Workflow definitions are validated (schema, cycles, references)
//!   before the engine will execute them
//! - The engine schedules steps by dependency waves, dispatching each to
//!   its registered component behind a circuit breaker and timeout
//! - Classified failures run through recovery actions (retry, fallback,
//!   restart, escalate) before a step is declared failed
//! - The orchestrator drives N iterations, checkpointing between them so
//!   runs can pause, resume, and restore
//!
//! # Modules
//!
//! - `domain`: data structures (WorkflowDefinition, WorkflowRun, events)
//! - `engine`: event bus, validator, scheduler, workflow engine
//! - `resilience`: circuit breakers and component health
//! - `recovery`: error classification and recovery strategies
//! - `checkpoint`: immutable run snapshots
//! - `monitor`: resource sampling and threshold alerts
//! - `orchestrator`: composition root for iterative runs
//! - `components`: the component contract and collaborator traits
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Validate a workflow definition
//! crucible validate demos/improve.yaml
//!
//! # Run it
//! crucible run demos/improve.yaml
//!
//! # Inspect a past run
//! crucible status <run-id>
//! crucible checkpoints <run-id>
//! ```

pub mod checkpoint;
pub mod cli;
pub mod components;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod journal;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod resilience;

// Re-export main types at crate root for convenience
pub use components::{Component, ComponentError};
pub use domain::{
    EventKind, ExecutionStrategy, RunStatus, StepDefinition, WorkflowDefinition, WorkflowEvent,
    WorkflowRun,
};
pub use engine::{EventBus, ValidationLevel, ValidationResult, WorkflowEngine, WorkflowValidator};
pub use error::EngineError;
pub use orchestrator::{OrchestrationResult, OrchestratorConfig, WorkflowOrchestrator};
