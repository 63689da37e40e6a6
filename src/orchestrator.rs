//! Orchestration of iterative improvement runs.
//!
//! The orchestrator is the composition root: it validates the definition,
//! binds it into the engine, then drives N iterations of the step DAG,
//! choosing concurrency from the execution strategy and current resource
//! pressure, applying recovery on failures, checkpointing every
//! `checkpoint_interval` iterations, and aggregating results.
//!
//! A pause request is a flag consulted between steps and iterations; any
//! in-flight step finishes first. Resume continues from the next unexecuted
//! step or iteration recorded in memory, or from the last checkpoint.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointKind, CheckpointManager, CheckpointStatistics};
use crate::components::Component;
use crate::domain::{
    EventKind, ExecutionStrategy, RunStatus, WorkflowDefinition, WorkflowEvent, WorkflowRun,
};
use crate::engine::{ValidationLevel, WorkflowEngine, WorkflowValidator};
use crate::error::EngineError;
use crate::journal::RunJournal;
use crate::monitor::{MonitorConfig, PressureLevel, ResourceMonitor, ResourceStatistics};
use crate::recovery::{RecoveryManager, RecoveryStats};
use crate::resilience::{ComponentStatus, ResilienceConfig, ResilienceManager};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// State directory; runs and checkpoints live underneath.
    pub home: PathBuf,

    pub resilience: ResilienceConfig,
    pub monitor: MonitorConfig,

    /// Write a JSONL journal of lifecycle events per run.
    pub journal: bool,
}

impl OrchestratorConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            resilience: ResilienceConfig::default(),
            monitor: MonitorConfig::default(),
            journal: true,
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }
}

/// Aggregate result of an orchestrated run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub run_id: Uuid,
    pub workflow: String,
    pub iterations_run: u32,
    pub successful_iterations: u32,
    pub failed_iterations: u32,
    pub checkpoints_created: u32,
    pub duration_ms: u64,
    pub final_status: RunStatus,
}

/// Handle that lets another task request a pause.
#[derive(Clone)]
pub struct PauseHandle(CancellationToken);

impl PauseHandle {
    pub fn pause(&self) {
        self.0.cancel();
    }
}

struct ActiveWorkflow {
    definition: Arc<WorkflowDefinition>,
    run: WorkflowRun,
    checkpoints: CheckpointManager,
    checkpoints_created: u32,
    successful_iterations: u32,
    failed_iterations: u32,
    elapsed_ms: u64,

    /// Consecutive iterations with at least one failed step, for adaptive
    /// downgrade.
    failure_streak: u32,

    /// The last pass was paused mid-iteration; resume must not re-run its
    /// completed steps.
    partial_iteration: bool,
}

/// Composition root for orchestrated workflow runs.
pub struct WorkflowOrchestrator {
    config: OrchestratorConfig,
    engine: Arc<WorkflowEngine>,
    validator: WorkflowValidator,
    resilience: Arc<ResilienceManager>,
    recovery: Arc<RecoveryManager>,
    monitor: Arc<ResourceMonitor>,
    active: Option<ActiveWorkflow>,
    pause_token: Mutex<CancellationToken>,
}

impl WorkflowOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let resilience = Arc::new(ResilienceManager::new(config.resilience.clone()));
        let recovery = Arc::new(RecoveryManager::new());
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        let engine = Arc::new(
            WorkflowEngine::new()
                .with_resilience(Arc::clone(&resilience))
                .with_recovery(Arc::clone(&recovery)),
        );

        Self {
            config,
            engine,
            validator: WorkflowValidator::new(),
            resilience,
            recovery,
            monitor,
            active: None,
            pause_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// The underlying engine (component registry, event bus).
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// The recovery manager, for registering patterns and fallbacks.
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// The validator, for registering custom validators.
    pub fn validator_mut(&mut self) -> &mut WorkflowValidator {
        &mut self.validator
    }

    /// The resource monitor.
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Register a component with the engine and as a restart target.
    pub fn register_component(&self, name: impl Into<String>, component: Arc<dyn Component>) {
        let name = name.into();
        self.engine.register_component(name.clone(), Arc::clone(&component));
        self.recovery.register_restart_target(name, component);
    }

    /// Validate a definition at FULL level and bind it for execution.
    ///
    /// On validation failure nothing is stored: no engine binding, no run
    /// state, no checkpoint directory.
    #[instrument(skip(self, definition), fields(workflow = %definition.name))]
    pub async fn initialize_workflow(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<(), EngineError> {
        self.validator
            .validate_strict(&definition, ValidationLevel::Full, false)?;

        let id = definition.name.clone();
        self.engine.define_workflow(definition.clone())?;
        self.engine.mark_validated(&id)?;

        let run = WorkflowRun::new(&id);
        let checkpoints = CheckpointManager::open(&self.config.checkpoints_dir(), run.id)?;

        if self.config.journal {
            let journal = RunJournal::open(&self.config.runs_dir(), run.id).await?;
            journal.attach(self.engine.bus(), run.id);
        }

        info!(run_id = %run.id, "workflow initialized");
        self.active = Some(ActiveWorkflow {
            definition: Arc::new(definition),
            run,
            checkpoints,
            checkpoints_created: 0,
            successful_iterations: 0,
            failed_iterations: 0,
            elapsed_ms: 0,
            failure_streak: 0,
            partial_iteration: false,
        });

        *self.pause_token.lock().expect("pause token poisoned") = CancellationToken::new();
        Ok(())
    }

    /// Run the configured iterations of the initialized workflow.
    pub async fn execute_workflow(&mut self) -> Result<OrchestrationResult, EngineError> {
        {
            let active = self
                .active
                .as_mut()
                .ok_or_else(|| EngineError::UnknownWorkflow("no workflow initialized".into()))?;

            if active.run.status == RunStatus::NotStarted {
                active.run.transition(RunStatus::Running);
                self.engine.bus().publish(WorkflowEvent::run_scoped(
                    active.run.id,
                    EventKind::WorkflowStarted,
                    format!("Workflow '{}' started", active.run.workflow),
                ));
            }
        }

        self.run_iterations().await
    }

    /// Request a pause; consulted between steps and iterations.
    pub fn pause(&self) {
        self.pause_token
            .lock()
            .expect("pause token poisoned")
            .cancel();
    }

    /// A clonable handle for pausing from another task.
    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle(
            self.pause_token
                .lock()
                .expect("pause token poisoned")
                .clone(),
        )
    }

    /// Resume a paused run from the next unexecuted step or iteration.
    pub async fn resume(&mut self) -> Result<OrchestrationResult, EngineError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| EngineError::UnknownWorkflow("no workflow initialized".into()))?;

        if active.run.status != RunStatus::Paused {
            return Err(EngineError::UnknownWorkflow(format!(
                "run is {:?}, not paused",
                active.run.status
            )));
        }

        active.run.transition(RunStatus::Running);
        *self.pause_token.lock().expect("pause token poisoned") = CancellationToken::new();
        info!(iteration = active.run.iteration, "resuming run");

        self.run_iterations().await
    }

    /// Restore run state from the latest checkpoint and continue from its
    /// iteration.
    pub async fn resume_from_checkpoint(&mut self) -> Result<OrchestrationResult, EngineError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| EngineError::UnknownWorkflow("no workflow initialized".into()))?;

        let checkpoint = active
            .checkpoints
            .restore_latest()
            .await?
            .ok_or_else(|| EngineError::Checkpoint("no checkpoint to restore".into()))?;

        info!(
            checkpoint_id = %checkpoint.id,
            iteration = checkpoint.iteration,
            "restored run from checkpoint"
        );
        active.run = checkpoint.run;
        active.partial_iteration = false;
        if active.run.status == RunStatus::Paused {
            active.run.transition(RunStatus::Running);
        }

        *self.pause_token.lock().expect("pause token poisoned") = CancellationToken::new();
        self.run_iterations().await
    }

    async fn run_iterations(&mut self) -> Result<OrchestrationResult, EngineError> {
        let token = self
            .pause_token
            .lock()
            .expect("pause token poisoned")
            .clone();
        let started = Instant::now();

        let active = self
            .active
            .as_mut()
            .ok_or_else(|| EngineError::UnknownWorkflow("no workflow initialized".into()))?;
        let definition = Arc::clone(&active.definition);
        let bus = self.engine.bus().clone();

        let mut outcome_status = active.run.status;

        while active.run.iteration < definition.iterations {
            if token.is_cancelled() {
                active.run.transition(RunStatus::Paused);
                outcome_status = RunStatus::Paused;
                info!(iteration = active.run.iteration, "run paused");
                break;
            }

            let concurrency = concurrency_for(
                definition.strategy,
                self.monitor.pressure(),
                active.failure_streak,
            );

            // Surface active resource alerts on the run's event stream.
            for alert in self.monitor.active_alerts() {
                bus.publish(WorkflowEvent::run_scoped(
                    active.run.id,
                    EventKind::ResourceAlert,
                    alert.message.clone(),
                ));
            }

            let resume_partial = active.partial_iteration;
            active.partial_iteration = false;

            let pass = self
                .engine
                .run_pass(
                    &definition,
                    &mut active.run,
                    concurrency,
                    Some(&token),
                    resume_partial,
                )
                .await;

            let pass = match pass {
                Ok(pass) => pass,
                Err(err) => {
                    warn!(error = %err, "iteration pass failed");
                    active.run.last_error = Some(crate::domain::ErrorContext {
                        step: String::new(),
                        message: err.to_string(),
                        at: chrono::Utc::now(),
                    });
                    active.run.transition(RunStatus::Failed);
                    bus.publish(WorkflowEvent::run_scoped(
                        active.run.id,
                        EventKind::WorkflowFailed,
                        format!("Workflow '{}' failed: {}", active.run.workflow, err),
                    ));
                    outcome_status = RunStatus::Failed;
                    break;
                }
            };

            if pass.paused {
                active.partial_iteration = true;
                active.run.transition(RunStatus::Paused);
                outcome_status = RunStatus::Paused;
                info!(iteration = active.run.iteration, "run paused mid-iteration");
                break;
            }

            active.run.iteration += 1;
            bus.publish(WorkflowEvent::run_scoped(
                active.run.id,
                EventKind::IterationCompleted,
                format!(
                    "Iteration {}/{} completed",
                    active.run.iteration, definition.iterations
                ),
            ));

            if pass.failed == 0 && pass.critical_failure.is_none() {
                active.successful_iterations += 1;
                active.failure_streak = 0;
            } else {
                active.failed_iterations += 1;
                active.failure_streak += 1;
            }

            if let Some(step) = pass.critical_failure {
                let reason = active
                    .run
                    .step_results
                    .get(&step)
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "recovery actions exhausted".to_string());
                let fatal = EngineError::Fatal {
                    step: step.clone(),
                    reason,
                };
                active.run.last_error = Some(crate::domain::ErrorContext {
                    step: step.clone(),
                    message: fatal.to_string(),
                    at: chrono::Utc::now(),
                });

                // Snapshot what we know before declaring the run dead.
                let checkpoint = active
                    .checkpoints
                    .create_checkpoint(
                        &active.run,
                        self.resilience
                            .status()
                            .into_iter()
                            .map(|(name, status)| (name, status.health))
                            .collect(),
                        CheckpointKind::PreFailure,
                    )
                    .await?;
                active.checkpoints_created += 1;
                bus.publish(WorkflowEvent::run_scoped(
                    active.run.id,
                    EventKind::CheckpointCreated,
                    format!("Pre-failure checkpoint {}", checkpoint.id),
                ));

                active.run.transition(RunStatus::Failed);
                bus.publish(WorkflowEvent::run_scoped(
                    active.run.id,
                    EventKind::WorkflowFailed,
                    format!(
                        "Workflow '{}' failed: critical step '{}'",
                        active.run.workflow, step
                    ),
                ));
                outcome_status = RunStatus::Failed;
                break;
            }

            if active.run.iteration % definition.checkpoint_interval == 0 {
                let checkpoint = active
                    .checkpoints
                    .create_checkpoint(
                        &active.run,
                        self.resilience
                            .status()
                            .into_iter()
                            .map(|(name, status)| (name, status.health))
                            .collect(),
                        CheckpointKind::Periodic,
                    )
                    .await?;
                active.checkpoints_created += 1;
                bus.publish(WorkflowEvent::run_scoped(
                    active.run.id,
                    EventKind::CheckpointCreated,
                    format!(
                        "Periodic checkpoint {} at iteration {}",
                        checkpoint.id, active.run.iteration
                    ),
                ));
            }

            outcome_status = RunStatus::Running;
        }

        if outcome_status == RunStatus::Running {
            active.run.transition(RunStatus::Completed);
            bus.publish(WorkflowEvent::run_scoped(
                active.run.id,
                EventKind::WorkflowCompleted,
                format!(
                    "Workflow '{}' completed after {} iteration(s)",
                    active.run.workflow, active.run.iteration
                ),
            ));
            outcome_status = RunStatus::Completed;
        }

        active.elapsed_ms += started.elapsed().as_millis() as u64;

        Ok(OrchestrationResult {
            run_id: active.run.id,
            workflow: active.run.workflow.clone(),
            iterations_run: active.run.iteration,
            successful_iterations: active.successful_iterations,
            failed_iterations: active.failed_iterations,
            checkpoints_created: active.checkpoints_created,
            duration_ms: active.elapsed_ms,
            final_status: outcome_status,
        })
    }

    /// Take a manual checkpoint of the current run state.
    pub async fn create_checkpoint(&mut self) -> Result<Uuid, EngineError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| EngineError::UnknownWorkflow("no workflow initialized".into()))?;

        let checkpoint = active
            .checkpoints
            .create_checkpoint(
                &active.run,
                self.resilience
                    .status()
                    .into_iter()
                    .map(|(name, status)| (name, status.health))
                    .collect(),
                CheckpointKind::Manual,
            )
            .await?;
        active.checkpoints_created += 1;
        Ok(checkpoint.id)
    }

    // -- observability surface ---------------------------------------------

    /// Current run state, if a workflow is initialized.
    pub fn get_workflow_status(&self) -> Option<WorkflowRun> {
        self.active.as_ref().map(|a| a.run.clone())
    }

    /// Per-component breaker and health snapshot.
    pub fn get_resilience_status(&self) -> std::collections::HashMap<String, ComponentStatus> {
        self.resilience.status()
    }

    /// Recovery attempt counters.
    pub fn get_recovery_statistics(&self) -> RecoveryStats {
        self.recovery.statistics()
    }

    /// Checkpoint counts and sizes for the active run.
    pub async fn get_checkpoint_statistics(&self) -> Result<CheckpointStatistics, EngineError> {
        match self.active {
            Some(ref active) => active.checkpoints.statistics().await,
            None => Ok(CheckpointStatistics::default()),
        }
    }

    /// Rolling resource statistics.
    pub fn get_resource_statistics(&self) -> ResourceStatistics {
        self.monitor.statistics()
    }

    /// Start background monitoring tasks (resource sampling, health checks).
    pub fn start_monitoring(&self) {
        Arc::clone(&self.monitor).start();
        Arc::clone(&self.resilience).start_monitoring();
    }

    /// Stop background tasks and release event subscriptions. Idempotent.
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.resilience.stop_monitoring();
        self.engine.cleanup();
    }
}

/// Concurrency cap for one iteration.
///
/// Adaptive begins fully parallel and downgrades toward sequential under
/// resource pressure or repeated failing iterations, without failing the
/// run.
fn concurrency_for(
    strategy: ExecutionStrategy,
    pressure: PressureLevel,
    failure_streak: u32,
) -> usize {
    match strategy {
        ExecutionStrategy::Sequential => 1,
        ExecutionStrategy::Parallel => usize::MAX,
        ExecutionStrategy::Adaptive => match (pressure, failure_streak) {
            (PressureLevel::Critical, _) => 1,
            (_, streak) if streak >= 3 => 1,
            (PressureLevel::Elevated, _) => 2,
            (_, streak) if streak >= 1 => 2,
            _ => usize::MAX,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_for_sequential_is_one() {
        assert_eq!(
            concurrency_for(ExecutionStrategy::Sequential, PressureLevel::Normal, 0),
            1
        );
    }

    #[test]
    fn test_concurrency_for_parallel_unbounded() {
        assert_eq!(
            concurrency_for(ExecutionStrategy::Parallel, PressureLevel::Critical, 5),
            usize::MAX
        );
    }

    #[test]
    fn test_adaptive_downgrades() {
        // Fully parallel when calm.
        assert_eq!(
            concurrency_for(ExecutionStrategy::Adaptive, PressureLevel::Normal, 0),
            usize::MAX
        );
        // Elevated pressure shrinks fan-out.
        assert_eq!(
            concurrency_for(ExecutionStrategy::Adaptive, PressureLevel::Elevated, 0),
            2
        );
        // Critical pressure goes sequential.
        assert_eq!(
            concurrency_for(ExecutionStrategy::Adaptive, PressureLevel::Critical, 0),
            1
        );
        // Repeated failures downgrade too.
        assert_eq!(
            concurrency_for(ExecutionStrategy::Adaptive, PressureLevel::Normal, 1),
            2
        );
        assert_eq!(
            concurrency_for(ExecutionStrategy::Adaptive, PressureLevel::Normal, 3),
            1
        );
    }
}
