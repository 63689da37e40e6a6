//! The workflow engine: component registry, definitions, and DAG execution.
//!
//! Holds component registrations and validated step DAGs, and executes a
//! single pass over a workflow's steps either sequentially or as spawned
//! tasks. Step invocations are routed through the resilience layer (circuit
//! breaker + timeout) and the recovery manager (retry/fallback/restart/
//! escalate) when those are attached.
//!
//! Event publication per run is ordered and exactly-once: WorkflowStarted,
//! then per step StepStarted and StepCompleted or StepFailed, then
//! WorkflowCompleted or WorkflowFailed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::components::Component;
use crate::domain::{
    EventKind, RunStatus, StepDefinition, StepResult, WorkflowDefinition, WorkflowEvent,
    WorkflowRun,
};
use crate::engine::bus::EventBus;
use crate::engine::scheduler::{batch_wave, build_execution_plan};
use crate::error::EngineError;
use crate::recovery::{RecoveryManager, RecoveryStrategy};
use crate::resilience::ResilienceManager;

/// Outcome of one pass over a workflow's step DAG.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Name of the critical step whose failure aborted the pass.
    pub critical_failure: Option<String>,

    /// The pass stopped early on a pause request.
    pub paused: bool,
}

impl PassOutcome {
    /// A pass succeeded when nothing failed and it was not cut short.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.critical_failure.is_none() && !self.paused
    }
}

/// Registry plus executor for workflow definitions.
pub struct WorkflowEngine {
    components: RwLock<HashMap<String, Arc<dyn Component>>>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    validated: RwLock<HashSet<String>>,
    bus: EventBus,
    resilience: Option<Arc<ResilienceManager>>,
    recovery: Option<Arc<RecoveryManager>>,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            validated: RwLock::new(HashSet::new()),
            bus: EventBus::new(),
            resilience: None,
            recovery: None,
        }
    }

    /// Route step invocations through a resilience manager.
    pub fn with_resilience(mut self, resilience: Arc<ResilienceManager>) -> Self {
        self.resilience = Some(resilience);
        self
    }

    /// Apply recovery strategies to failing step invocations.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// The engine's event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register a component. Idempotent; a later call replaces the binding.
    pub fn register_component(&self, name: impl Into<String>, component: Arc<dyn Component>) {
        let name = name.into();
        debug!(component = %name, "registering component");
        self.components
            .write()
            .expect("component registry poisoned")
            .insert(name, component);
    }

    /// Look up a registered component.
    pub fn component(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components
            .read()
            .expect("component registry poisoned")
            .get(name)
            .cloned()
    }

    /// Store a definition. Rejects duplicate step names; dependency
    /// existence is the validator's concern.
    ///
    /// Re-defining an id replaces the stored definition and drops its
    /// validated mark.
    pub fn define_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.name.as_str()) {
                let mut result = crate::engine::validator::ValidationResult::default();
                result.push_step("duplicate_step", &step.name, "step name is not unique");
                return Err(EngineError::Validation(crate::error::ValidationFailure {
                    result,
                }));
            }
        }

        let id = definition.name.clone();
        self.validated
            .write()
            .expect("validated set poisoned")
            .remove(&id);
        self.definitions
            .write()
            .expect("definition map poisoned")
            .insert(id, Arc::new(definition));
        Ok(())
    }

    /// Fetch a stored definition.
    pub fn definition(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .expect("definition map poisoned")
            .get(id)
            .cloned()
    }

    /// Mark a definition as validated; execution refuses unvalidated ones.
    pub fn mark_validated(&self, id: &str) -> Result<(), EngineError> {
        if self.definition(id).is_none() {
            return Err(EngineError::UnknownWorkflow(id.to_string()));
        }
        self.validated
            .write()
            .expect("validated set poisoned")
            .insert(id.to_string());
        Ok(())
    }

    fn is_validated(&self, id: &str) -> bool {
        self.validated
            .read()
            .expect("validated set poisoned")
            .contains(id)
    }

    /// Execute a workflow synchronously: one step completes before the next
    /// starts.
    pub async fn execute_workflow(&self, id: &str) -> Result<WorkflowRun, EngineError> {
        self.execute_with_concurrency(id, 1).await
    }

    /// Execute a workflow with every eligible step running as its own
    /// concurrently-polled unit of work.
    pub async fn execute_workflow_async(&self, id: &str) -> Result<WorkflowRun, EngineError> {
        self.execute_with_concurrency(id, usize::MAX).await
    }

    #[instrument(skip(self), fields(workflow = %id))]
    async fn execute_with_concurrency(
        &self,
        id: &str,
        concurrency: usize,
    ) -> Result<WorkflowRun, EngineError> {
        let definition = self
            .definition(id)
            .ok_or_else(|| EngineError::UnknownWorkflow(id.to_string()))?;

        let mut run = WorkflowRun::new(id);
        self.bus.publish(WorkflowEvent::run_scoped(
            run.id,
            EventKind::WorkflowStarted,
            format!("Workflow '{}' started", id),
        ));

        // An unvalidated definition fails the run instead of erroring out
        // of the call.
        if !self.is_validated(id) {
            warn!(workflow = %id, "executing unvalidated definition refused");
            run.transition(RunStatus::Running);
            run.last_error = Some(crate::domain::ErrorContext {
                step: String::new(),
                message: EngineError::NotValidated(id.to_string()).to_string(),
                at: chrono::Utc::now(),
            });
            run.transition(RunStatus::Failed);
            self.bus.publish(WorkflowEvent::run_scoped(
                run.id,
                EventKind::WorkflowFailed,
                format!("Workflow '{}' failed: definition not validated", id),
            ));
            return Ok(run);
        }

        run.transition(RunStatus::Running);
        let outcome = self
            .run_pass(&definition, &mut run, concurrency, None, false)
            .await;

        match outcome {
            Ok(outcome) if outcome.critical_failure.is_none() && outcome.failed == 0 => {
                run.transition(RunStatus::Completed);
                self.bus.publish(WorkflowEvent::run_scoped(
                    run.id,
                    EventKind::WorkflowCompleted,
                    format!("Workflow '{}' completed", id),
                ));
            }
            Ok(outcome) => {
                // Non-critical failures leave the run completed-with-errors
                // at engine level only if nothing critical broke.
                if outcome.critical_failure.is_some() {
                    run.transition(RunStatus::Failed);
                    self.bus.publish(WorkflowEvent::run_scoped(
                        run.id,
                        EventKind::WorkflowFailed,
                        format!("Workflow '{}' failed", id),
                    ));
                } else {
                    run.transition(RunStatus::Completed);
                    self.bus.publish(WorkflowEvent::run_scoped(
                        run.id,
                        EventKind::WorkflowCompleted,
                        format!(
                            "Workflow '{}' completed with {} failed step(s)",
                            id, outcome.failed
                        ),
                    ));
                }
            }
            Err(err) => {
                error!(workflow = %id, error = %err, "workflow pass failed");
                run.last_error = Some(crate::domain::ErrorContext {
                    step: String::new(),
                    message: err.to_string(),
                    at: chrono::Utc::now(),
                });
                run.transition(RunStatus::Failed);
                self.bus.publish(WorkflowEvent::run_scoped(
                    run.id,
                    EventKind::WorkflowFailed,
                    format!("Workflow '{}' failed: {}", id, err),
                ));
            }
        }

        Ok(run)
    }

    /// One pass over the step DAG. Used directly by the orchestrator, which
    /// owns the surrounding workflow-level events and iteration loop.
    ///
    /// A step becomes eligible once every named dependency is terminal;
    /// steps whose dependency failed or was skipped are recorded as skipped.
    /// On a critical failure no further steps start. The cancellation token
    /// is consulted only between launch batches, never mid-step.
    pub(crate) async fn run_pass(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        concurrency: usize,
        cancel: Option<&CancellationToken>,
        resume_completed: bool,
    ) -> Result<PassOutcome, EngineError> {
        // Unresolvable components fail the run up front: every step target
        // must be registered before anything starts.
        for step in &definition.steps {
            if self.component(&step.component).is_none() {
                return Err(EngineError::UnregisteredComponent {
                    step: step.name.clone(),
                    component: step.component.clone(),
                });
            }
        }

        let plan = build_execution_plan(&definition.steps)?;
        let mut outcome = PassOutcome::default();

        // Step results from this pass only; dependency checks must not see
        // results left over from a previous iteration.
        let mut pass_status: HashMap<String, crate::domain::StepStatus> = HashMap::new();

        // Resuming a partially-executed pass: steps that already completed
        // keep their recorded results and are not re-invoked.
        if resume_completed {
            for (name, result) in &run.step_results {
                if result.status == crate::domain::StepStatus::Completed {
                    pass_status.insert(name.clone(), result.status);
                    outcome.completed += 1;
                }
            }
        }

        'waves: for wave in &plan {
            for batch in batch_wave(wave, concurrency) {
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        outcome.paused = true;
                        break 'waves;
                    }
                }

                // Partition the batch into runnable steps and steps whose
                // dependencies did not complete.
                let mut runnable: Vec<&StepDefinition> = Vec::new();
                for &step in &batch {
                    if pass_status.contains_key(step.name.as_str()) {
                        continue; // already carried over from a paused pass
                    }
                    let blocked = step.dependencies.iter().find(|dep| {
                        pass_status
                            .get(dep.as_str())
                            .map(|s| *s != crate::domain::StepStatus::Completed)
                            .unwrap_or(false)
                    });
                    match blocked {
                        Some(dep) => {
                            let result =
                                StepResult::skipped(format!("dependency '{}' did not complete", dep));
                            pass_status.insert(step.name.clone(), result.status);
                            run.record_step(&step.name, result);
                            outcome.skipped += 1;
                        }
                        None => runnable.push(step),
                    }
                }

                if let Some(first) = runnable.first() {
                    run.current_step = Some(first.name.clone());
                }

                let run_id = run.id;
                let step_futures: Vec<_> = runnable
                    .into_iter()
                    .map(|step| async move {
                        let result = self.execute_step(run_id, step).await;
                        (step.name.as_str(), step.critical, result)
                    })
                    .collect();

                for (name, critical, result) in join_all(step_futures).await {
                    let failed = result.status == crate::domain::StepStatus::Failed;
                    pass_status.insert(name.to_string(), result.status);
                    run.record_step(name, result);

                    if failed {
                        outcome.failed += 1;
                        if critical {
                            outcome.critical_failure = Some(name.to_string());
                        }
                    } else {
                        outcome.completed += 1;
                    }
                }

                // A critical failure lets in-flight steps finish (they just
                // did, above) but starts nothing further.
                if outcome.critical_failure.is_some() {
                    break 'waves;
                }
            }
        }

        // After a critical failure everything never reached is recorded as
        // skipped. A pause leaves unreached steps untouched so resume can
        // pick them up.
        if let Some(ref culprit) = outcome.critical_failure {
            let reason = format!("critical step '{}' failed", culprit);
            for step in &definition.steps {
                if !pass_status.contains_key(step.name.as_str()) {
                    pass_status.insert(step.name.clone(), crate::domain::StepStatus::Skipped);
                    run.record_step(&step.name, StepResult::skipped(reason.clone()));
                    outcome.skipped += 1;
                }
            }
        }

        run.current_step = None;
        Ok(outcome)
    }

    /// Invoke one step through the resilience and recovery layers.
    async fn execute_step(&self, run_id: Uuid, step: &StepDefinition) -> StepResult {
        let started = Instant::now();
        self.bus.publish(WorkflowEvent::step_scoped(
            run_id,
            &step.name,
            EventKind::StepStarted,
            format!("Step '{}' dispatching to '{}.{}'", step.name, step.component, step.operation),
        ));

        // The registry was checked before the pass started; a missing entry
        // here means it was yanked mid-run, which still fails the step.
        let Some(component) = self.component(&step.component) else {
            let result = StepResult::failed(
                format!("component '{}' is not registered", step.component),
                0,
                started.elapsed().as_millis() as u64,
            );
            self.publish_step_outcome(run_id, step, &result);
            return result;
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let outcome = self.invoke_with_layers(step, component, &attempts).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::SeqCst).max(1);

        let result = match outcome {
            Ok(output) => {
                info!(step = %step.name, attempts, duration_ms, "step completed");
                StepResult::completed(output, attempts, duration_ms)
            }
            Err(err) => {
                error!(step = %step.name, attempts, error = %err, "step failed");
                StepResult::failed(err.to_string(), attempts, duration_ms)
            }
        };

        self.publish_step_outcome(run_id, step, &result);
        result
    }

    async fn invoke_with_layers(
        &self,
        step: &StepDefinition,
        component: Arc<dyn Component>,
        attempts: &Arc<AtomicU32>,
    ) -> Result<Value, EngineError> {
        let timeout = step.timeout();
        let params: crate::components::Params = step.parameters.clone().into_iter().collect();

        let invoke_once = || {
            let component = Arc::clone(&component);
            let params = params.clone();
            let operation = step.operation.clone();
            let component_name = step.component.clone();
            let resilience = self.resilience.clone();
            let attempts = Arc::clone(attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                match resilience {
                    Some(resilience) => {
                        resilience
                            .execute_with_resilience(&component_name, &operation, timeout, || async {
                                component.call(&operation, &params).await
                            })
                            .await
                    }
                    None => {
                        let started = Instant::now();
                        match tokio::time::timeout(timeout, component.call(&operation, &params))
                            .await
                        {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(EngineError::Component(err)),
                            Err(_) => Err(EngineError::Timeout {
                                component: component_name.clone(),
                                operation: operation.clone(),
                                elapsed_ms: started.elapsed().as_millis() as u64,
                            }),
                        }
                    }
                }
            }
        };

        match &self.recovery {
            Some(recovery) => {
                // The step's own retry policy is the default strategy, so
                // exactly one retry loop governs the invocation.
                let default = RecoveryStrategy::from_retry_policy(&step.retry);
                recovery
                    .execute_with_recovery(&step.component, &step.operation, &default, invoke_once)
                    .await
            }
            None => {
                // Bare engine: the step's retry policy, applied directly.
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match invoke_once().await {
                        Ok(value) => return Ok(value),
                        Err(err) => {
                            if step.retry.should_retry(attempt) {
                                let delay = step.retry.delay_for_attempt(attempt);
                                warn!(
                                    step = %step.name,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %err,
                                    "step failed, retrying"
                                );
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn publish_step_outcome(&self, run_id: Uuid, step: &StepDefinition, result: &StepResult) {
        let (kind, detail) = match result.status {
            crate::domain::StepStatus::Completed => (
                EventKind::StepCompleted,
                format!("Step '{}' completed in {}ms", step.name, result.duration_ms),
            ),
            _ => (
                EventKind::StepFailed,
                format!(
                    "Step '{}' failed after {} attempt(s): {}",
                    step.name,
                    result.attempts,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        };
        self.bus
            .publish(WorkflowEvent::step_scoped(run_id, &step.name, kind, detail));
    }

    /// Unsubscribe all event handlers and clear per-run state. Idempotent;
    /// a second call is a no-op and removed handlers are not re-invoked.
    pub fn cleanup(&self) {
        self.bus.clear();
    }
}
