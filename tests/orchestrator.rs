//! Orchestrator integration tests
//!
//! End-to-end runs through the composition root: dependency ordering,
//! iteration accounting, periodic checkpoints, pause/resume, and critical
//! failure handling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use crucible::components::{Component, ComponentError, EchoComponent, Params};
use crucible::domain::RunStatus;
use crucible::orchestrator::{OrchestratorConfig, WorkflowOrchestrator};
use crucible::WorkflowDefinition;

/// Component that appends every operation invocation to a shared log.
struct RecordingComponent {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl RecordingComponent {
    fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            log,
            delay: Duration::from_millis(10),
        }
    }
}

#[async_trait]
impl Component for RecordingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, operation: &str, _params: &Params) -> Result<Value, ComponentError> {
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(operation.to_string());
        Ok(json!({"operation": operation}))
    }
}

fn orchestrator(temp: &TempDir) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(OrchestratorConfig::new(temp.path()))
}

const PIPELINE_YAML: &str = r#"
name: improve
iterations: 1
strategy: parallel
tasks:
  analyze:
    type: stages
    operation: analyze
  generate:
    type: stages
    operation: generate
    dependencies: [analyze]
    parallel_group: candidates
  adapt:
    type: stages
    operation: adapt
    dependencies: [analyze]
    parallel_group: candidates
  evaluate:
    type: stages
    operation: evaluate
    dependencies: [generate, adapt]
"#;

#[tokio::test]
async fn test_dependencies_complete_before_dependents_start() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);

    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator.register_component(
        "stages",
        Arc::new(RecordingComponent::new("stages", log.clone())),
    );

    let definition = WorkflowDefinition::from_yaml(PIPELINE_YAML).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();
    let result = orchestrator.execute_workflow().await.unwrap();

    assert_eq!(result.final_status, RunStatus::Completed);
    assert_eq!(result.iterations_run, 1);

    let order = log.lock().unwrap().clone();
    assert_eq!(order.len(), 4);

    let position = |op: &str| order.iter().position(|o| o == op).unwrap();
    // Topological-order invariant: every dependency strictly before its
    // dependent.
    assert!(position("analyze") < position("generate"));
    assert!(position("analyze") < position("adapt"));
    assert!(position("generate") < position("evaluate"));
    assert!(position("adapt") < position("evaluate"));
}

#[tokio::test]
async fn test_periodic_checkpoints_every_interval() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);
    orchestrator.register_component("stages", Arc::new(EchoComponent::new("stages")));

    let yaml = r#"
name: cadence
iterations: 4
checkpoint_interval: 2
tasks:
  work:
    type: stages
    operation: work
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();
    let result = orchestrator.execute_workflow().await.unwrap();

    assert_eq!(result.final_status, RunStatus::Completed);
    assert_eq!(result.iterations_run, 4);
    assert_eq!(result.successful_iterations, 4);
    // Iterations 2 and 4 produce periodic checkpoints.
    assert_eq!(result.checkpoints_created, 2);

    let stats = orchestrator.get_checkpoint_statistics().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_kind.get("periodic"), Some(&2));
}

#[tokio::test]
async fn test_pause_then_resume_completes() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut component = RecordingComponent::new("stages", log.clone());
    component.delay = Duration::from_millis(80);
    orchestrator.register_component("stages", Arc::new(component));

    let yaml = r#"
name: pausable
iterations: 2
tasks:
  work:
    type: stages
    operation: work
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();

    // Pause while iteration 1's step is in flight; the step finishes, the
    // iteration completes, and the run parks before iteration 2.
    let handle = orchestrator.pause_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.pause();
    });

    let paused = orchestrator.execute_workflow().await.unwrap();
    assert_eq!(paused.final_status, RunStatus::Paused);
    assert_eq!(paused.iterations_run, 1, "exactly one completed iteration");
    assert_eq!(
        orchestrator.get_workflow_status().unwrap().status,
        RunStatus::Paused
    );
    assert_eq!(log.lock().unwrap().len(), 1);

    // Resume drives the run to completion through iteration 2.
    let resumed = orchestrator.resume().await.unwrap();
    assert_eq!(resumed.final_status, RunStatus::Completed);
    assert_eq!(resumed.iterations_run, 2);
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_critical_failure_aborts_with_prefailure_checkpoint() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);
    orchestrator.register_component("stages", Arc::new(EchoComponent::new("stages")));

    let yaml = r#"
name: doomed
iterations: 3
tasks:
  explode:
    type: stages
    operation: fail
    critical: true
    retry_count: 1
  never_reached:
    type: stages
    operation: work
    dependencies: [explode]
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();
    let result = orchestrator.execute_workflow().await.unwrap();

    assert_eq!(result.final_status, RunStatus::Failed);
    assert_eq!(result.failed_iterations, 1);
    assert!(result.iterations_run < 3, "no further iterations after abort");

    let run = orchestrator.get_workflow_status().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.is_some());
    assert_eq!(
        run.step_results["never_reached"].status,
        crucible::domain::StepStatus::Skipped
    );

    let stats = orchestrator.get_checkpoint_statistics().await.unwrap();
    assert_eq!(stats.by_kind.get("prefailure"), Some(&1));
}

#[tokio::test]
async fn test_non_critical_failure_keeps_iterating() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);
    orchestrator.register_component("stages", Arc::new(EchoComponent::new("stages")));

    let yaml = r#"
name: tolerant
iterations: 2
tasks:
  solid:
    type: stages
    operation: work
  wobbly:
    type: stages
    operation: fail
    retry_count: 1
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();
    let result = orchestrator.execute_workflow().await.unwrap();

    // Both iterations run; each records the wobbly step's failure.
    assert_eq!(result.final_status, RunStatus::Completed);
    assert_eq!(result.iterations_run, 2);
    assert_eq!(result.failed_iterations, 2);
    assert_eq!(result.successful_iterations, 0);
}

#[tokio::test]
async fn test_initialize_rejects_invalid_definition() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);
    orchestrator.register_component("stages", Arc::new(EchoComponent::new("stages")));

    let yaml = r#"
name: cyclic
tasks:
  a:
    type: stages
    operation: work
    dependencies: [b]
  b:
    type: stages
    operation: work
    dependencies: [a]
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    let err = orchestrator.initialize_workflow(definition).await.unwrap_err();
    assert!(err.to_string().contains("circular_dependency"));

    // No partial setup: nothing to execute or query.
    assert!(orchestrator.get_workflow_status().is_none());
    assert!(orchestrator.execute_workflow().await.is_err());
}

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);
    orchestrator.register_component("stages", Arc::new(EchoComponent::new("stages")));

    let yaml = r#"
name: tidy
tasks:
  work:
    type: stages
    operation: work
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();
    orchestrator.execute_workflow().await.unwrap();

    orchestrator.shutdown();
    assert_eq!(orchestrator.engine().bus().subscription_count(), 0);

    // Second call is a no-op.
    orchestrator.shutdown();
    assert_eq!(orchestrator.engine().bus().subscription_count(), 0);
}

#[tokio::test]
async fn test_observability_surface() {
    let temp = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&temp);
    orchestrator.register_component("stages", Arc::new(EchoComponent::new("stages")));

    let yaml = r#"
name: observed
iterations: 2
tasks:
  work:
    type: stages
    operation: work
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
    orchestrator.initialize_workflow(definition).await.unwrap();
    orchestrator.execute_workflow().await.unwrap();

    let resilience = orchestrator.get_resilience_status();
    assert!(resilience.contains_key("stages"));
    assert_eq!(resilience["stages"].total_calls, 2);

    let recovery = orchestrator.get_recovery_statistics();
    assert_eq!(recovery.total_attempts, 2);
    assert_eq!(recovery.successful_attempts, 2);

    let resources = orchestrator.get_resource_statistics();
    assert_eq!(resources.active_alerts, 0);
}
