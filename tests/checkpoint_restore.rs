//! Checkpoint integration tests
//!
//! Round-trip fidelity, ordering, and statistics of the file-backed store.

use std::collections::HashMap;

use serde_json::json;
use tempfile::TempDir;

use crucible::checkpoint::{CheckpointKind, CheckpointManager};
use crucible::domain::{RunStatus, StepResult, WorkflowRun};

fn run_at_iteration_three() -> WorkflowRun {
    let mut run = WorkflowRun::new("improve");
    run.transition(RunStatus::Running);
    run.iteration = 3;
    run.record_step(
        "analyze",
        StepResult::completed(json!({"insights": ["slow path"]}), 1, 40),
    );
    run.record_step(
        "generate",
        StepResult::completed(json!(["candidate-a", "candidate-b"]), 2, 310),
    );
    run
}

#[tokio::test]
async fn test_round_trip_preserves_iteration_and_results() {
    let temp = TempDir::new().unwrap();
    let run = run_at_iteration_three();
    let manager = CheckpointManager::open(temp.path(), run.id).unwrap();

    let checkpoint = manager
        .create_checkpoint(&run, HashMap::new(), CheckpointKind::Manual)
        .await
        .unwrap();

    // Mutate the live run after the snapshot.
    let mut live = run.clone();
    live.iteration = 9;
    live.record_step("generate", StepResult::failed("lost connection", 3, 12));
    live.record_step("evaluate", StepResult::completed(json!(0.42), 1, 7));

    let restored = manager.restore_checkpoint(checkpoint.id).await.unwrap();
    assert_eq!(restored.run.iteration, 3);
    assert_eq!(restored.run.step_results.len(), 2);
    assert_eq!(
        restored.run.step_results["analyze"].output,
        Some(json!({"insights": ["slow path"]}))
    );
    assert_eq!(
        restored.run.step_results["generate"].output,
        Some(json!(["candidate-a", "candidate-b"]))
    );
    assert!(!restored.run.step_results.contains_key("evaluate"));
}

#[tokio::test]
async fn test_statistics_count_by_kind() {
    let temp = TempDir::new().unwrap();
    let run = run_at_iteration_three();
    let manager = CheckpointManager::open(temp.path(), run.id).unwrap();

    for _ in 0..3 {
        manager
            .create_checkpoint(&run, HashMap::new(), CheckpointKind::Periodic)
            .await
            .unwrap();
    }
    manager
        .create_checkpoint(&run, HashMap::new(), CheckpointKind::PreFailure)
        .await
        .unwrap();

    let stats = manager.statistics().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_kind.get("periodic"), Some(&3));
    assert_eq!(stats.by_kind.get("prefailure"), Some(&1));
    assert!(stats.total_bytes > 0);
}

#[tokio::test]
async fn test_checkpoints_survive_manager_reopen() {
    let temp = TempDir::new().unwrap();
    let run = run_at_iteration_three();

    let id = {
        let manager = CheckpointManager::open(temp.path(), run.id).unwrap();
        manager
            .create_checkpoint(&run, HashMap::new(), CheckpointKind::Manual)
            .await
            .unwrap()
            .id
        // manager (and its directory lock) dropped here
    };

    let reopened = CheckpointManager::open(temp.path(), run.id).unwrap();
    let restored = reopened.restore_checkpoint(id).await.unwrap();
    assert_eq!(restored.run.iteration, 3);
}
