//! Append-only run journal with file-based persistence.
//!
//! Lifecycle events are stored as newline-delimited JSON (JSONL) for easy
//! inspection. The journal is an observer of the event bus, not a second
//! source of truth: replay exists so the CLI can show what a past run did.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::domain::WorkflowEvent;
use crate::engine::bus::{EventBus, SubscriptionId};
use crate::error::EngineError;

/// JSONL journal for one run.
pub struct RunJournal {
    events_path: PathBuf,
}

impl RunJournal {
    /// Create or open the journal for a run under `base_dir`.
    pub async fn open(base_dir: &Path, run_id: Uuid) -> Result<Self, EngineError> {
        let run_dir = base_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| EngineError::Journal(format!("create {}: {}", run_dir.display(), e)))?;

        Ok(Self {
            events_path: run_dir.join("events.jsonl"),
        })
    }

    /// Path to the events file.
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log.
    pub async fn append(&self, event: &WorkflowEvent) -> Result<(), EngineError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .map_err(|e| {
                EngineError::Journal(format!("open {}: {}", self.events_path.display(), e))
            })?;

        let json = serde_json::to_string(event)
            .map_err(|e| EngineError::Journal(format!("serialize event: {}", e)))?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(|e| EngineError::Journal(format!("write event: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| EngineError::Journal(format!("flush event: {}", e)))?;

        Ok(())
    }

    /// Replay all events in order.
    pub async fn replay(&self) -> Result<Vec<WorkflowEvent>, EngineError> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path).await.map_err(|e| {
            EngineError::Journal(format!("open {}: {}", self.events_path.display(), e))
        })?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| EngineError::Journal(format!("read line: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: WorkflowEvent = serde_json::from_str(&line)
                .map_err(|e| EngineError::Journal(format!("parse event: {}", e)))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Subscribe the journal to a bus and persist this run's events in the
    /// background.
    ///
    /// Returns the subscription id and the writer task handle; the task
    /// ends when the subscription is removed (engine cleanup) or the bus is
    /// dropped.
    pub fn attach(self, bus: &EventBus, run_id: Uuid) -> (SubscriptionId, JoinHandle<()>) {
        let (id, mut rx) = bus.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.run_id != run_id {
                    continue;
                }
                if let Err(err) = self.append(&event).await {
                    warn!(error = %err, "failed to journal event");
                }
            }
        });
        (id, handle)
    }

    /// List all run ids with a journal under `base_dir`.
    pub async fn list_runs(base_dir: &Path) -> Result<Vec<Uuid>, EngineError> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .map_err(|e| EngineError::Journal(format!("read {}: {}", base_dir.display(), e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::Journal(format!("read dir entry: {}", e)))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let journal = RunJournal::open(temp.path(), run_id).await.unwrap();

        journal
            .append(&WorkflowEvent::run_scoped(
                run_id,
                EventKind::WorkflowStarted,
                "start",
            ))
            .await
            .unwrap();
        journal
            .append(&WorkflowEvent::step_scoped(
                run_id,
                "analyze",
                EventKind::StepStarted,
                "step start",
            ))
            .await
            .unwrap();

        let events = journal.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::WorkflowStarted);
        assert_eq!(events[1].step.as_deref(), Some("analyze"));
    }

    #[tokio::test]
    async fn test_replay_empty_journal() {
        let temp = TempDir::new().unwrap();
        let journal = RunJournal::open(temp.path(), Uuid::new_v4()).await.unwrap();
        assert!(journal.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_persists_bus_events() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let journal = RunJournal::open(temp.path(), run_id).await.unwrap();
        let replayer = RunJournal::open(temp.path(), run_id).await.unwrap();

        let bus = EventBus::new();
        let (id, handle) = journal.attach(&bus, run_id);

        bus.publish(WorkflowEvent::run_scoped(
            run_id,
            EventKind::WorkflowStarted,
            "start",
        ));
        // A different run's event must not land in this journal.
        bus.publish(WorkflowEvent::run_scoped(
            Uuid::new_v4(),
            EventKind::WorkflowStarted,
            "other run",
        ));
        bus.publish(WorkflowEvent::run_scoped(
            run_id,
            EventKind::WorkflowCompleted,
            "done",
        ));

        // Close the subscription so the writer task drains and exits.
        bus.unsubscribe(id);
        handle.await.unwrap();

        let events = replayer.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::WorkflowCompleted);
    }

    #[tokio::test]
    async fn test_list_runs() {
        let temp = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        RunJournal::open(temp.path(), a).await.unwrap();
        RunJournal::open(temp.path(), b).await.unwrap();

        let mut runs = RunJournal::list_runs(temp.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(runs, expected);
    }
}
