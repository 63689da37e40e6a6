//! Checkpoint persistence and restore.
//!
//! Checkpoints are immutable snapshots of run state, one JSON file per
//! checkpoint under `<base>/<run_id>/`. Files are written to a temp name and
//! renamed into place, so concurrent readers never observe a partial write.
//! The manager never deletes checkpoints; retention is the orchestrator's
//! call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::WorkflowRun;
use crate::error::EngineError;
use crate::resilience::HealthStatus;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Automatic, every `checkpoint_interval` iterations.
    Periodic,

    /// Requested explicitly.
    Manual,

    /// Taken just before a run transitions to Failed.
    PreFailure,
}

/// An immutable snapshot of run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub iteration: u32,
    pub kind: CheckpointKind,

    /// Full run state at snapshot time.
    pub run: WorkflowRun,

    /// Component health at snapshot time.
    pub health: HashMap<String, HealthStatus>,

    /// Digest of the serialized run state, for integrity checks.
    pub digest: String,
}

/// Aggregate information about a run's checkpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointStatistics {
    pub total: usize,
    pub by_kind: HashMap<String, usize>,
    pub total_bytes: u64,
    pub latest: Option<Uuid>,
}

/// File-backed checkpoint store for one run.
pub struct CheckpointManager {
    dir: PathBuf,

    // Advisory lock held for the manager's lifetime so two processes never
    // write into the same run's checkpoint directory.
    _lock: std::fs::File,
}

impl CheckpointManager {
    /// Create or open the checkpoint directory for a run.
    pub fn open(base_dir: &Path, run_id: Uuid) -> Result<Self, EngineError> {
        let dir = base_dir.join(run_id.to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Checkpoint(format!("create {}: {}", dir.display(), e)))?;

        let lock_path = dir.join(".lock");
        let lock = std::fs::File::create(&lock_path)
            .map_err(|e| EngineError::Checkpoint(format!("create lock file: {}", e)))?;
        lock.try_lock_exclusive().map_err(|e| {
            EngineError::Checkpoint(format!("checkpoint dir already locked: {}", e))
        })?;

        Ok(Self { dir, _lock: lock })
    }

    /// Directory this manager writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the given run state under a new id and timestamp.
    pub async fn create_checkpoint(
        &self,
        run: &WorkflowRun,
        health: HashMap<String, HealthStatus>,
        kind: CheckpointKind,
    ) -> Result<Checkpoint, EngineError> {
        let run_json = serde_json::to_string(run)
            .map_err(|e| EngineError::Checkpoint(format!("serialize run: {}", e)))?;

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            iteration: run.iteration,
            kind,
            run: run.clone(),
            health,
            digest: digest(&run_json),
        };

        let json = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| EngineError::Checkpoint(format!("serialize checkpoint: {}", e)))?;

        // Write-then-rename keeps the final file immutable and complete.
        let final_path = self.path_for(checkpoint.id);
        let tmp_path = self.dir.join(format!(".{}.tmp", checkpoint.id));
        fs::write(&tmp_path, &json)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("write {}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("rename checkpoint: {}", e)))?;

        info!(
            checkpoint_id = %checkpoint.id,
            iteration = checkpoint.iteration,
            kind = ?checkpoint.kind,
            "checkpoint created"
        );

        Ok(checkpoint)
    }

    /// Load a checkpoint by id.
    pub async fn restore_checkpoint(&self, id: Uuid) -> Result<Checkpoint, EngineError> {
        let path = self.path_for(id);
        let json = fs::read(&path)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("read {}: {}", path.display(), e)))?;

        let checkpoint: Checkpoint = serde_json::from_slice(&json)
            .map_err(|e| EngineError::Checkpoint(format!("parse {}: {}", path.display(), e)))?;

        debug!(checkpoint_id = %id, iteration = checkpoint.iteration, "checkpoint restored");
        Ok(checkpoint)
    }

    /// Load the most recent checkpoint, if any exist.
    pub async fn restore_latest(&self) -> Result<Option<Checkpoint>, EngineError> {
        let mut checkpoints = self.list_checkpoints().await?;
        Ok(checkpoints.pop())
    }

    /// All checkpoints, oldest first.
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, EngineError> {
        let mut checkpoints = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| EngineError::Checkpoint(format!("read dir: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::Checkpoint(format!("read dir entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read(&path)
                .await
                .map_err(|e| EngineError::Checkpoint(format!("read {}: {}", path.display(), e)))?;
            let checkpoint: Checkpoint = serde_json::from_slice(&json)
                .map_err(|e| EngineError::Checkpoint(format!("parse {}: {}", path.display(), e)))?;
            checkpoints.push(checkpoint);
        }

        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }

    /// Counts by kind and aggregate size on disk.
    pub async fn statistics(&self) -> Result<CheckpointStatistics, EngineError> {
        let checkpoints = self.list_checkpoints().await?;

        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut total_bytes = 0u64;
        for checkpoint in &checkpoints {
            let kind = format!("{:?}", checkpoint.kind).to_lowercase();
            *by_kind.entry(kind).or_default() += 1;

            if let Ok(meta) = fs::metadata(self.path_for(checkpoint.id)).await {
                total_bytes += meta.len();
            }
        }

        Ok(CheckpointStatistics {
            total: checkpoints.len(),
            by_kind,
            total_bytes,
            latest: checkpoints.last().map(|c| c.id),
        })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

/// Digest of snapshot content (first 16 hex chars of SHA-256).
fn digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
