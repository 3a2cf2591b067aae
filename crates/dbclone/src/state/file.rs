//! JSON file run repository.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::RunRepository;
use super::{RunRecord, StatusUpdate, TableState};
use crate::error::Result;

/// Writes the whole [`RunRecord`] to one file after every change.
pub struct FileRunRepository {
    path: PathBuf,
    config_hash: String,
    record: Mutex<Option<RunRecord>>,
}

impl FileRunRepository {
    pub fn new(path: impl Into<PathBuf>, config_hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            config_hash: config_hash.into(),
            record: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to the record for `run_id` and write it out. A record
    /// on disk for a different run, or one that fails its seal, is replaced.
    async fn modify<F>(&self, run_id: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut guard = self.record.lock().await;
        let mut record = match guard.take() {
            Some(record) if record.run_id == run_id => record,
            _ => self.load_or_new(run_id),
        };
        change(&mut record);
        record.save(&self.path)?;
        *guard = Some(record);
        Ok(())
    }

    fn load_or_new(&self, run_id: &str) -> RunRecord {
        if self.path.exists() {
            match RunRecord::load(&self.path) {
                Ok(record) if record.run_id == run_id => return record,
                Ok(record) => {
                    debug!(previous = %record.run_id, "Replacing run record of a previous run")
                }
                Err(e) => warn!(path = %self.path.display(), "Discarding run record: {}", e),
            }
        }
        RunRecord::new(run_id, self.config_hash.clone())
    }
}

#[async_trait]
impl RunRepository for FileRunRepository {
    async fn update_status(&self, run_id: &str, update: &StatusUpdate) -> Result<()> {
        self.modify(run_id, |record| record.apply(update)).await
    }

    async fn record_table(&self, run_id: &str, table: &str, state: &TableState) -> Result<()> {
        self.modify(run_id, |record| {
            record.tables.insert(table.to_string(), state.clone());
        })
        .await
    }

    async fn record_signature(&self, run_id: &str, signature: &str) -> Result<()> {
        self.modify(run_id, |record| record.signature = Some(signature.to_string()))
            .await
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunStatus;

    fn update(status: RunStatus, step: usize) -> StatusUpdate {
        StatusUpdate {
            status,
            progress_percent: step as f64 * 50.0,
            current_step: step,
            total_steps: 2,
        }
    }

    #[tokio::test]
    async fn test_file_repository_persists_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let repo = FileRunRepository::new(&path, "hash");

        repo.update_status("run-1", &update(RunStatus::Processing, 1))
            .await
            .unwrap();
        repo.record_table("run-1", "users", &TableState::completed(3, 2))
            .await
            .unwrap();
        repo.update_status("run-1", &update(RunStatus::Completed, 2))
            .await
            .unwrap();
        repo.record_signature("run-1", "deadbeef").await.unwrap();

        let record = RunRecord::load(&path).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.progress_percent, 100.0);
        assert_eq!(record.tables["users"].rows_transferred, 3);
        assert_eq!(record.signature.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_file_repository_starts_fresh_for_new_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let first = FileRunRepository::new(&path, "hash");
        first
            .record_table("run-1", "users", &TableState::failed("boom"))
            .await
            .unwrap();

        let second = FileRunRepository::new(&path, "hash");
        second
            .update_status("run-2", &update(RunStatus::Queued, 0))
            .await
            .unwrap();

        let record = RunRecord::load(&path).unwrap();
        assert_eq!(record.run_id, "run-2");
        assert!(record.tables.is_empty());
    }
}
