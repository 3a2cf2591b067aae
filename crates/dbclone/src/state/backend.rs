//! Run repository trait and the in-memory implementation.
//!
//! The orchestrator works with `Arc<dyn RunRepository>` and never knows where
//! status transitions end up.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{StatusUpdate, TableState};
use crate::error::Result;

/// Destination for run-status transitions.
///
/// Implementations must be `Send + Sync`; the orchestrator calls them from
/// whichever task finishes a job.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Record a status transition with its progress fields.
    async fn update_status(&self, run_id: &str, update: &StatusUpdate) -> Result<()>;

    /// Record the outcome of one table.
    async fn record_table(&self, _run_id: &str, _table: &str, _state: &TableState) -> Result<()> {
        Ok(())
    }

    /// Attach the audit signature produced on finalize.
    async fn record_signature(&self, _run_id: &str, _signature: &str) -> Result<()> {
        Ok(())
    }

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Keeps every transition in memory, in call order.
#[derive(Debug, Default)]
pub struct MemoryRunRepository {
    updates: Mutex<Vec<(String, StatusUpdate)>>,
    tables: Mutex<HashMap<String, TableState>>,
    signatures: Mutex<Vec<String>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn updates(&self) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .await
            .iter()
            .map(|(_, u)| u.clone())
            .collect()
    }

    pub async fn last(&self) -> Option<StatusUpdate> {
        self.updates.lock().await.last().map(|(_, u)| u.clone())
    }

    pub async fn table(&self, table: &str) -> Option<TableState> {
        self.tables.lock().await.get(table).cloned()
    }

    pub async fn signatures(&self) -> Vec<String> {
        self.signatures.lock().await.clone()
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn update_status(&self, run_id: &str, update: &StatusUpdate) -> Result<()> {
        self.updates
            .lock()
            .await
            .push((run_id.to_string(), update.clone()));
        Ok(())
    }

    async fn record_table(&self, _run_id: &str, table: &str, state: &TableState) -> Result<()> {
        self.tables
            .lock()
            .await
            .insert(table.to_string(), state.clone());
        Ok(())
    }

    async fn record_signature(&self, _run_id: &str, signature: &str) -> Result<()> {
        self.signatures.lock().await.push(signature.to_string());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunStatus;

    #[tokio::test]
    async fn test_memory_repository_keeps_order() {
        let repo = MemoryRunRepository::new();
        for (status, step) in [(RunStatus::Queued, 0), (RunStatus::Processing, 1)] {
            repo.update_status(
                "r",
                &StatusUpdate {
                    status,
                    progress_percent: 0.0,
                    current_step: step,
                    total_steps: 3,
                },
            )
            .await
            .unwrap();
        }
        let updates = repo.updates().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].status, RunStatus::Queued);
        assert_eq!(repo.last().await.map(|u| u.current_step), Some(1));

        repo.record_table("r", "users", &TableState::completed(3, 2))
            .await
            .unwrap();
        assert_eq!(repo.table("users").await.map(|t| t.chunks), Some(2));
        assert_eq!(repo.backend_type(), "memory");
    }
}
