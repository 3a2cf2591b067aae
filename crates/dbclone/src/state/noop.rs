//! No-op run repository for callers that keep no run records.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::backend::RunRepository;
use super::StatusUpdate;
use crate::error::Result;

/// Discards every transition. Logs once on first use.
#[derive(Debug, Default)]
pub struct NoOpRunRepository {
    noted: AtomicBool,
}

impl NoOpRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for NoOpRunRepository {
    async fn update_status(&self, run_id: &str, update: &StatusUpdate) -> Result<()> {
        if !self.noted.swap(true, Ordering::SeqCst) {
            debug!(run_id, "Run status is not persisted (no-op repository)");
        }
        debug!(run_id, status = %update.status, progress = update.progress_percent, "Run status");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}
