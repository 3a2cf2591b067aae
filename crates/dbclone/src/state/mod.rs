//! Run state: status tracking, the event stream and the audit signature.
//!
//! - [`RunRepository`]: where status transitions go (`NoOp`, `Memory`, `File`)
//! - [`SyncLogger`]: the checkpoint event stream
//! - [`AuditSigner`]: the `sign(run)` hook invoked on finalize
//!
//! [`RunRecord`] is the persisted form used by [`FileRunRepository`]: a JSON
//! file written atomically and sealed with an HMAC so tampering is detected
//! on load.

pub mod backend;
pub mod file;
pub mod logger;
pub mod noop;
pub mod signer;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CloneError, Result};

pub use backend::{MemoryRunRepository, RunRepository};
pub use file::FileRunRepository;
pub use logger::{fields, LogEntry, LogLevel, MemoryLogger, SyncEvent, SyncLogger, TracingLogger};
pub use noop::NoOpRunRepository;
pub use signer::{AuditSigner, HmacAuditSigner};

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `content` under `key`.
pub(crate) fn hmac_hex(key: &[u8], content: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CloneError::Config(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Run-level status as seen by the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal status of a finished batch: cancellation outranks failure.
    pub fn terminal(cancelled: bool, failed_jobs: usize) -> Self {
        if cancelled {
            RunStatus::Cancelled
        } else if failed_jobs > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(RunStatus::Queued),
            "PROCESSING" => Ok(RunStatus::Processing),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            _ => Err(CloneError::Config(format!("Invalid run status: {}", s))),
        }
    }
}

/// One `updateStatus` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: RunStatus,
    /// `processed_jobs / total_jobs` as a percentage.
    pub progress_percent: f64,
    pub current_step: usize,
    pub total_steps: usize,
}

/// Outcome of one table in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-table state kept in a run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    pub status: TableStatus,
    #[serde(default)]
    pub rows_transferred: u64,
    #[serde(default)]
    pub chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TableState {
    pub fn completed(rows_transferred: u64, chunks: usize) -> Self {
        Self {
            status: TableStatus::Completed,
            rows_transferred,
            chunks,
            error: None,
            completed_at: Some(Utc::now()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TableStatus::Failed,
            rows_transferred: 0,
            chunks: 0,
            error: Some(error.into()),
            completed_at: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: TableStatus::Skipped,
            rows_transferred: 0,
            chunks: 0,
            error: None,
            completed_at: None,
        }
    }
}

/// What the audit signer sees when a batch finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub total_jobs: usize,
    pub processed_jobs: usize,
    pub failed_jobs: usize,
    pub rows_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: BTreeMap<String, TableState>,
}

/// Persisted run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,

    /// SHA256 of the configuration; keys the HMAC seal.
    pub config_hash: String,

    pub status: RunStatus,

    #[serde(default)]
    pub progress_percent: f64,

    #[serde(default)]
    pub current_step: usize,

    #[serde(default)]
    pub total_steps: usize,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub tables: BTreeMap<String, TableState>,

    /// Audit signature set on finalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// HMAC-SHA256 over the record with this field cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            config_hash: config_hash.into(),
            status: RunStatus::Queued,
            progress_percent: 0.0,
            current_step: 0,
            total_steps: 0,
            started_at: now,
            updated_at: now,
            tables: BTreeMap::new(),
            signature: None,
            hmac: None,
        }
    }

    pub fn apply(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        self.progress_percent = update.progress_percent;
        self.current_step = update.current_step;
        self.total_steps = update.total_steps;
        self.updated_at = Utc::now();
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.hmac = None;
        let content = serde_json::to_string(&unsealed)?;
        hmac_hex(self.config_hash.as_bytes(), content.as_bytes())
    }

    /// Load a record, rejecting it if its seal does not match.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let record: Self = serde_json::from_str(&content)?;

        match &record.hmac {
            Some(stored) if *stored == record.compute_hmac()? => Ok(record),
            Some(_) => Err(CloneError::Config(
                "Run record integrity check failed: HMAC mismatch (possible tampering)".to_string(),
            )),
            None => Err(CloneError::Config(
                "Run record has no HMAC seal".to_string(),
            )),
        }
    }

    /// Seal and write atomically: temp file, then rename.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_terminal_status_precedence() {
        assert_eq!(RunStatus::terminal(true, 2), RunStatus::Cancelled);
        assert_eq!(RunStatus::terminal(false, 1), RunStatus::Failed);
        assert_eq!(RunStatus::terminal(false, 0), RunStatus::Completed);
        assert!(!RunStatus::Processing.is_terminal());
    }

    #[test]
    fn test_run_status_parse() {
        assert_eq!("processing".parse::<RunStatus>().unwrap(), RunStatus::Processing);
        assert!("paused".parse::<RunStatus>().is_err());
        assert_eq!(serde_json::to_string(&RunStatus::Queued).unwrap(), "\"QUEUED\"");
    }

    #[test]
    fn test_record_save_load() {
        let mut record = RunRecord::new("run-1", "abc123");
        record
            .tables
            .insert("users".into(), TableState::completed(3, 2));
        record.apply(&StatusUpdate {
            status: RunStatus::Completed,
            progress_percent: 100.0,
            current_step: 4,
            total_steps: 4,
        });

        let file = NamedTempFile::new().unwrap();
        record.save(file.path()).unwrap();

        let loaded = RunRecord::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.tables["users"].rows_transferred, 3);
        assert!(loaded.hmac.is_some());
    }

    #[test]
    fn test_record_tampering_detected() {
        let mut record = RunRecord::new("run-1", "abc123");
        let file = NamedTempFile::new().unwrap();
        record.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        std::fs::write(file.path(), content.replace("QUEUED", "COMPLETED")).unwrap();

        let err = RunRecord::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
    }

    #[test]
    fn test_record_is_pretty_json() {
        let mut record = RunRecord::new("run-1", "hash");
        let file = NamedTempFile::new().unwrap();
        record.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains('\n'));
        assert!(content.contains("\"run_id\""));
    }
}
