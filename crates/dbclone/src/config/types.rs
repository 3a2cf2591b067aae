//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::anonymize::TableAnonymizationOptions;
use crate::core::connection::ConnectionDescriptor;
use crate::error::CloneError;
use crate::retry::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database rows are read from.
    pub source: ConnectionDescriptor,

    /// Databases the source is cloned into. Each gets its own job chain.
    pub targets: Vec<ConnectionDescriptor>,

    /// What a run does to each target.
    #[serde(default)]
    pub options: SynchronizationOptions,

    /// How the run is executed.
    #[serde(default)]
    pub run: RunConfig,
}

/// How target tables are prepared before rows are copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaSyncMode {
    /// Leave target tables as they are.
    #[default]
    None,
    /// Delete every row of each source-named table (creating missing ones).
    Truncate,
    /// Drop each source-named table and recreate it from the source schema.
    DropCreate,
}

impl SchemaSyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaSyncMode::None => "NONE",
            SchemaSyncMode::Truncate => "TRUNCATE",
            SchemaSyncMode::DropCreate => "DROP_CREATE",
        }
    }
}

impl fmt::Display for SchemaSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaSyncMode {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(SchemaSyncMode::None),
            "TRUNCATE" => Ok(SchemaSyncMode::Truncate),
            "DROP_CREATE" => Ok(SchemaSyncMode::DropCreate),
            other => Err(CloneError::Config(format!(
                "Unknown schema sync mode '{}' (expected none, truncate or drop-create)",
                other
            ))),
        }
    }
}

/// Per-run synchronization options. Not changed once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationOptions {
    /// Mutations and row selection keyed by table name.
    #[serde(default)]
    pub table_anonymization_options: BTreeMap<String, TableAnonymizationOptions>,

    /// Suspend foreign key enforcement on each target for the run.
    #[serde(default)]
    pub disable_foreign_key_constraints: bool,

    #[serde(default)]
    pub synchronize_table_schema: SchemaSyncMode,

    /// When false, target tables absent from the source are dropped.
    #[serde(default = "default_true")]
    pub keep_unknown_tables_on_target: bool,

    /// Source bookkeeping table that is never cloned.
    #[serde(default)]
    pub migration_table_name: Option<String>,

    /// Rows per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

impl Default for SynchronizationOptions {
    fn default() -> Self {
        Self {
            table_anonymization_options: BTreeMap::new(),
            disable_foreign_key_constraints: false,
            synchronize_table_schema: SchemaSyncMode::None,
            keep_unknown_tables_on_target: true,
            migration_table_name: None,
            chunk_size: default_chunk_size(),
        }
    }
}

impl SynchronizationOptions {
    pub fn table_options(&self, table: &str) -> Option<&TableAnonymizationOptions> {
        self.table_anonymization_options.get(table)
    }

    /// Whether `table` is the excluded migration table.
    pub fn is_migration_table(&self, table: &str) -> bool {
        self.migration_table_name.as_deref() == Some(table)
    }
}

/// Execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Jobs executing at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per job, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed wait between attempts.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Upper bound on one job's run time.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Key for audit signatures, HASH mutations and the run record seal.
    #[serde(default, skip_serializing)]
    pub signing_key: Option<String>,

    /// JSON run record written after each status change.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            signing_key: None,
            state_file: None,
        }
    }
}

impl RunConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_secs(self.retry_backoff_secs),
        )
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    1000
}

fn default_workers() -> usize {
    4
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_backoff_secs() -> u64 {
    30
}

fn default_job_timeout_secs() -> u64 {
    3600
}
