//! Job bodies.
//!
//! Each job resolves its own connections through the run's
//! [`ConnectionManager`] and reports through the [`SyncLogger`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::batch::{BatchHandle, Job, JobKind, JobState};
use crate::anonymize::{FakerRegistry, RowMutator};
use crate::classify::ErrorKind;
use crate::config::{Config, SchemaSyncMode};
use crate::core::connection::ConnectionDescriptor;
use crate::core::schema::DatabaseSchema;
use crate::core::traits::{Database, SchemaBuilder, SchemaInspector};
use crate::drivers::{ConnectionManager, DialectImpl};
use crate::error::{CloneError, Result};
use crate::replicator::{replicate_schema, ReplicationReport};
use crate::retry::RetryPolicy;
use crate::state::{
    fields, AuditSigner, LogLevel, RunRepository, RunStatus, RunSummary, StatusUpdate, SyncEvent,
    SyncLogger, TableState,
};
use crate::transfer::{transfer_table, TransferConfig};

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    /// The batch was cancelled before the job started its work.
    Cancelled,
    /// A success dependency failed or was skipped.
    DependencyFailed,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled | JobOutcome::DependencyFailed => JobState::Skipped,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

/// Everything a job needs, shared by all jobs of one batch.
pub(crate) struct JobContext {
    pub config: Config,
    pub manager: ConnectionManager,
    pub logger: Arc<dyn SyncLogger>,
    pub repository: Arc<dyn RunRepository>,
    pub signer: Option<Arc<dyn AuditSigner>>,
    pub faker: FakerRegistry,
    pub batch: BatchHandle,
    /// Every base table on the source, including the migration table.
    pub source_tables: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub rows_transferred: AtomicU64,
    pub tables: Mutex<BTreeMap<String, TableState>>,
    /// Table keys whose target table could not be created.
    pub schema_failures: Mutex<HashSet<String>>,
    pub summary: Mutex<Option<(RunSummary, Option<String>)>>,
}

impl JobContext {
    pub fn run_id(&self) -> &str {
        self.manager.run_id()
    }

    pub fn target(&self, job: &Job) -> Result<&ConnectionDescriptor> {
        job.target
            .and_then(|t| self.config.targets.get(t))
            .ok_or_else(|| CloneError::Config(format!("{} has no target", job.kind.name())))
    }

    pub fn label(&self, job: &Job) -> String {
        let target = job
            .target
            .and_then(|t| self.config.targets.get(t))
            .map(|d| d.name.as_str());
        job.label(target)
    }

    /// Key of a table in the run summary. Prefixed by target name when the
    /// run has several targets.
    pub fn table_key(&self, target: &str, table: &str) -> String {
        if self.config.targets.len() > 1 {
            format!("{}/{}", target, table)
        } else {
            table.to_string()
        }
    }

    /// Key for HASH mutations without their own key.
    fn hash_key(&self) -> &str {
        self.config
            .run
            .signing_key
            .as_deref()
            .unwrap_or_else(|| self.run_id())
    }

    pub async fn record_table(&self, key: &str, state: TableState) {
        if let Err(e) = self
            .repository
            .record_table(self.run_id(), key, &state)
            .await
        {
            warn!(table = key, "Failed to record table state: {}", e);
        }
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), state);
    }

    fn schema_failed(&self, key: &str) -> bool {
        self.schema_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    fn schema_failure_count(&self) -> usize {
        self.schema_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn log(&self, level: LogLevel, event: SyncEvent, message: &str, data: serde_json::Map<String, serde_json::Value>) {
        self.logger.log(level, event, message, data);
    }
}

/// Run one job: cancellation check, then the body under its retry policy
/// and the job timeout.
///
/// Only transient failures (timeouts, deadlocks) are retried here.
/// Connection failures were already retried by the [`ConnectionManager`].
pub(crate) async fn run_job(ctx: Arc<JobContext>, job: Job) -> JobOutcome {
    let label = ctx.label(&job);

    if let (JobKind::TransferTable { table, .. }, Ok(target)) = (&job.kind, ctx.target(&job)) {
        if ctx.schema_failed(&ctx.table_key(&target.name, table)) {
            warn!(job = %label, "Skipped: target table was not created");
            return JobOutcome::DependencyFailed;
        }
    }

    if job.kind.honors_cancellation() && ctx.batch.is_cancelled() {
        if ctx.batch.has_failures() {
            // Cancellation raised while failures are being handled; the
            // terminal event already covers it.
            warn!(job = %label, "Skipped: batch cancelled after failures");
        } else {
            let mut data = fields([("job", json!(job.kind.name()))]);
            if let Some(table) = job.kind.table() {
                data.insert("table".into(), json!(table));
            }
            ctx.log(
                LogLevel::Warning,
                SyncEvent::BatchCancelled,
                &format!("Skipped {}: batch cancelled", label),
                data,
            );
        }
        if let (Some(table), Ok(target)) = (job.kind.table(), ctx.target(&job)) {
            let key = ctx.table_key(&target.name, table);
            ctx.record_table(&key, TableState::skipped()).await;
        }
        return JobOutcome::Cancelled;
    }

    // A partial transfer is not idempotent, so it gets a single attempt.
    let policy = match job.kind {
        JobKind::TransferTable { .. } => RetryPolicy::once(),
        _ => ctx.config.run.retry_policy(),
    };
    let timeout = ctx.config.run.job_timeout();

    let token = ctx.batch.token();

    debug!(job = %label, "Job started");
    let result = policy
        .run_when(&label, Some(&token), is_transient, || {
            let ctx = Arc::clone(&ctx);
            let job = &job;
            let label = &label;
            async move {
                match tokio::time::timeout(timeout, execute(&ctx, job)).await {
                    Ok(result) => result,
                    Err(_) => Err(CloneError::Timeout(format!(
                        "{} exceeded {:?}",
                        label, timeout
                    ))),
                }
            }
        })
        .await;

    match result {
        Ok(()) => {
            debug!(job = %label, "Job succeeded");
            JobOutcome::Succeeded
        }
        Err(CloneError::Cancelled) => {
            info!(job = %label, "Job stopped: batch cancelled");
            JobOutcome::Cancelled
        }
        Err(e) => {
            error!(job = %label, kind = %e.kind(), "Job failed: {}", e);
            if job.kind.table().is_none() {
                ctx.log(
                    LogLevel::Error,
                    SyncEvent::BatchFailed,
                    &format!("{} failed: {}", label, e),
                    fields([
                        ("job", json!(job.kind.name())),
                        ("error", json!(e.to_string())),
                        ("kind", json!(e.kind().to_string())),
                    ]),
                );
            }
            JobOutcome::Failed(e.to_string())
        }
    }
}

fn is_transient(e: &CloneError) -> bool {
    e.kind() == ErrorKind::Transient
}

async fn execute(ctx: &JobContext, job: &Job) -> Result<()> {
    match &job.kind {
        JobKind::DisableForeignKeys => set_foreign_keys(ctx, job, false).await,
        JobKind::CloneSchemaAndPrepare => clone_schema_and_prepare(ctx, job).await,
        JobKind::TransferTable { table, rows } => transfer(ctx, job, table, *rows).await,
        JobKind::EnableForeignKeys => set_foreign_keys(ctx, job, true).await,
        JobKind::Finalize => finalize(ctx).await,
    }
}

async fn set_foreign_keys(ctx: &JobContext, job: &Job, enabled: bool) -> Result<()> {
    let descriptor = ctx.target(job)?;
    let target = ctx.manager.get(descriptor).await?;
    let action = if enabled { "Enabling" } else { "Disabling" };
    ctx.log(
        LogLevel::Info,
        SyncEvent::PhaseStarted,
        &format!("{} foreign key constraints on {}", action, descriptor.name),
        fields([
            ("phase", json!(job.kind.name())),
            ("target", json!(descriptor.name)),
        ]),
    );
    target.set_foreign_key_checks(enabled).await
}

async fn clone_schema_and_prepare(ctx: &JobContext, job: &Job) -> Result<()> {
    let descriptor = ctx.target(job)?;
    let options = &ctx.config.options;
    let source = ctx.manager.get(&ctx.config.source).await?;
    let target = ctx.manager.get(descriptor).await?;

    ctx.log(
        LogLevel::Info,
        SyncEvent::PhaseStarted,
        &format!(
            "Preparing {} (mode: {})",
            descriptor.name, options.synchronize_table_schema
        ),
        fields([
            ("phase", json!(job.kind.name())),
            ("target", json!(descriptor.name)),
            ("mode", json!(options.synchronize_table_schema.as_str())),
        ]),
    );

    if !options.keep_unknown_tables_on_target {
        for table in target.get_table_names().await? {
            if !ctx.source_tables.contains(&table) {
                info!(target = %descriptor.name, table = %table, "Dropping table unknown to source");
                target.drop_table(&table).await?;
            }
        }
    }

    let cloned: Vec<&String> = ctx
        .source_tables
        .iter()
        .filter(|t| !options.is_migration_table(t))
        .collect();

    match options.synchronize_table_schema {
        SchemaSyncMode::None => {}
        SchemaSyncMode::Truncate => {
            let builder = DialectImpl::from_dialect(target.dialect());
            let existing = target.get_table_names().await?;
            let mut missing = DatabaseSchema::default();
            for table in cloned {
                if existing.contains(table) {
                    target.execute(&builder.build_delete_all(table)).await?;
                    ctx.log(
                        LogLevel::Info,
                        SyncEvent::TableEmptied,
                        &format!("Emptied {}", table),
                        fields([("table", json!(table)), ("target", json!(descriptor.name))]),
                    );
                } else {
                    missing.tables.push(source.get_table_schema(table).await?);
                }
            }
            if !missing.tables.is_empty() {
                let report = replicate(ctx, &descriptor.name, target.as_ref(), &missing).await?;
                record_schema_failures(ctx, &descriptor.name, &report).await;
            }
        }
        SchemaSyncMode::DropCreate => {
            let schema = source
                .get_database_schema(None)
                .await?
                .without_table(options.migration_table_name.as_deref());
            for table in schema.tables.iter().rev() {
                target.drop_table(&table.name).await?;
            }
            let report = replicate(ctx, &descriptor.name, target.as_ref(), &schema).await?;
            record_schema_failures(ctx, &descriptor.name, &report).await;
        }
    }
    Ok(())
}

async fn replicate(
    ctx: &JobContext,
    target_name: &str,
    target: &dyn Database,
    schema: &DatabaseSchema,
) -> Result<ReplicationReport> {
    replicate_schema(target, schema, |table, event, message, level| {
        ctx.log(
            level,
            event,
            message,
            fields([
                ("table", json!(table)),
                ("target", json!(target_name)),
                ("phase", json!("schema")),
            ]),
        )
    })
    .await
}

/// Mark tables that could not be created as failed. Their transfers are
/// skipped; the rest of the target proceeds.
async fn record_schema_failures(ctx: &JobContext, target_name: &str, report: &ReplicationReport) {
    for table in &report.completed {
        let key = ctx.table_key(target_name, table);
        ctx.schema_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key);
    }
    for (table, message) in &report.failed {
        let key = ctx.table_key(target_name, table);
        ctx.record_table(&key, TableState::failed(format!("table creation failed: {}", message)))
            .await;
        ctx.schema_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key);
    }
}

async fn transfer(ctx: &JobContext, job: &Job, table: &str, expected_rows: u64) -> Result<()> {
    let descriptor = ctx.target(job)?;
    let key = ctx.table_key(&descriptor.name, table);
    let base = fields([
        ("table", json!(table)),
        ("target", json!(descriptor.name)),
        ("phase", json!("transfer")),
    ]);

    let mut started = base.clone();
    started.insert("rows".into(), json!(expected_rows));
    ctx.log(
        LogLevel::Info,
        SyncEvent::TableStarted,
        &format!("Transferring {}", table),
        started,
    );

    let result = async {
        let source = ctx.manager.get(&ctx.config.source).await?;
        let target = ctx.manager.get(descriptor).await?;
        let schema = source.get_table_schema(table).await?;
        let options = ctx.config.options.table_options(table);

        let mutator = match options.filter(|o| !o.column_mutations.is_empty()) {
            Some(o) => Some(Arc::new(RowMutator::compile(
                table,
                &schema.columns,
                &o.column_mutations,
                &ctx.faker,
                ctx.hash_key(),
            )?)),
            None => None,
        };
        let config = TransferConfig {
            chunk_size: ctx.config.options.chunk_size,
            row_selection: options.and_then(|o| o.row_selection.clone()),
            mutator,
            ..Default::default()
        };
        transfer_table(source, target, &schema, &config, Some(ctx.batch.token())).await
    }
    .await;

    match result {
        Ok(stats) => {
            ctx.rows_transferred.fetch_add(stats.rows, Ordering::Relaxed);
            ctx.record_table(&key, TableState::completed(stats.rows, stats.chunks()))
                .await;
            let mut data = base;
            data.insert("rows".into(), json!(stats.rows));
            data.insert("chunks".into(), json!(stats.chunk_sizes));
            ctx.log(
                LogLevel::Success,
                SyncEvent::TableCompleted,
                &format!("Transferred {} rows into {}", stats.rows, table),
                data,
            );
            Ok(())
        }
        Err(CloneError::Cancelled) => {
            ctx.record_table(&key, TableState::skipped()).await;
            Err(CloneError::Cancelled)
        }
        Err(e) => {
            ctx.record_table(&key, TableState::failed(e.to_string())).await;
            let mut data = base;
            data.insert("error".into(), json!(e.to_string()));
            data.insert("kind".into(), json!(e.kind().to_string()));
            ctx.log(
                LogLevel::Error,
                SyncEvent::TableFailed,
                &format!("Transfer of {} failed: {}", table, e),
                data,
            );
            Err(e)
        }
    }
}

/// Close the batch: sign the run, write the terminal status and emit the
/// terminal event. Signer and repository failures are logged only.
async fn finalize(ctx: &JobContext) -> Result<()> {
    let progress = ctx.batch.progress();
    let status = RunStatus::terminal(
        progress.cancelled,
        progress.failed_jobs + ctx.schema_failure_count(),
    );
    // Finalize counts itself as processed.
    let processed = progress.processed_jobs + 1;

    ctx.log(
        LogLevel::Info,
        SyncEvent::PhaseStarted,
        "Finalizing batch",
        fields([("phase", json!("finalize"))]),
    );

    let summary = RunSummary {
        run_id: ctx.run_id().to_string(),
        status,
        total_jobs: progress.total_jobs,
        processed_jobs: processed,
        failed_jobs: progress.failed_jobs,
        rows_transferred: ctx.rows_transferred.load(Ordering::Relaxed),
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        tables: ctx
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone(),
    };

    let mut signature = None;
    if let Some(signer) = &ctx.signer {
        match signer.sign(&summary).await {
            Ok(sig) => {
                if let Err(e) = ctx.repository.record_signature(ctx.run_id(), &sig).await {
                    warn!("Failed to record audit signature: {}", e);
                }
                signature = Some(sig);
            }
            Err(e) => {
                warn!("Audit signing failed: {}", e);
                ctx.log(
                    LogLevel::Warning,
                    SyncEvent::PhaseStarted,
                    &format!("Audit signing failed: {}", e),
                    fields([("phase", json!("finalize"))]),
                );
            }
        }
    }

    let update = StatusUpdate {
        status,
        progress_percent: 100.0,
        current_step: processed,
        total_steps: progress.total_jobs,
    };
    if let Err(e) = ctx.repository.update_status(ctx.run_id(), &update).await {
        warn!("Failed to write terminal run status: {}", e);
    }

    let (level, event) = match status {
        RunStatus::Completed => (LogLevel::Success, SyncEvent::BatchCompleted),
        RunStatus::Cancelled => (LogLevel::Warning, SyncEvent::BatchCancelled),
        _ => (LogLevel::Error, SyncEvent::BatchFailed),
    };
    ctx.log(
        level,
        event,
        &format!("Batch {}", status),
        fields([
            ("status", json!(status.as_str())),
            ("processed_jobs", json!(processed)),
            ("failed_jobs", json!(progress.failed_jobs)),
            ("rows", json!(summary.rows_transferred)),
        ]),
    );

    *ctx.summary
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((summary, signature));
    Ok(())
}
