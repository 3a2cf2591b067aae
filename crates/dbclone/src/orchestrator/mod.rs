//! Clone orchestrator - main workflow coordinator.
//!
//! A run plans one batch from the source's tables, then executes the job
//! graph on a bounded worker pool. Jobs start as soon as their dependencies
//! are terminal; the scheduler records each outcome, advances the batch
//! counters and writes the run status.

mod batch;
mod jobs;

pub use batch::{
    BatchHandle, BatchPlan, BatchProgress, Edge, Job, JobKind, JobState, Readiness, TablePlan,
};
pub use jobs::JobOutcome;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::anonymize::FakerRegistry;
use crate::config::Config;
use crate::core::connection::ConnectionDescriptor;
use crate::core::schema::DatabaseSchema;
use crate::core::traits::{Database, SchemaInspector};
use crate::drivers::{ConnectionManager, Connector};
use crate::error::{CloneError, Result};
use crate::retry::RetryPolicy;
use crate::state::{
    fields, AuditSigner, FileRunRepository, HmacAuditSigner, LogLevel, NoOpRunRepository,
    RunRepository, RunStatus, StatusUpdate, SyncEvent, SyncLogger, TableState, TracingLogger,
};
use jobs::{run_job, JobContext};

/// Observer called after every job outcome.
pub type ProgressCallback = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Clone orchestrator.
pub struct Orchestrator {
    config: Config,
    logger: Arc<dyn SyncLogger>,
    repository: Option<Arc<dyn RunRepository>>,
    signer: Option<Arc<dyn AuditSigner>>,
    faker: FakerRegistry,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    connector: Option<Connector>,
}

/// Result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub total_jobs: usize,
    pub processed_jobs: usize,
    pub failed_jobs: usize,
    pub rows_transferred: u64,
    pub tables: BTreeMap<String, TableState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl RunResult {
    /// Tables whose transfer failed.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|(_, t)| t.status == crate::state::TableStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Row counts of one table on source and target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableComparison {
    pub table: String,
    pub source_rows: u64,
    /// Rows the target should hold after a clone (row selection applied).
    pub expected_rows: u64,
    pub target_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableComparison {
    pub fn matches(&self) -> bool {
        self.error.is_none() && self.target_rows == Some(self.expected_rows)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetValidation {
    pub target: String,
    pub tables: Vec<TableComparison>,
}

/// Output of [`Orchestrator::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub targets: Vec<TargetValidation>,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.targets
            .iter()
            .all(|t| t.tables.iter().all(TableComparison::matches))
    }

    pub fn mismatches(&self) -> Vec<(&str, &TableComparison)> {
        self.targets
            .iter()
            .flat_map(|t| {
                t.tables
                    .iter()
                    .filter(|c| !c.matches())
                    .map(move |c| (t.target.as_str(), c))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub name: String,
    pub driver: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of [`Orchestrator::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub connections: Vec<ConnectionHealth>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.connections.iter().all(|c| c.healthy)
    }
}

impl Orchestrator {
    /// Create an orchestrator that logs through `tracing` and keeps run
    /// state in `run.state_file` when configured.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            logger: Arc::new(TracingLogger),
            repository: None,
            signer: None,
            faker: FakerRegistry::with_defaults(),
            cancel: CancellationToken::new(),
            progress: None,
            connector: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn with_logger(mut self, logger: Arc<dyn SyncLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Use `repository` instead of the state file / no-op default.
    pub fn with_repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Use `signer` instead of the HMAC signer derived from `run.signing_key`.
    pub fn with_signer(mut self, signer: Arc<dyn AuditSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_faker(mut self, faker: FakerRegistry) -> Self {
        self.faker = faker;
        self
    }

    /// Cancelling `token` cancels the batch.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Open connections through `connector` instead of the built-in drivers.
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    fn manager(&self, run_id: impl Into<String>, retry: RetryPolicy) -> ConnectionManager {
        let manager = ConnectionManager::new(run_id, retry).with_cancellation(self.cancel.clone());
        match &self.connector {
            Some(connector) => manager.with_connector(Arc::clone(connector)),
            None => manager,
        }
    }

    fn repository(&self) -> Arc<dyn RunRepository> {
        if let Some(repository) = &self.repository {
            return Arc::clone(repository);
        }
        match &self.config.run.state_file {
            Some(path) => Arc::new(FileRunRepository::new(path, self.config.hash())),
            None => Arc::new(NoOpRunRepository::new()),
        }
    }

    fn signer(&self) -> Option<Arc<dyn AuditSigner>> {
        self.signer.clone().or_else(|| {
            self.config
                .run
                .signing_key
                .as_ref()
                .map(|key| Arc::new(HmacAuditSigner::new(key)) as Arc<dyn AuditSigner>)
        })
    }

    /// Run one batch against every target.
    pub async fn run(&self) -> Result<RunResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let repository = self.repository();
        let manager = self.manager(run_id.as_str(), self.config.run.retry_policy());

        info!(
            run_id = %run_id,
            backend = repository.backend_type(),
            "Starting clone run: {} -> {} target(s)",
            self.config.source.name,
            self.config.targets.len()
        );

        let planned = self.plan(&manager).await;
        let (source_tables, plan) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                error!(run_id = %run_id, "Planning failed: {}", e);
                let update = StatusUpdate {
                    status: RunStatus::Failed,
                    progress_percent: 0.0,
                    current_step: 0,
                    total_steps: 0,
                };
                if let Err(e) = repository.update_status(&run_id, &update).await {
                    warn!("Failed to write run status: {}", e);
                }
                self.logger.log(
                    LogLevel::Error,
                    SyncEvent::BatchFailed,
                    &format!("Planning failed: {}", e),
                    fields([("error", json!(e.to_string()))]),
                );
                manager.close_all().await;
                return Err(e);
            }
        };

        let batch = BatchHandle::new(&run_id, plan.len(), self.cancel.clone());
        self.write_status(repository.as_ref(), &run_id, RunStatus::Queued, &batch.progress())
            .await;

        let ctx = Arc::new(JobContext {
            config: self.config.clone(),
            manager,
            logger: Arc::clone(&self.logger),
            repository: Arc::clone(&repository),
            signer: self.signer(),
            faker: self.faker.clone(),
            batch: batch.clone(),
            source_tables,
            started_at,
            rows_transferred: AtomicU64::new(0),
            tables: Mutex::new(BTreeMap::new()),
            schema_failures: Mutex::new(Default::default()),
            summary: Mutex::new(None),
        });

        self.logger.log(
            LogLevel::Info,
            SyncEvent::BatchStarted,
            &format!("Batch started with {} jobs", plan.len()),
            fields([
                ("run_id", json!(run_id)),
                ("jobs", json!(plan.len())),
                ("targets", json!(self.config.targets.len())),
                ("mode", json!(self.config.options.synchronize_table_schema.as_str())),
            ]),
        );
        self.write_status(repository.as_ref(), &run_id, RunStatus::Processing, &batch.progress())
            .await;

        self.execute(&plan, &ctx, repository.as_ref()).await;
        let progress = batch.finish();
        ctx.manager.close_all().await;

        let (summary, signature) = ctx
            .summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| CloneError::Config("batch finished without finalizing".into()))?;

        let result = RunResult {
            run_id,
            status: summary.status,
            started_at,
            finished_at: summary.finished_at,
            duration_seconds: clock.elapsed().as_secs_f64(),
            total_jobs: progress.total_jobs,
            processed_jobs: progress.processed_jobs,
            failed_jobs: progress.failed_jobs,
            rows_transferred: summary.rows_transferred,
            tables: summary.tables,
            signature,
        };

        info!(
            run_id = %result.run_id,
            "Run {}: {} jobs ({} failed), {} rows in {:.1}s",
            result.status,
            result.total_jobs,
            result.failed_jobs,
            result.rows_transferred,
            result.duration_seconds
        );
        Ok(result)
    }

    /// List source tables and build the job graph.
    async fn plan(&self, manager: &ConnectionManager) -> Result<(Vec<String>, BatchPlan)> {
        let source = manager.get(&self.config.source).await?;
        let names = source.get_table_names().await?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names.iter().filter(|n| !self.config.options.is_migration_table(n)) {
            let rows = source.count_rows(name).await?;
            if rows == 0 {
                debug!(table = %name, "No rows; no transfer job");
            }
            tables.push(TablePlan {
                name: name.clone(),
                rows,
            });
        }

        let plan = BatchPlan::build(
            self.config.targets.len(),
            &tables,
            self.config.options.disable_foreign_key_constraints,
        );
        info!(
            "Planned {} jobs for {} tables ({} with rows)",
            plan.len(),
            tables.len(),
            tables.iter().filter(|t| t.rows > 0).count()
        );
        Ok((names, plan))
    }

    /// Drive the job graph to completion.
    async fn execute(&self, plan: &BatchPlan, ctx: &Arc<JobContext>, repository: &dyn RunRepository) {
        let workers = self.config.run.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut states = vec![JobState::Pending; plan.len()];
        let mut running: JoinSet<(usize, JobOutcome)> = JoinSet::new();
        let mut task_ids = HashMap::new();

        info!("Executing {} jobs with {} workers", plan.len(), workers);

        loop {
            // Start or skip everything whose dependencies are settled. A skip
            // can unblock further jobs, so repeat until nothing changes.
            let mut changed = true;
            while changed {
                changed = false;
                for job in plan.jobs() {
                    if states[job.id] != JobState::Pending {
                        continue;
                    }
                    match plan.readiness(job, &states) {
                        Readiness::Waiting => {}
                        Readiness::Blocked(dep) => {
                            warn!(
                                job = %ctx.label(job),
                                dependency = %ctx.label(&plan.jobs()[dep]),
                                "Skipped: dependency did not succeed"
                            );
                            if let (Some(table), Ok(target)) = (job.kind.table(), ctx.target(job)) {
                                let key = ctx.table_key(&target.name, table);
                                ctx.record_table(&key, TableState::skipped()).await;
                            }
                            states[job.id] = JobState::Skipped;
                            self.record(job, &JobOutcome::DependencyFailed, ctx, repository)
                                .await;
                            changed = true;
                        }
                        Readiness::Ready => {
                            states[job.id] = JobState::Running;
                            let id = job.id;
                            let ctx = Arc::clone(ctx);
                            let semaphore = Arc::clone(&semaphore);
                            let job = job.clone();
                            let handle = running.spawn(async move {
                                // Cancellation is checked after the permit, right before work.
                                let outcome = match semaphore.acquire_owned().await {
                                    Ok(_permit) => run_job(ctx, job).await,
                                    Err(e) => JobOutcome::Failed(format!("worker pool closed: {}", e)),
                                };
                                (id, outcome)
                            });
                            task_ids.insert(handle.id(), id);
                        }
                    }
                }
            }

            let (id, outcome) = match running.join_next_with_id().await {
                None => break,
                Some(Ok((_, finished))) => finished,
                Some(Err(e)) => match task_ids.get(&e.id()) {
                    Some(&id) => (id, JobOutcome::Failed(format!("job task failed: {}", e))),
                    None => {
                        error!("Unknown job task failed: {}", e);
                        continue;
                    }
                },
            };
            states[id] = outcome.state();
            self.record(&plan.jobs()[id], &outcome, ctx, repository).await;
        }

        if let Some(stuck) = states.iter().position(|s| !s.is_terminal()) {
            error!(job = %ctx.label(&plan.jobs()[stuck]), "Job never became ready");
        }
    }

    /// Count one outcome, report progress and write the run status.
    async fn record(
        &self,
        job: &Job,
        outcome: &JobOutcome,
        ctx: &JobContext,
        repository: &dyn RunRepository,
    ) {
        let progress = ctx.batch.record_outcome(outcome.is_failure());
        debug!(
            job = %ctx.label(job),
            state = %outcome.state(),
            processed = progress.processed_jobs,
            pending = progress.pending_jobs,
            total = progress.total_jobs,
            "Job finished"
        );
        if let Some(callback) = &self.progress {
            callback(&progress);
        }
        // Finalize already wrote the terminal status.
        if job.kind != JobKind::Finalize {
            self.write_status(repository, ctx.run_id(), RunStatus::Processing, &progress)
                .await;
        }
    }

    async fn write_status(
        &self,
        repository: &dyn RunRepository,
        run_id: &str,
        status: RunStatus,
        progress: &BatchProgress,
    ) {
        let update = StatusUpdate {
            status,
            progress_percent: if status == RunStatus::Queued {
                0.0
            } else {
                progress.percent()
            },
            current_step: progress.processed_jobs,
            total_steps: progress.total_jobs,
        };
        if let Err(e) = repository.update_status(run_id, &update).await {
            warn!(run_id, "Failed to write run status: {}", e);
        }
    }

    /// Compare row counts between the source and every target.
    pub async fn validate(&self) -> Result<ValidationReport> {
        let manager = self.manager(uuid::Uuid::new_v4().to_string(), self.config.run.retry_policy());
        let result = self.compare_counts(&manager).await;
        manager.close_all().await;
        result
    }

    async fn compare_counts(&self, manager: &ConnectionManager) -> Result<ValidationReport> {
        let options = &self.config.options;
        let source = manager.get(&self.config.source).await?;
        let names: Vec<String> = source
            .get_table_names()
            .await?
            .into_iter()
            .filter(|n| !options.is_migration_table(n))
            .collect();

        let mut source_counts = Vec::with_capacity(names.len());
        for name in &names {
            source_counts.push(source.count_rows(name).await?);
        }

        let mut targets = Vec::with_capacity(self.config.targets.len());
        for descriptor in &self.config.targets {
            let target = manager.get(descriptor).await?;
            let mut tables = Vec::with_capacity(names.len());
            for (name, &source_rows) in names.iter().zip(&source_counts) {
                let expected_rows = match options.table_options(name).and_then(|o| o.row_selection.as_ref()) {
                    Some(selection) => source_rows.min(selection.limit),
                    None => source_rows,
                };
                let (target_rows, error) = match target.count_rows(name).await {
                    Ok(rows) => (Some(rows), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                let comparison = TableComparison {
                    table: name.clone(),
                    source_rows,
                    expected_rows,
                    target_rows,
                    error,
                };
                if !comparison.matches() {
                    warn!(
                        target = %descriptor.name,
                        table = %name,
                        expected = expected_rows,
                        actual = ?comparison.target_rows,
                        "Row count mismatch"
                    );
                }
                tables.push(comparison);
            }
            targets.push(TargetValidation {
                target: descriptor.name.clone(),
                tables,
            });
        }
        Ok(ValidationReport { targets })
    }

    /// Connect to every configured database once and time a round trip.
    pub async fn health_check(&self) -> HealthReport {
        let manager = self.manager(uuid::Uuid::new_v4().to_string(), RetryPolicy::once());
        let mut connections = Vec::with_capacity(self.config.targets.len() + 1);
        for descriptor in std::iter::once(&self.config.source).chain(&self.config.targets) {
            let start = Instant::now();
            let result = async { manager.get(descriptor).await?.ping().await }.await;
            let latency_ms = start.elapsed().as_millis() as u64;
            let health = ConnectionHealth {
                name: descriptor.name.clone(),
                driver: descriptor.driver_kind.to_string(),
                healthy: result.is_ok(),
                latency_ms,
                error: result.err().map(|e| e.to_string()),
            };
            if health.healthy {
                info!(connection = %health.name, latency_ms, "Healthy");
            } else {
                warn!(connection = %health.name, "Unhealthy: {}", health.error.as_deref().unwrap_or_default());
            }
            connections.push(health);
        }
        manager.close_all().await;
        HealthReport { connections }
    }

    /// Inspect the named connection (the source when `None`).
    pub async fn inspect(&self, connection: Option<&str>) -> Result<DatabaseSchema> {
        let descriptor = self.descriptor(connection)?;
        let manager = self.manager(uuid::Uuid::new_v4().to_string(), self.config.run.retry_policy());
        let result = async { manager.get(descriptor).await?.get_database_schema(None).await }.await;
        manager.close_all().await;
        result
    }

    fn descriptor(&self, name: Option<&str>) -> Result<&ConnectionDescriptor> {
        match name {
            None => Ok(&self.config.source),
            Some(name) => std::iter::once(&self.config.source)
                .chain(&self.config.targets)
                .find(|d| d.name == name)
                .ok_or_else(|| CloneError::Config(format!("No connection named '{}'", name))),
        }
    }
}
