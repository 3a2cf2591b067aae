//! Batch model: the job graph, job states and the shared batch handle.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// The unit of work a job performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    DisableForeignKeys,
    CloneSchemaAndPrepare,
    TransferTable { table: String, rows: u64 },
    EnableForeignKeys,
    Finalize,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::DisableForeignKeys => "disable_foreign_keys",
            JobKind::CloneSchemaAndPrepare => "clone_schema_and_prepare",
            JobKind::TransferTable { .. } => "transfer_table",
            JobKind::EnableForeignKeys => "enable_foreign_keys",
            JobKind::Finalize => "finalize",
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            JobKind::TransferTable { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Finalize closes the batch and runs even after cancellation.
    pub fn honors_cancellation(&self) -> bool {
        !matches!(self, JobKind::Finalize)
    }
}

/// How a job depends on an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The dependency must succeed; otherwise this job is skipped.
    Success,
    /// The dependency must only reach a terminal state.
    Completion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: usize,
    pub kind: JobKind,
    /// Index into the configured targets. `None` for Finalize.
    pub target: Option<usize>,
    pub depends_on: Vec<(usize, Edge)>,
}

impl Job {
    /// Short label for logs: `kind[target]` or `kind[target/table]`.
    pub fn label(&self, target_name: Option<&str>) -> String {
        match (target_name, self.kind.table()) {
            (Some(t), Some(table)) => format!("{}[{}/{}]", self.kind.name(), t, table),
            (Some(t), None) => format!("{}[{}]", self.kind.name(), t),
            (None, _) => self.kind.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Whether a pending job can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Waiting,
    Ready,
    /// A success dependency did not succeed.
    Blocked(usize),
}

/// A source table and its row count at planning time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub name: String,
    pub rows: u64,
}

/// The job graph of one batch.
///
/// Per target: `[DisableForeignKeys] -> CloneSchemaAndPrepare ->
/// TransferTable x N -> [EnableForeignKeys]`, then one Finalize after every
/// other job. Tables with no rows get no transfer job.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    jobs: Vec<Job>,
}

impl BatchPlan {
    pub fn build(target_count: usize, tables: &[TablePlan], disable_foreign_keys: bool) -> Self {
        let mut jobs: Vec<Job> = Vec::new();
        let mut push = |kind: JobKind, target: Option<usize>, depends_on: Vec<(usize, Edge)>| {
            let id = jobs.len();
            jobs.push(Job {
                id,
                kind,
                target,
                depends_on,
            });
            id
        };

        let mut all = Vec::new();
        for t in 0..target_count {
            let disable = disable_foreign_keys
                .then(|| push(JobKind::DisableForeignKeys, Some(t), Vec::new()));

            let clone_deps = disable.map(|id| vec![(id, Edge::Success)]).unwrap_or_default();
            let clone = push(JobKind::CloneSchemaAndPrepare, Some(t), clone_deps);

            let transfers: Vec<usize> = tables
                .iter()
                .filter(|table| table.rows > 0)
                .map(|table| {
                    push(
                        JobKind::TransferTable {
                            table: table.name.clone(),
                            rows: table.rows,
                        },
                        Some(t),
                        vec![(clone, Edge::Success)],
                    )
                })
                .collect();

            all.extend(disable);
            all.push(clone);
            all.extend(&transfers);

            if let Some(disable) = disable {
                let mut deps = vec![(disable, Edge::Completion), (clone, Edge::Completion)];
                deps.extend(transfers.iter().map(|&id| (id, Edge::Completion)));
                all.push(push(JobKind::EnableForeignKeys, Some(t), deps));
            }
        }

        let finalize_deps = all.iter().map(|&id| (id, Edge::Completion)).collect();
        push(JobKind::Finalize, None, finalize_deps);
        Self { jobs }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Tables that get a transfer job for `target`, in plan order.
    pub fn transfer_tables(&self, target: usize) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.target == Some(target))
            .filter_map(|j| j.kind.table())
            .collect()
    }

    pub fn readiness(&self, job: &Job, states: &[JobState]) -> Readiness {
        for &(dep, edge) in &job.depends_on {
            let state = states[dep];
            if !state.is_terminal() {
                return Readiness::Waiting;
            }
            if edge == Edge::Success && state != JobState::Succeeded {
                return Readiness::Blocked(dep);
            }
        }
        Readiness::Ready
    }
}

/// Aggregate counters of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total_jobs: usize,
    pub processed_jobs: usize,
    pub pending_jobs: usize,
    pub failed_jobs: usize,
    pub finished: bool,
    pub cancelled: bool,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total_jobs == 0 {
            return 100.0;
        }
        self.processed_jobs as f64 * 100.0 / self.total_jobs as f64
    }
}

struct BatchInner {
    id: String,
    cancel: CancellationToken,
    counters: Mutex<BatchProgress>,
}

/// Shared, read-mostly view of a running batch.
///
/// Every job receives a clone. Jobs can only observe cancellation and
/// failures; counters advance when the scheduler records a job's outcome.
#[derive(Clone)]
pub struct BatchHandle {
    inner: Arc<BatchInner>,
}

impl BatchHandle {
    pub fn new(id: impl Into<String>, total_jobs: usize, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                id: id.into(),
                cancel,
                counters: Mutex::new(BatchProgress {
                    total_jobs,
                    pending_jobs: total_jobs,
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Mark the batch cancelled. Jobs not yet started will be skipped.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn has_failures(&self) -> bool {
        self.progress().failed_jobs > 0
    }

    pub fn progress(&self) -> BatchProgress {
        let mut progress = *self.lock();
        progress.cancelled = self.is_cancelled();
        progress
    }

    /// Move one job from pending to processed.
    pub(crate) fn record_outcome(&self, failed: bool) -> BatchProgress {
        {
            let mut counters = self.lock();
            counters.pending_jobs = counters.pending_jobs.saturating_sub(1);
            counters.processed_jobs += 1;
            if failed {
                counters.failed_jobs += 1;
            }
        }
        self.progress()
    }

    pub(crate) fn finish(&self) -> BatchProgress {
        self.lock().finished = true;
        self.progress()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchProgress> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchHandle")
            .field("id", &self.inner.id)
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Vec<TablePlan> {
        vec![
            TablePlan {
                name: "users".into(),
                rows: 3,
            },
            TablePlan {
                name: "empty".into(),
                rows: 0,
            },
            TablePlan {
                name: "posts".into(),
                rows: 10,
            },
        ]
    }

    fn kinds(plan: &BatchPlan) -> Vec<&'static str> {
        plan.jobs().iter().map(|j| j.kind.name()).collect()
    }

    #[test]
    fn test_plan_without_foreign_key_toggle() {
        let plan = BatchPlan::build(1, &tables(), false);
        assert_eq!(
            kinds(&plan),
            vec![
                "clone_schema_and_prepare",
                "transfer_table",
                "transfer_table",
                "finalize"
            ]
        );
        assert_eq!(plan.transfer_tables(0), vec!["users", "posts"]);

        let transfer = &plan.jobs()[1];
        assert_eq!(transfer.depends_on, vec![(0, Edge::Success)]);
        let finalize = plan.jobs().last().unwrap();
        assert_eq!(finalize.target, None);
        assert_eq!(finalize.depends_on.len(), 3);
        assert!(finalize.depends_on.iter().all(|(_, e)| *e == Edge::Completion));
    }

    #[test]
    fn test_zero_row_tables_get_no_transfer_job() {
        let plan = BatchPlan::build(2, &tables(), false);
        assert!(plan
            .jobs()
            .iter()
            .all(|j| j.kind.table() != Some("empty")));
        assert_eq!(plan.transfer_tables(1), vec!["users", "posts"]);
    }

    #[test]
    fn test_plan_with_foreign_key_toggle() {
        let plan = BatchPlan::build(1, &tables(), true);
        assert_eq!(
            kinds(&plan),
            vec![
                "disable_foreign_keys",
                "clone_schema_and_prepare",
                "transfer_table",
                "transfer_table",
                "enable_foreign_keys",
                "finalize"
            ]
        );
        assert_eq!(plan.jobs()[1].depends_on, vec![(0, Edge::Success)]);
        let enable = &plan.jobs()[4];
        assert_eq!(
            enable.depends_on,
            vec![
                (0, Edge::Completion),
                (1, Edge::Completion),
                (2, Edge::Completion),
                (3, Edge::Completion)
            ]
        );
        assert_eq!(plan.jobs()[5].depends_on.len(), 5);
    }

    #[test]
    fn test_readiness_follows_edges() {
        let plan = BatchPlan::build(1, &tables(), true);
        let mut states = vec![JobState::Pending; plan.len()];
        let clone = &plan.jobs()[1];
        let enable = &plan.jobs()[4];

        assert_eq!(plan.readiness(&plan.jobs()[0], &states), Readiness::Ready);
        assert_eq!(plan.readiness(clone, &states), Readiness::Waiting);

        states[0] = JobState::Failed;
        assert_eq!(plan.readiness(clone, &states), Readiness::Blocked(0));

        states[1] = JobState::Skipped;
        states[2] = JobState::Skipped;
        states[3] = JobState::Skipped;
        assert_eq!(plan.readiness(enable, &states), Readiness::Ready);
    }

    #[test]
    fn test_handle_counters_keep_total() {
        let handle = BatchHandle::new("b", 3, CancellationToken::new());
        let p = handle.record_outcome(false);
        assert_eq!(p.processed_jobs + p.pending_jobs, p.total_jobs);
        let p = handle.record_outcome(true);
        assert_eq!((p.processed_jobs, p.pending_jobs, p.failed_jobs), (2, 1, 1));
        assert!(handle.has_failures());
        assert!((p.percent() - 66.666).abs() < 0.01);

        handle.cancel();
        assert!(handle.progress().cancelled);
        assert!(handle.finish().finished);
    }
}
