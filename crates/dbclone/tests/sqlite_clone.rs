//! End-to-end clone runs between SQLite files.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbclone::core::PageQuery;
use dbclone::drivers::SqliteDatabase;
use dbclone::state::{HmacAuditSigner, LogEntry, TableStatus};
use dbclone::{
    BatchProgress, CloneError, ColumnMutation, Config, ConnectionDescriptor, Connector, Database,
    LogLevel, MemoryLogger, MemoryRunRepository, Mutation, Orchestrator, RunStatus,
    SchemaInspector, SchemaSyncMode, SqlValue, SyncEvent, SyncLogger, TableAnonymizationOptions,
};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn open(dir: &Path, name: &str) -> SqliteDatabase {
    let path = dir.join(format!("{}.db", name));
    SqliteDatabase::connect(&ConnectionDescriptor::sqlite(name, path.to_string_lossy()))
        .await
        .unwrap()
}

async fn seed(db: &SqliteDatabase, statements: &[&str]) {
    for sql in statements {
        db.execute(sql).await.unwrap();
    }
}

async fn seed_users(dir: &Path) {
    let source = open(dir, "source").await;
    seed(
        &source,
        &[
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, email TEXT)",
            "INSERT INTO users (name, email) VALUES ('Ada', 'ada@example.com')",
            "INSERT INTO users (name, email) VALUES ('Grace', 'grace@example.com')",
            "INSERT INTO users (name, email) VALUES ('Linus', 'linus@example.com')",
        ],
    )
    .await;
    source.close().await;
}

fn config(dir: &Path) -> Config {
    let yaml = format!(
        r#"
source:
  name: source
  driver: sqlite
  database: {}
targets:
  - name: replica
    driver: sqlite
    database: {}
options:
  synchronize_table_schema: DROP_CREATE
  chunk_size: 2
"#,
        dir.join("source.db").display(),
        dir.join("replica.db").display(),
    );
    Config::from_yaml(&yaml).unwrap()
}

async fn rows(db: &SqliteDatabase, table: &str, columns: &[&str]) -> Vec<Vec<SqlValue>> {
    db.fetch_page(&PageQuery {
        table: table.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        order_by: vec![columns[0].to_string()],
        limit: 100,
        offset: 0,
    })
    .await
    .unwrap()
}

fn chunk_sizes(entry: &LogEntry) -> Vec<u64> {
    entry.data["chunks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_drop_create_clones_users_in_ordered_chunks() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;

    let logger = Arc::new(MemoryLogger::new());
    let repository = Arc::new(MemoryRunRepository::new());
    let result = Orchestrator::new(config(dir.path()))
        .with_logger(logger.clone())
        .with_repository(repository.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows_transferred, 3);
    assert_eq!(result.tables["users"].status, TableStatus::Completed);
    assert_eq!(result.tables["users"].chunks, 2);

    let completed: Vec<_> = logger
        .events(SyncEvent::TableCompleted)
        .into_iter()
        .filter(|e| e.data["phase"] == "transfer")
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(chunk_sizes(&completed[0]), vec![2, 1]);

    let target = open(dir.path(), "replica").await;
    let schema = target.get_table_schema("users").await.unwrap();
    assert_eq!(schema.column_names(), vec!["id", "name", "email"]);
    assert_eq!(target.count_rows("users").await.unwrap(), 3);

    let names: Vec<_> = rows(&target, "users", &["id", "name"])
        .await
        .into_iter()
        .map(|r| r[1].to_text().unwrap())
        .collect();
    assert_eq!(names, vec!["Ada", "Grace", "Linus"]);

    let last = repository.last().await.unwrap();
    assert_eq!(last.status, RunStatus::Completed);
    assert_eq!(last.progress_percent, 100.0);
}

#[tokio::test]
async fn test_mask_mutation_applies_to_every_row() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;

    let mut config = config(dir.path());
    config.options.table_anonymization_options.insert(
        "users".to_string(),
        TableAnonymizationOptions {
            column_mutations: vec![ColumnMutation::new(
                "email",
                Mutation::Mask {
                    visible_chars: 2,
                    mask_char: "#".to_string(),
                },
            )],
            row_selection: None,
        },
    );

    let result = Orchestrator::new(config)
        .with_logger(Arc::new(MemoryLogger::new()))
        .run()
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let source = open(dir.path(), "source").await;
    let target = open(dir.path(), "replica").await;
    let originals = rows(&source, "users", &["id", "email"]).await;
    let masked = rows(&target, "users", &["id", "email"]).await;
    assert_eq!(masked.len(), 3);

    for (original, masked) in originals.iter().zip(&masked) {
        let original = original[1].to_text().unwrap();
        let masked = masked[1].to_text().unwrap();
        assert_eq!(masked.chars().count(), original.chars().count());
        assert_eq!(&masked[..2], &original[..2]);
        assert!(masked.chars().skip(2).all(|c| c == '#'));
    }
}

#[tokio::test]
async fn test_unknown_target_table_is_dropped() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;

    let target = open(dir.path(), "replica").await;
    seed(
        &target,
        &[
            "CREATE TABLE legacy_audit (id INTEGER PRIMARY KEY, note TEXT)",
            "INSERT INTO legacy_audit (note) VALUES ('old')",
        ],
    )
    .await;
    target.close().await;

    let mut config = config(dir.path());
    config.options.keep_unknown_tables_on_target = false;

    let result = Orchestrator::new(config)
        .with_logger(Arc::new(MemoryLogger::new()))
        .run()
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let target = open(dir.path(), "replica").await;
    assert!(!target.table_exists("legacy_audit").await.unwrap());
    assert!(target.table_exists("users").await.unwrap());
}

#[tokio::test]
async fn test_unknown_target_table_is_kept_by_default() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;

    let target = open(dir.path(), "replica").await;
    seed(&target, &["CREATE TABLE legacy_audit (id INTEGER PRIMARY KEY)"]).await;
    target.close().await;

    let mut config = config(dir.path());
    config.options.synchronize_table_schema = SchemaSyncMode::Truncate;

    Orchestrator::new(config)
        .with_logger(Arc::new(MemoryLogger::new()))
        .run()
        .await
        .unwrap();

    let target = open(dir.path(), "replica").await;
    assert!(target.table_exists("legacy_audit").await.unwrap());
    assert_eq!(target.count_rows("users").await.unwrap(), 3);
}

/// Cancels the batch the first time a table transfer completes.
struct CancelAfterFirstTransfer {
    inner: MemoryLogger,
    token: CancellationToken,
}

impl SyncLogger for CancelAfterFirstTransfer {
    fn log(&self, level: LogLevel, event: SyncEvent, message: &str, data: Map<String, Value>) {
        let transfer_done =
            event == SyncEvent::TableCompleted && data.get("phase") == Some(&Value::from("transfer"));
        self.inner.log(level, event, message, data);
        if transfer_done {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_after_first_transfer_skips_the_rest() {
    let dir = TempDir::new().unwrap();
    let source = open(dir.path(), "source").await;
    for table in ["alpha", "beta", "gamma"] {
        let create = format!("CREATE TABLE {} (id INTEGER PRIMARY KEY, label TEXT)", table);
        let insert = format!("INSERT INTO {} (label) VALUES ('one'), ('two')", table);
        seed(&source, &[create.as_str(), insert.as_str()]).await;
    }
    source.close().await;

    let mut config = config(dir.path());
    config.run.workers = 1;

    let token = CancellationToken::new();
    let logger = Arc::new(CancelAfterFirstTransfer {
        inner: MemoryLogger::new(),
        token: token.clone(),
    });
    let repository = Arc::new(MemoryRunRepository::new());

    let result = Orchestrator::new(config)
        .with_logger(logger.clone())
        .with_repository(repository.clone())
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.processed_jobs, result.total_jobs);

    let completed: Vec<_> = result
        .tables
        .iter()
        .filter(|(_, t)| t.status == TableStatus::Completed)
        .map(|(name, _)| name.clone())
        .collect();
    let skipped = result
        .tables
        .values()
        .filter(|t| t.status == TableStatus::Skipped)
        .count();
    assert_eq!(completed.len(), 1);
    assert_eq!(skipped, 2);

    let cancelled = logger.inner.events(SyncEvent::BatchCancelled);
    assert!(cancelled.len() >= 2);

    // No rollback: the finished table keeps its rows.
    let target = open(dir.path(), "replica").await;
    assert_eq!(target.count_rows(&completed[0]).await.unwrap(), 2);

    assert_eq!(repository.last().await.unwrap().status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_progress_invariant_and_empty_tables() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;
    let source = open(dir.path(), "source").await;
    seed(
        &source,
        &[
            "CREATE TABLE empty_table (id INTEGER PRIMARY KEY, note TEXT)",
            "CREATE TABLE tags (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id), tag TEXT)",
            "INSERT INTO tags (user_id, tag) VALUES (1, 'admin')",
        ],
    )
    .await;
    source.close().await;

    let mut config = config(dir.path());
    config.options.disable_foreign_key_constraints = true;

    let observed: Arc<Mutex<Vec<BatchProgress>>> = Arc::default();
    let sink = observed.clone();
    let result = Orchestrator::new(config)
        .with_logger(Arc::new(MemoryLogger::new()))
        .with_signer(Arc::new(HmacAuditSigner::new("audit-key")))
        .with_progress(Arc::new(move |p: &BatchProgress| {
            sink.lock().unwrap().push(*p);
        }))
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    // DisableFK, Clone, two transfers, EnableFK, Finalize
    assert_eq!(result.total_jobs, 6);
    assert!(!result.tables.contains_key("empty_table"));
    assert!(result.signature.is_some());

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), result.total_jobs);
    for progress in observed.iter() {
        assert_eq!(progress.processed_jobs + progress.pending_jobs, progress.total_jobs);
    }
    assert!(observed.windows(2).all(|w| w[0].processed_jobs < w[1].processed_jobs));

    // The empty table still exists on the target.
    let target = open(dir.path(), "replica").await;
    assert!(target.table_exists("empty_table").await.unwrap());
    assert_eq!(target.count_rows("tags").await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_table_creation_only_skips_that_table() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;
    let source = open(dir.path(), "source").await;
    seed(
        &source,
        &[
            "CREATE TABLE broken (id INTEGER PRIMARY KEY, label TEXT)",
            "CREATE INDEX idx_label ON broken (label)",
            "INSERT INTO broken (label) VALUES ('x')",
        ],
    )
    .await;
    source.close().await;

    // Index names are database-wide in SQLite, so creating `broken` collides.
    let target = open(dir.path(), "replica").await;
    seed(
        &target,
        &[
            "CREATE TABLE legacy (id INTEGER PRIMARY KEY, label TEXT)",
            "CREATE INDEX idx_label ON legacy (label)",
        ],
    )
    .await;
    target.close().await;

    let logger = Arc::new(MemoryLogger::new());
    let result = Orchestrator::new(config(dir.path()))
        .with_logger(logger.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_jobs, 0);
    assert_eq!(result.failed_tables(), vec!["broken"]);
    assert_eq!(result.tables["users"].status, TableStatus::Completed);
    assert_eq!(result.rows_transferred, 3);
    assert!(result.tables["broken"]
        .error
        .as_deref()
        .unwrap()
        .contains("table creation failed"));

    let transferred: Vec<_> = logger
        .events(SyncEvent::TableStarted)
        .into_iter()
        .filter(|e| e.data["phase"] == "transfer")
        .map(|e| e.data["table"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(transferred, vec!["users"]);

    let target = open(dir.path(), "replica").await;
    assert_eq!(target.count_rows("users").await.unwrap(), 3);
}

/// Opens SQLite normally but counts calls per connection name. `refuse`
/// never connects; `slow_first` stalls on its first call.
fn counting_connector(
    calls: Arc<Mutex<Vec<String>>>,
    refuse: &'static str,
    slow_first: Option<&'static str>,
) -> Connector {
    let stalled = Arc::new(AtomicU32::new(0));
    Arc::new(
        move |descriptor: ConnectionDescriptor| -> BoxFuture<'static, dbclone::Result<Arc<dyn Database>>> {
            calls.lock().unwrap().push(descriptor.name.clone());
            let stall = slow_first == Some(descriptor.name.as_str())
                && stalled.fetch_add(1, Ordering::SeqCst) == 0;
            Box::pin(async move {
                if descriptor.name == refuse {
                    return Err(CloneError::connection(&descriptor.name, "connection refused"));
                }
                if stall {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                dbclone::connect(&descriptor).await
            })
        },
    )
}

fn attempts(calls: &Mutex<Vec<String>>, name: &str) -> usize {
    calls.lock().unwrap().iter().filter(|n| *n == name).count()
}

#[tokio::test]
async fn test_unreachable_target_fails_alone() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;

    let mut config = config(dir.path());
    config.targets.push(ConnectionDescriptor::sqlite(
        "bad",
        dir.path().join("bad.db").to_string_lossy(),
    ));
    config.run.retry_attempts = 2;
    config.run.retry_backoff_secs = 0;

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let repository = Arc::new(MemoryRunRepository::new());
    let result = Orchestrator::new(config)
        .with_logger(Arc::new(MemoryLogger::new()))
        .with_repository(repository.clone())
        .with_connector(counting_connector(calls.clone(), "bad", None))
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_jobs, 1);
    assert_eq!(result.processed_jobs, result.total_jobs);
    assert_eq!(result.tables["replica/users"].status, TableStatus::Completed);
    assert_eq!(result.tables["replica/users"].rows_transferred, 3);
    assert_eq!(result.tables["bad/users"].status, TableStatus::Skipped);

    // One retry layer: the configured attempts, not attempts squared.
    assert_eq!(attempts(&calls, "bad"), 2);
    assert_eq!(attempts(&calls, "replica"), 1);
    assert_eq!(repository.last().await.unwrap().status, RunStatus::Failed);

    let target = open(dir.path(), "replica").await;
    assert_eq!(target.count_rows("users").await.unwrap(), 3);
}

#[tokio::test]
async fn test_timed_out_job_is_retried() {
    let dir = TempDir::new().unwrap();
    seed_users(dir.path()).await;

    let mut config = config(dir.path());
    config.run.retry_attempts = 2;
    config.run.retry_backoff_secs = 0;
    config.run.job_timeout_secs = 1;

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let logger = Arc::new(MemoryLogger::new());
    let result = Orchestrator::new(config)
        .with_logger(logger.clone())
        .with_connector(counting_connector(calls.clone(), "none", Some("replica")))
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.failed_jobs, 0);
    assert_eq!(result.tables["users"].status, TableStatus::Completed);
    // The first connect outlives the job timeout; the retried job connects again.
    assert_eq!(attempts(&calls, "replica"), 2);
    assert!(logger.events(SyncEvent::BatchFailed).is_empty());
}
