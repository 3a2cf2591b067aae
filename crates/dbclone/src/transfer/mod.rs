//! Table transfer engine with a read-ahead pipeline.
//!
//! A reader task pages through the source table in a deterministic order and
//! hands chunks to the writer over a bounded channel, so the next page is
//! being read while the current one is mutated and inserted. Pages are
//! written strictly in read order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::anonymize::{RowMutator, RowSelection, SelectionStrategy};
use crate::core::schema::TableSchema;
use crate::core::traits::{Database, PageQuery};
use crate::core::value::Row;
use crate::error::{CloneError, Result};

/// Settings for one table transfer.
#[derive(Clone)]
pub struct TransferConfig {
    /// Rows per chunk. Must be positive.
    pub chunk_size: u64,
    /// Chunks buffered between reader and writer.
    pub read_ahead: usize,
    /// Optional slice of the table to transfer.
    pub row_selection: Option<RowSelection>,
    /// Column mutations applied to every row before insert.
    pub mutator: Option<Arc<RowMutator>>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            read_ahead: 4,
            row_selection: None,
            mutator: None,
        }
    }
}

impl TransferConfig {
    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            ..Default::default()
        }
    }
}

/// Statistics from one table transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    /// Rows inserted on the target.
    pub rows: u64,
    /// Rows in each chunk, in write order.
    pub chunk_sizes: Vec<usize>,
    /// Time spent reading pages.
    pub read_time: Duration,
    /// Time spent writing pages.
    pub write_time: Duration,
}

impl TransferStats {
    pub fn chunks(&self) -> usize {
        self.chunk_sizes.len()
    }
}

/// A page read from the source.
#[derive(Debug)]
struct RowChunk {
    rows: Vec<Row>,
    read_time: Duration,
}

/// The ORDER BY used to page through `table`.
///
/// Primary-key columns in declared order, or the first column when the table
/// has no primary key. A `sort_column` leads and the rest break ties.
pub fn order_by_columns(table: &TableSchema, sort_column: Option<&str>) -> Result<Vec<String>> {
    let mut order: Vec<String> = if table.primary_key_columns().is_empty() {
        table
            .columns
            .first()
            .map(|c| vec![c.name.clone()])
            .ok_or_else(|| CloneError::Validation(format!("Table {} has no columns", table.name)))?
    } else {
        table.primary_key_columns().to_vec()
    };

    if let Some(sort) = sort_column {
        if table.column(sort).is_none() {
            return Err(CloneError::Config(format!(
                "sort_column {} does not exist on {}",
                sort, table.name
            )));
        }
        order.retain(|c| c != sort);
        order.insert(0, sort.to_string());
    }
    Ok(order)
}

/// Offset of the first selected row and the number of rows selected.
fn selection_window(total: u64, selection: &RowSelection) -> (u64, u64) {
    let count = selection.limit.min(total);
    match selection.strategy {
        SelectionStrategy::FirstX => (0, count),
        SelectionStrategy::LastX => (total - count, count),
    }
}

/// Copy one table from `source` to the identically-named table on `target`.
///
/// Any read or write error aborts the remaining pages; pages written before
/// the failure stay on the target. `cancel` is honored between chunks.
pub async fn transfer_table(
    source: Arc<dyn Database>,
    target: Arc<dyn Database>,
    table: &TableSchema,
    config: &TransferConfig,
    cancel: Option<CancellationToken>,
) -> Result<TransferStats> {
    if config.chunk_size == 0 {
        return Err(CloneError::Config("chunk_size must be positive".into()));
    }
    let start = Instant::now();
    let columns = table.column_names();
    let sort_column = config
        .row_selection
        .as_ref()
        .and_then(|s| s.sort_column.as_deref());
    let order_by = order_by_columns(table, sort_column)?;

    let window = match &config.row_selection {
        Some(selection) => Some(selection_window(
            source.count_rows(&table.name).await?,
            selection,
        )),
        None => None,
    };

    info!(
        table = %table.name,
        chunk_size = config.chunk_size,
        order_by = ?order_by,
        "Starting transfer"
    );

    let (read_tx, mut read_rx) = mpsc::channel::<RowChunk>(config.read_ahead.max(1));
    let reader_cancel = cancel.clone().unwrap_or_default();
    let base = PageQuery {
        table: table.name.clone(),
        columns: columns.clone(),
        order_by,
        limit: config.chunk_size,
        offset: 0,
    };
    let chunk_size = config.chunk_size;
    let reader_source = Arc::clone(&source);
    let reader = tokio::spawn(async move {
        read_chunks(reader_source, base, chunk_size, window, read_tx, reader_cancel).await
    });

    let mut stats = TransferStats::default();
    let write_result = async {
        while let Some(mut chunk) = read_rx.recv().await {
            stats.read_time += chunk.read_time;
            if let Some(mutator) = &config.mutator {
                mutator.apply_all(&mut chunk.rows)?;
            }

            let write_start = Instant::now();
            let written = target.insert_rows(&table.name, &columns, &chunk.rows).await?;
            stats.write_time += write_start.elapsed();
            stats.rows += written;
            stats.chunk_sizes.push(chunk.rows.len());
            debug!(table = %table.name, rows = chunk.rows.len(), "Wrote chunk");
        }
        Ok::<(), CloneError>(())
    }
    .await;

    // Stop the reader if the writer bailed out early.
    drop(read_rx);
    let read_result = reader
        .await
        .map_err(|e| CloneError::transfer(&table.name, format!("Reader task failed: {}", e)))?;
    write_result?;
    read_result?;

    target.after_load(table).await?;

    let elapsed = start.elapsed();
    info!(
        table = %table.name,
        rows = stats.rows,
        chunks = stats.chunks(),
        "Transferred {} rows in {:?} (read: {:?}, write: {:?})",
        stats.rows,
        elapsed,
        stats.read_time,
        stats.write_time
    );
    Ok(stats)
}

async fn read_chunks(
    source: Arc<dyn Database>,
    mut query: PageQuery,
    chunk_size: u64,
    window: Option<(u64, u64)>,
    tx: mpsc::Sender<RowChunk>,
    cancel: CancellationToken,
) -> Result<()> {
    let (first, mut remaining) = match window {
        Some((offset, count)) => (offset, Some(count)),
        None => (0, None),
    };
    query.offset = first;

    loop {
        if remaining == Some(0) {
            return Ok(());
        }
        if query.offset != first && cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }
        query.limit = remaining.map_or(chunk_size, |r| r.min(chunk_size));

        let read_start = Instant::now();
        let rows = source.fetch_page(&query).await?;
        let read = rows.len() as u64;
        if read == 0 {
            return Ok(());
        }

        let chunk = RowChunk {
            rows,
            read_time: read_start.elapsed(),
        };
        if tx.send(chunk).await.is_err() {
            // Writer stopped; its error is reported by the caller.
            return Ok(());
        }

        query.offset += read;
        remaining = remaining.map(|r| r.saturating_sub(read));
        if read < query.limit {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::{ColumnMutation, FakerRegistry, Mutation};
    use crate::core::connection::ConnectionDescriptor;
    use crate::core::schema::{ColumnSchema, IndexSchema, IndexType, LogicalType};
    use crate::core::traits::SchemaInspector;
    use crate::core::value::SqlValue;
    use crate::drivers::SqliteDatabase;

    fn composite() -> TableSchema {
        let mut t = TableSchema::new("memberships");
        t.columns.push(ColumnSchema::new("note", LogicalType::TEXT));
        t.columns.push(ColumnSchema::new("org_id", LogicalType::INTEGER));
        t.columns.push(ColumnSchema::new("user_id", LogicalType::INTEGER));
        t.indexes.push(IndexSchema::new(
            "PRIMARY",
            vec!["user_id".into(), "org_id".into()],
            IndexType::Primary,
        ));
        t
    }

    #[test]
    fn test_order_by_uses_full_primary_key_in_declared_order() {
        assert_eq!(order_by_columns(&composite(), None).unwrap(), vec!["user_id", "org_id"]);
    }

    #[test]
    fn test_order_by_without_primary_key_uses_first_column() {
        let mut t = composite();
        t.indexes.clear();
        assert_eq!(order_by_columns(&t, None).unwrap(), vec!["note"]);
    }

    #[test]
    fn test_sort_column_leads_and_is_not_repeated() {
        let t = composite();
        assert_eq!(
            order_by_columns(&t, Some("org_id")).unwrap(),
            vec!["org_id", "user_id"]
        );
        assert_eq!(
            order_by_columns(&t, Some("note")).unwrap(),
            vec!["note", "user_id", "org_id"]
        );
        assert!(order_by_columns(&t, Some("missing")).is_err());
    }

    #[test]
    fn test_selection_window() {
        let first = RowSelection {
            strategy: SelectionStrategy::FirstX,
            limit: 3,
            sort_column: None,
        };
        let last = RowSelection {
            strategy: SelectionStrategy::LastX,
            ..first.clone()
        };
        assert_eq!(selection_window(10, &first), (0, 3));
        assert_eq!(selection_window(10, &last), (7, 3));
        assert_eq!(selection_window(2, &last), (0, 2));
    }

    async fn pair(dir: &tempfile::TempDir) -> (Arc<dyn Database>, Arc<dyn Database>) {
        let open = |name: &str| {
            let path = dir.path().join(format!("{}.db", name));
            ConnectionDescriptor::sqlite(name, path.to_string_lossy())
        };
        let source = SqliteDatabase::connect(&open("source")).await.unwrap();
        let target = SqliteDatabase::connect(&open("target")).await.unwrap();
        let ddl = "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)";
        source.execute(ddl).await.unwrap();
        target.execute(ddl).await.unwrap();
        for i in 1..=5 {
            source
                .execute(&format!("INSERT INTO items (id, label) VALUES ({}, 'item-{}')", i, i))
                .await
                .unwrap();
        }
        (Arc::new(source), Arc::new(target))
    }

    async fn target_ids(target: &Arc<dyn Database>) -> Vec<SqlValue> {
        let page = PageQuery {
            table: "items".into(),
            columns: vec!["id".into()],
            order_by: vec!["id".into()],
            limit: 100,
            offset: 0,
        };
        target
            .fetch_page(&page)
            .await
            .unwrap()
            .into_iter()
            .map(|mut r| r.remove(0))
            .collect()
    }

    #[tokio::test]
    async fn test_transfer_in_ordered_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = pair(&dir).await;
        let schema = source.get_table_schema("items").await.unwrap();

        let stats = transfer_table(
            Arc::clone(&source),
            Arc::clone(&target),
            &schema,
            &TransferConfig::with_chunk_size(2),
            None,
        )
        .await
        .unwrap();

        assert_eq!(stats.rows, 5);
        assert_eq!(stats.chunk_sizes, vec![2, 2, 1]);
        assert_eq!(target.count_rows("items").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_last_x_reads_the_tail_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = pair(&dir).await;
        let schema = source.get_table_schema("items").await.unwrap();
        let config = TransferConfig {
            chunk_size: 2,
            row_selection: Some(RowSelection {
                strategy: SelectionStrategy::LastX,
                limit: 3,
                sort_column: None,
            }),
            ..Default::default()
        };

        let stats = transfer_table(Arc::clone(&source), Arc::clone(&target), &schema, &config, None)
            .await
            .unwrap();

        assert_eq!(stats.chunk_sizes, vec![2, 1]);
        assert_eq!(
            target_ids(&target).await,
            vec![SqlValue::Int(3), SqlValue::Int(4), SqlValue::Int(5)]
        );
    }

    #[tokio::test]
    async fn test_first_x_with_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = pair(&dir).await;
        let schema = source.get_table_schema("items").await.unwrap();
        let mutator = RowMutator::compile(
            "items",
            &schema.columns,
            &[ColumnMutation::new(
                "label",
                Mutation::Static { value: "x".into() },
            )],
            &FakerRegistry::new(),
            "key",
        )
        .unwrap();
        let config = TransferConfig {
            chunk_size: 10,
            row_selection: Some(RowSelection {
                strategy: SelectionStrategy::FirstX,
                limit: 2,
                sort_column: None,
            }),
            mutator: Some(Arc::new(mutator)),
            ..Default::default()
        };

        let stats = transfer_table(Arc::clone(&source), Arc::clone(&target), &schema, &config, None)
            .await
            .unwrap();
        assert_eq!(stats.rows, 2);

        let page = PageQuery {
            table: "items".into(),
            columns: vec!["id".into(), "label".into()],
            order_by: vec!["id".into()],
            limit: 10,
            offset: 0,
        };
        let rows = target.fetch_page(&page).await.unwrap();
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::Int(1), SqlValue::from("x")],
                vec![SqlValue::Int(2), SqlValue::from("x")],
            ]
        );
    }

    #[tokio::test]
    async fn test_write_failure_keeps_earlier_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = pair(&dir).await;
        // Row 3 already exists on the target, so the second chunk fails.
        target
            .execute("INSERT INTO items (id, label) VALUES (3, 'existing')")
            .await
            .unwrap();
        let schema = source.get_table_schema("items").await.unwrap();

        let result = transfer_table(
            Arc::clone(&source),
            Arc::clone(&target),
            &schema,
            &TransferConfig::with_chunk_size(2),
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(
            target_ids(&target).await,
            vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)]
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_at_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = pair(&dir).await;
        let schema = source.get_table_schema("items").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transfer_table(
            Arc::clone(&source),
            Arc::clone(&target),
            &schema,
            &TransferConfig {
                chunk_size: 2,
                read_ahead: 1,
                ..Default::default()
            },
            Some(cancel),
        )
        .await;

        assert!(matches!(result, Err(CloneError::Cancelled)));
        // The first chunk was already under way and completes.
        assert_eq!(target.count_rows("items").await.unwrap(), 2);
    }
}
