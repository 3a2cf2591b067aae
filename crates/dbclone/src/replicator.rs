//! Schema replication: create source tables on a target.
//!
//! Tables are created in the order given. Indexes the target's builder does
//! not inline follow each table, and foreign keys are added in a second pass
//! once every table exists, unless the dialect embeds them in `CREATE TABLE`.
//! A failing table is reported and skipped; the remaining tables proceed.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::core::connection::Dialect;
use crate::core::schema::{DatabaseSchema, TableSchema};
use crate::core::traits::{Database, SchemaBuilder, SchemaInspector};
use crate::drivers::DialectImpl;
use crate::error::Result;
use crate::state::{LogLevel, SyncEvent};

/// Per-table outcome of a replication pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationReport {
    /// Tables fully created, in creation order.
    pub completed: Vec<String>,
    /// Tables that failed, with the error message.
    pub failed: BTreeMap<String, String>,
}

impl ReplicationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, table: &str, message: String) {
        self.completed.retain(|t| t != table);
        self.failed.entry(table.to_string()).or_insert(message);
    }
}

/// Inspect `tables` on `source` and create them on `target`.
///
/// `visitor(table, event, message, level)` receives `table_started` and then
/// exactly one of `table_completed` or `table_failed` per table. A table
/// completes as soon as it is created, except on dialects that add foreign
/// keys with ALTER TABLE: there, tables with foreign keys complete after
/// the final foreign key pass.
pub async fn replicate_database<F>(
    source: &dyn SchemaInspector,
    target: &dyn Database,
    tables: &[String],
    mut visitor: F,
) -> Result<ReplicationReport>
where
    F: FnMut(&str, SyncEvent, &str, LogLevel),
{
    let mut schemas = Vec::with_capacity(tables.len());
    let mut report = ReplicationReport::default();
    for name in tables {
        match source.get_table_schema(name).await {
            Ok(schema) => schemas.push(schema),
            Err(e) => {
                visitor(name, SyncEvent::TableStarted, "Creating table", LogLevel::Info);
                visitor(name, SyncEvent::TableFailed, &e.to_string(), LogLevel::Error);
                report.fail(name, e.to_string());
            }
        }
    }

    let created = replicate_tables(target, &schemas, &mut visitor).await?;
    report.completed = created.completed;
    report.failed.extend(created.failed);
    Ok(report)
}

/// Create every table of an already-inspected schema on `target`.
pub async fn replicate_schema<F>(
    target: &dyn Database,
    schema: &DatabaseSchema,
    mut visitor: F,
) -> Result<ReplicationReport>
where
    F: FnMut(&str, SyncEvent, &str, LogLevel),
{
    replicate_tables(target, &schema.tables, &mut visitor).await
}

async fn replicate_tables<F>(
    target: &dyn Database,
    tables: &[TableSchema],
    visitor: &mut F,
) -> Result<ReplicationReport>
where
    F: FnMut(&str, SyncEvent, &str, LogLevel),
{
    let builder = DialectImpl::from_dialect(target.dialect());
    let mut report = ReplicationReport::default();
    // Tables waiting for their ALTER TABLE foreign keys.
    let mut pending_keys = Vec::new();

    for table in tables {
        visitor(&table.name, SyncEvent::TableStarted, "Creating table", LogLevel::Info);
        match create_table(target, &builder, table).await {
            Ok(()) => {
                report.completed.push(table.name.clone());
                if builder.embeds_foreign_keys() || table.foreign_keys.is_empty() {
                    visitor(&table.name, SyncEvent::TableCompleted, "Table created", LogLevel::Success);
                } else {
                    pending_keys.push(table);
                }
            }
            Err(e) => {
                warn!(table = %table.name, "Table creation failed: {}", e);
                visitor(&table.name, SyncEvent::TableFailed, &e.to_string(), LogLevel::Error);
                report.fail(&table.name, e.to_string());
            }
        }
    }

    // Foreign keys go last so every referenced table exists.
    for table in pending_keys {
        match add_foreign_keys(target, &builder, table).await {
            Ok(()) => {
                visitor(&table.name, SyncEvent::TableCompleted, "Table created", LogLevel::Success);
            }
            Err(e) => {
                warn!(table = %table.name, "Foreign key creation failed: {}", e);
                visitor(&table.name, SyncEvent::TableFailed, &e.to_string(), LogLevel::Error);
                report.fail(&table.name, e.to_string());
            }
        }
    }
    Ok(report)
}

/// The statements [`replicate_schema`] would run against a `dialect` target,
/// in execution order.
pub fn render_ddl(schema: &DatabaseSchema, dialect: Dialect) -> Result<Vec<String>> {
    let builder = DialectImpl::from_dialect(dialect);
    let mut statements = Vec::new();
    for table in &schema.tables {
        statements.push(builder.build_create_table(table)?);
        for index in table.indexes.iter().filter(|i| !builder.inlines_index(i)) {
            statements.push(builder.build_create_index(&table.name, index)?);
        }
    }
    if !builder.embeds_foreign_keys() {
        for table in &schema.tables {
            for fk in &table.foreign_keys {
                statements.push(builder.build_add_foreign_key(&table.name, fk)?);
            }
        }
    }
    Ok(statements)
}

async fn create_table(target: &dyn Database, builder: &DialectImpl, table: &TableSchema) -> Result<()> {
    let ddl = builder.build_create_table(table)?;
    debug!(table = %table.name, "DDL: {}", ddl);
    target.execute(&ddl).await?;

    for index in table.indexes.iter().filter(|i| !builder.inlines_index(i)) {
        let ddl = builder.build_create_index(&table.name, index)?;
        target.execute(&ddl).await?;
    }
    Ok(())
}

async fn add_foreign_keys(target: &dyn Database, builder: &DialectImpl, table: &TableSchema) -> Result<()> {
    for fk in &table.foreign_keys {
        let ddl = builder.build_add_foreign_key(&table.name, fk)?;
        target.execute(&ddl).await?;
    }
    Ok(())
}
