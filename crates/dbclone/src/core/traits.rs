//! Core traits implemented once per dialect.
//!
//! - [`SchemaInspector`]: reads a live connection into the schema model
//! - [`Database`]: an open, pooled connection that can also execute DDL and move rows
//! - [`DialectSql`]: dialect identity and identifier quoting
//! - [`SchemaBuilder`]: pure DDL generation from the schema model
//! - [`QueryBuilder`]: pure DML generation (paged selects, inserts, counts)

use async_trait::async_trait;

use crate::error::Result;

use super::connection::{ConnectionDescriptor, Dialect};
use super::identifier::{quote_ident, quote_list};
use super::schema::{
    ColumnSchema, DatabaseMetadata, DatabaseSchema, ForeignKeySchema, IndexSchema, IndexType,
    TableSchema,
};
use super::value::Row;

/// One page of an ordered table scan.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    pub table: String,
    pub columns: Vec<String>,
    /// ORDER BY columns, ascending, in priority order. Never empty.
    pub order_by: Vec<String>,
    pub limit: u64,
    pub offset: u64,
}

/// Reads schema information from a live connection.
///
/// Every implementation reports types in the [`LogicalType`](super::schema::LogicalType)
/// vocabulary. `scope` selects a database/schema other than the
/// connection's default where the dialect has such a notion.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    /// Base table names in `scope`, sorted by name.
    async fn table_names_in(&self, scope: Option<&str>) -> Result<Vec<String>>;

    /// Full schema for one table in `scope`.
    async fn table_schema_in(&self, scope: Option<&str>, table: &str) -> Result<TableSchema>;

    /// Server version, default charset and collation.
    async fn get_database_metadata(&self) -> Result<DatabaseMetadata>;

    async fn get_table_names(&self) -> Result<Vec<String>> {
        self.table_names_in(None).await
    }

    async fn get_table_schema(&self, table: &str) -> Result<TableSchema> {
        self.table_schema_in(None, table).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.get_table_names().await?.iter().any(|t| t == table))
    }

    async fn get_database_schema(&self, db_name: Option<&str>) -> Result<DatabaseSchema> {
        let names = self.table_names_in(db_name).await?;
        let mut tables = Vec::with_capacity(names.len());
        for name in &names {
            tables.push(self.table_schema_in(db_name, name).await?);
        }
        Ok(DatabaseSchema {
            tables,
            metadata: self.get_database_metadata().await?,
        })
    }
}

/// An open connection (pool) to one endpoint.
///
/// Implementations are internally synchronized and may be shared across
/// concurrent jobs behind an `Arc`.
#[async_trait]
pub trait Database: SchemaInspector {
    fn descriptor(&self) -> &ConnectionDescriptor;

    fn dialect(&self) -> Dialect {
        self.descriptor().driver_kind.dialect()
    }

    /// Execute SQL verbatim. The text may hold several `;`-separated statements.
    async fn execute(&self, sql: &str) -> Result<u64>;

    async fn count_rows(&self, table: &str) -> Result<u64>;

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Row>>;

    /// Insert rows positionally aligned with `columns`. Returns rows written.
    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64>;

    /// Drop a table if it exists, removing anything that would block the drop.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Enable or disable foreign key enforcement for work done through this connection.
    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()>;

    /// Hook run after a table has been loaded (sequence resets and the like).
    async fn after_load(&self, _table: &TableSchema) -> Result<()> {
        Ok(())
    }

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    async fn close(&self);
}

/// Identifies the dialect a generator writes for.
pub trait DialectSql: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn quote(&self, name: &str) -> String {
        quote_ident(self.dialect(), name)
    }

    fn quote_columns(&self, names: &[String]) -> String {
        quote_list(self.dialect(), names)
    }
}

/// Pure DDL generation for one dialect.
pub trait SchemaBuilder: DialectSql {
    /// Dialect type string for a column, including any `(length[,scale])`.
    fn build_data_type(&self, column: &ColumnSchema) -> String;

    /// `name type [NULL|NOT NULL] [DEFAULT ..] [modifiers]`.
    fn build_column_definition(&self, column: &ColumnSchema) -> String;

    fn build_create_table(&self, table: &TableSchema) -> Result<String>;

    fn build_create_index(&self, table: &str, index: &IndexSchema) -> Result<String>;

    fn build_add_foreign_key(&self, table: &str, fk: &ForeignKeySchema) -> Result<String>;

    fn build_add_column(&self, table: &str, column: &ColumnSchema) -> Result<String>;

    fn build_modify_column(&self, table: &str, column: &ColumnSchema) -> Result<String>;

    fn build_drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote(table))
    }

    fn build_delete_all(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote(table))
    }

    /// Whether `build_create_table` already emits this index.
    fn inlines_index(&self, index: &IndexSchema) -> bool {
        index.index_type == IndexType::Primary
    }

    /// Whether foreign keys are part of `build_create_table`.
    fn embeds_foreign_keys(&self) -> bool {
        false
    }
}

/// Pure DML generation for one dialect.
pub trait QueryBuilder: DialectSql {
    /// Placeholder for the 1-based parameter `index`.
    fn param_placeholder(&self, index: usize) -> String;

    /// Upper bound on bound parameters per statement.
    fn max_params(&self) -> usize;

    fn build_select_page(&self, query: &PageQuery) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT {} OFFSET {}",
            self.quote_columns(&query.columns),
            self.quote(&query.table),
            self.quote_columns(&query.order_by),
            query.limit,
            query.offset
        )
    }

    fn build_count(&self, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.quote(table))
    }

    /// Multi-row INSERT with `rows` groups of placeholders.
    fn build_insert(&self, table: &str, columns: &[String], rows: usize) -> String {
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.quote(table),
            self.quote_columns(columns)
        );
        let mut param = 1;
        for r in 0..rows {
            if r > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for c in 0..columns.len() {
                if c > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&self.param_placeholder(param));
                param += 1;
            }
            sql.push(')');
        }
        sql
    }

    /// Rows per INSERT statement so parameters stay under [`max_params`](Self::max_params).
    fn rows_per_insert(&self, column_count: usize) -> usize {
        (self.max_params() / column_count.max(1)).clamp(1, 1000)
    }
}
