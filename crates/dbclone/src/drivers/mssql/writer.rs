//! SQL Server statement execution and row loading.
//!
//! SQL Server has no session switch for foreign key enforcement, so disabling
//! checks marks constraints `NOCHECK` on the tables being written and
//! re-enabling validates every constraint in the schema again.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tiberius::numeric::Numeric;
use tiberius::Query;
use tracing::{debug, warn};

use super::dialect::MssqlDialect;
use super::reader::{decode_row, MssqlDatabase, TdsClient};
use crate::core::connection::ConnectionDescriptor;
use crate::core::traits::{Database, DialectSql, PageQuery, QueryBuilder, SchemaBuilder};
use crate::core::value::{Row as ValueRow, SqlValue};
use crate::error::Result;

impl MssqlDatabase {
    fn checks_enabled(&self) -> bool {
        self.foreign_key_checks.load(Ordering::SeqCst)
    }

    /// The identity column of `table`, if it has one.
    async fn identity_column(&self, conn: &mut TdsClient, table: &str) -> Result<Option<String>> {
        let mut query = Query::new(
            "SELECT c.name FROM sys.identity_columns c WHERE c.object_id = OBJECT_ID(@P1)",
        );
        query.bind(MssqlDialect.quote(table));
        let row = query.query(conn).await?.into_row().await?;
        Ok(match row {
            Some(row) => row.try_get::<&str, _>(0)?.map(String::from),
            None => None,
        })
    }

    /// Tables in this schema that own at least one foreign key.
    async fn referencing_tables(&self, conn: &mut TdsClient) -> Result<Vec<String>> {
        let mut query = Query::new(
            "SELECT DISTINCT QUOTENAME(s.name) + '.' + QUOTENAME(t.name) \
             FROM sys.foreign_keys fk \
             JOIN sys.tables t ON t.object_id = fk.parent_object_id \
             JOIN sys.schemas s ON s.schema_id = t.schema_id \
             WHERE s.name = @P1",
        );
        query.bind(self.schema.as_str());
        let rows = query.query(conn).await?.into_first_result().await?;
        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(name) = row.try_get::<&str, _>(0)? {
                tables.push(name.to_string());
            }
        }
        Ok(tables)
    }

    async fn insert_chunks(
        &self,
        conn: &mut TdsClient,
        table: &str,
        columns: &[String],
        rows: &[ValueRow],
    ) -> Result<()> {
        let identity = self.identity_column(conn, table).await?;
        let wrap_identity = identity.is_some_and(|c| columns.contains(&c));
        let quoted = MssqlDialect.quote(table);

        if !self.checks_enabled() {
            conn.execute(format!("ALTER TABLE {} NOCHECK CONSTRAINT ALL", quoted), &[])
                .await?;
        }

        let per_statement = MssqlDialect.rows_per_insert(columns.len());
        for chunk in rows.chunks(per_statement) {
            let insert = build_insert(table, columns, chunk);
            let sql = if wrap_identity {
                format!(
                    "SET IDENTITY_INSERT {q} ON; {insert}; SET IDENTITY_INSERT {q} OFF;",
                    q = quoted
                )
            } else {
                insert
            };
            let mut query = Query::new(sql);
            for value in chunk.iter().flatten() {
                bind_value(&mut query, value);
            }
            query.execute(conn).await?;
        }
        Ok(())
    }
}

/// Multi-row INSERT where NULLs are written inline and every other value is
/// a parameter. An untyped NULL parameter arrives as `nvarchar`, which SQL
/// Server refuses to convert into binary columns.
fn build_insert(table: &str, columns: &[String], rows: &[ValueRow]) -> String {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        MssqlDialect.quote(table),
        MssqlDialect.quote_columns(columns)
    );
    let mut param = 1;
    for (r, row) in rows.iter().enumerate() {
        if r > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (c, value) in row.iter().enumerate() {
            if c > 0 {
                sql.push_str(", ");
            }
            if value.is_null() {
                sql.push_str("NULL");
            } else {
                sql.push_str(&MssqlDialect.param_placeholder(param));
                param += 1;
            }
        }
        sql.push(')');
    }
    sql
}

fn bind_value<'a>(query: &mut Query<'a>, value: &'a SqlValue) {
    match value {
        SqlValue::Null => {}
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Decimal(d) => query.bind(Numeric::new_with_scale(d.mantissa(), d.scale() as u8)),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Bytes(b) => query.bind(b.as_slice()),
        SqlValue::Uuid(u) => query.bind(*u),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Time(t) => query.bind(*t),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::DateTimeTz(dt) => query.bind(*dt),
    }
}

#[async_trait]
impl Database for MssqlDatabase {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.client().await?;
        let result = conn.execute(sql, &[]).await?;
        Ok(result.total())
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let mut conn = self.client().await?;
        let row = conn
            .simple_query(MssqlDialect.build_count(table))
            .await?
            .into_row()
            .await?;
        let count = match row {
            Some(row) => row.try_get::<i64, _>(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<ValueRow>> {
        let mut conn = self.client().await?;
        let rows = conn
            .simple_query(MssqlDialect.build_select_page(query))
            .await?
            .into_first_result()
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[ValueRow]) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let mut conn = self.client().await?;
        conn.simple_query("BEGIN TRANSACTION").await?.into_results().await?;
        match self.insert_chunks(&mut conn, table, columns, rows).await {
            Ok(()) => {
                conn.simple_query("COMMIT TRANSACTION").await?.into_results().await?;
            }
            Err(e) => {
                if let Ok(stream) = conn.simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
                    let _ = stream.into_results().await;
                }
                return Err(e);
            }
        }

        debug!(table, rows = rows.len(), "SQL Server: inserted rows");
        Ok(rows.len() as u64)
    }

    /// Drops every foreign key that references the table first.
    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut conn = self.client().await?;
        let mut query = Query::new(
            "DECLARE @sql NVARCHAR(MAX) = N''; \
             SELECT @sql += N'ALTER TABLE ' + QUOTENAME(OBJECT_SCHEMA_NAME(fk.parent_object_id)) \
                 + N'.' + QUOTENAME(OBJECT_NAME(fk.parent_object_id)) \
                 + N' DROP CONSTRAINT ' + QUOTENAME(fk.name) + N'; ' \
             FROM sys.foreign_keys fk WHERE fk.referenced_object_id = OBJECT_ID(@P1); \
             EXEC sp_executesql @sql;",
        );
        query.bind(MssqlDialect.quote(table));
        query.execute(&mut *conn).await?;
        conn.execute(MssqlDialect.build_drop_table(table), &[]).await?;
        Ok(())
    }

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        self.foreign_key_checks.store(enabled, Ordering::SeqCst);
        let mut conn = self.client().await?;
        for table in self.referencing_tables(&mut conn).await? {
            let sql = if enabled {
                format!("ALTER TABLE {} WITH CHECK CHECK CONSTRAINT ALL", table)
            } else {
                format!("ALTER TABLE {} NOCHECK CONSTRAINT ALL", table)
            };
            if let Err(e) = conn.execute(sql, &[]).await {
                warn!(table = %table, "SQL Server: constraint toggle failed: {}", e);
                return Err(e.into());
            }
        }
        debug!(connection = %self.descriptor.name, enabled, "SQL Server: foreign key checks");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.client().await?;
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    async fn close(&self) {
        if self.release_pool() {
            debug!(connection = %self.descriptor.name, "SQL Server: pool closed");
        }
    }
}
