//! MySQL/MariaDB statement execution and row loading.
//!
//! `FOREIGN_KEY_CHECKS` is session state, so every write acquires a pooled
//! connection and sets the flag on it before running.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlArguments, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Connection, Executor as _, Row};
use tracing::debug;

use super::dialect::MysqlDialect;
use super::reader::{decode_value, MysqlDatabase};
use crate::core::connection::ConnectionDescriptor;
use crate::core::traits::{Database, PageQuery, QueryBuilder, SchemaBuilder};
use crate::core::value::{Row as ValueRow, SqlValue};
use crate::error::Result;

impl MysqlDatabase {
    async fn session(&self, checks: bool) -> Result<PoolConnection<MySql>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(if checks {
            "SET FOREIGN_KEY_CHECKS = 1"
        } else {
            "SET FOREIGN_KEY_CHECKS = 0"
        })
        .execute(&mut *conn)
        .await?;
        Ok(conn)
    }

    fn checks_enabled(&self) -> bool {
        self.foreign_key_checks.load(Ordering::SeqCst)
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Decimal(d) => query.bind(*d),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Bytes(b) => query.bind(b.as_slice()),
        SqlValue::Uuid(u) => query.bind(u.to_string()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Time(t) => query.bind(*t),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::DateTimeTz(dt) => query.bind(dt.naive_utc()),
    }
}

#[async_trait]
impl Database for MysqlDatabase {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.session(self.checks_enabled()).await?;
        let result = (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let row: MySqlRow = sqlx::query(&MysqlDialect.build_count(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?.max(0) as u64)
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<ValueRow>> {
        let sql = MysqlDialect.build_select_page(query);
        let rows: Vec<MySqlRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                (0..query.columns.len())
                    .map(|i| decode_value(row, i))
                    .collect::<Result<ValueRow>>()
            })
            .collect()
    }

    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[ValueRow]) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let mut conn = self.session(self.checks_enabled()).await?;
        let mut tx = conn.begin().await?;
        let per_statement = MysqlDialect.rows_per_insert(columns.len());
        for chunk in rows.chunks(per_statement) {
            let sql = MysqlDialect.build_insert(table, columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for value in chunk.iter().flatten() {
                query = bind_value(query, value);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(table, rows = rows.len(), "MySQL: inserted rows");
        Ok(rows.len() as u64)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut conn = self.session(false).await?;
        sqlx::query(&MysqlDialect.build_drop_table(table))
            .execute(&mut *conn)
            .await?;
        if self.checks_enabled() {
            sqlx::query("SET FOREIGN_KEY_CHECKS = 1")
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        self.foreign_key_checks.store(enabled, Ordering::SeqCst);
        debug!(connection = %self.descriptor.name, enabled, "MySQL: foreign key checks");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
