//! SQLite statement execution and row loading.
//!
//! `PRAGMA foreign_keys` is per connection and ignored inside a transaction,
//! so it is set on the pooled connection before any transaction begins.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Connection, Executor as _, Row};
use tracing::debug;

use super::dialect::SqliteDialect;
use super::reader::{decode_value, SqliteDatabase};
use crate::core::connection::ConnectionDescriptor;
use crate::core::traits::{Database, PageQuery, QueryBuilder, SchemaBuilder};
use crate::core::value::{Row as ValueRow, SqlValue};
use crate::error::Result;

impl SqliteDatabase {
    async fn session(&self, checks: bool) -> Result<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(if checks {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
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
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Decimal(d) => query.bind(d.to_string()),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Bytes(b) => query.bind(b.as_slice()),
        SqlValue::Uuid(u) => query.bind(u.to_string()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Time(t) => query.bind(*t),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::DateTimeTz(dt) => query.bind(*dt),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.session(self.checks_enabled()).await?;
        let result = (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let row: SqliteRow = sqlx::query(&SqliteDialect.build_count(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?.max(0) as u64)
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<ValueRow>> {
        let sql = SqliteDialect.build_select_page(query);
        let rows: Vec<SqliteRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;
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
        let per_statement = SqliteDialect.rows_per_insert(columns.len());
        for chunk in rows.chunks(per_statement) {
            let sql = SqliteDialect.build_insert(table, columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for value in chunk.iter().flatten() {
                query = bind_value(query, value);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(table, rows = rows.len(), "SQLite: inserted rows");
        Ok(rows.len() as u64)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut conn = self.session(false).await?;
        sqlx::query(&SqliteDialect.build_drop_table(table))
            .execute(&mut *conn)
            .await?;
        if self.checks_enabled() {
            sqlx::query("PRAGMA foreign_keys = ON")
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        self.foreign_key_checks.store(enabled, Ordering::SeqCst);
        debug!(connection = %self.descriptor.name, enabled, "SQLite: foreign key checks");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::SchemaInspector;

    async fn open(dir: &tempfile::TempDir, file: &str) -> SqliteDatabase {
        let path = dir.path().join(file);
        SqliteDatabase::connect(&ConnectionDescriptor::sqlite("t", path.to_string_lossy()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_page_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir, "rows.db").await;
        db.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT, price NUMERIC(8,2), raw BLOB)")
            .await
            .unwrap();

        let columns = vec!["id".to_string(), "label".into(), "price".into(), "raw".into()];
        let rows: Vec<ValueRow> = (1..=5)
            .rev()
            .map(|i| {
                vec![
                    SqlValue::Int(i),
                    SqlValue::Text(format!("item {}", i)),
                    SqlValue::Float(i as f64 * 1.5),
                    if i == 3 { SqlValue::Null } else { SqlValue::Bytes(vec![i as u8]) },
                ]
            })
            .collect();
        assert_eq!(db.insert_rows("items", &columns, &rows).await.unwrap(), 5);
        assert_eq!(db.count_rows("items").await.unwrap(), 5);

        let page = db
            .fetch_page(&PageQuery {
                table: "items".into(),
                columns: columns.clone(),
                order_by: vec!["id".into()],
                limit: 2,
                offset: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0][0], SqlValue::Int(3));
        assert_eq!(page[0][1], SqlValue::Text("item 3".into()));
        assert_eq!(page[0][3], SqlValue::Null);
        assert_eq!(page[1][3], SqlValue::Bytes(vec![4]));
    }

    #[tokio::test]
    async fn test_drop_table_referenced_by_foreign_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir, "fk.db").await;
        db.execute(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY); \
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id)); \
             INSERT INTO parent (id) VALUES (1); \
             INSERT INTO child (id, parent_id) VALUES (1, 1);",
        )
        .await
        .unwrap();

        db.drop_table("parent").await.unwrap();
        db.drop_table("missing").await.unwrap();
        assert_eq!(db.get_table_names().await.unwrap(), vec!["child"]);
    }

    #[tokio::test]
    async fn test_foreign_key_checks_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir, "toggle.db").await;
        db.execute(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY); \
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));",
        )
        .await
        .unwrap();
        let columns = vec!["id".to_string(), "parent_id".into()];
        let orphan = vec![vec![SqlValue::Int(1), SqlValue::Int(42)]];

        let err = db.insert_rows("child", &columns, &orphan).await.unwrap_err();
        assert_eq!(err.kind(), crate::classify::ErrorKind::ForeignKeyViolation);

        db.set_foreign_key_checks(false).await.unwrap();
        assert_eq!(db.insert_rows("child", &columns, &orphan).await.unwrap(), 1);
    }
}
