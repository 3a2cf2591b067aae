//! Database driver implementations.
//!
//! - [`mysql`]: MySQL and MariaDB over SQLx
//! - [`postgres`]: PostgreSQL over tokio-postgres and deadpool
//! - [`mssql`]: SQL Server over Tiberius and bb8
//! - [`sqlite`]: SQLite over SQLx
//! - [`common`]: shared catalog, DDL and TLS helpers
//!
//! # Architecture
//!
//! Each driver provides a stateless dialect struct implementing
//! [`SchemaBuilder`] and [`QueryBuilder`], and a pooled database type
//! implementing [`Database`]. [`DialectImpl`] dispatches the pure generators
//! statically; live connections are handed out as `Arc<dyn Database>` by the
//! [`ConnectionManager`].

pub mod common;
pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use common::{SslMode, TlsBuilder};
pub use mssql::{MssqlDatabase, MssqlDialect};
pub use mysql::{MysqlDatabase, MysqlDialect};
pub use postgres::{PostgresDatabase, PostgresDialect};
pub use sqlite::{SqliteDatabase, SqliteDialect};

use crate::core::connection::{ConnectionDescriptor, Dialect};
use crate::core::schema::{ColumnSchema, ForeignKeySchema, IndexSchema, TableSchema};
use crate::core::traits::{Database, DialectSql, PageQuery, QueryBuilder, SchemaBuilder};
use crate::classify::ErrorKind;
use crate::error::{CloneError, Result};
use crate::retry::RetryPolicy;

/// Enum-based static dispatch over the four dialects.
#[derive(Debug, Clone, Copy)]
pub enum DialectImpl {
    Mysql(MysqlDialect),
    Postgres(PostgresDialect),
    SqlServer(MssqlDialect),
    Sqlite(SqliteDialect),
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $call:expr) => {
        match $self {
            DialectImpl::Mysql($d) => $call,
            DialectImpl::Postgres($d) => $call,
            DialectImpl::SqlServer($d) => $call,
            DialectImpl::Sqlite($d) => $call,
        }
    };
}

impl DialectImpl {
    pub fn from_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Mysql => DialectImpl::Mysql(MysqlDialect),
            Dialect::Postgres => DialectImpl::Postgres(PostgresDialect),
            Dialect::SqlServer => DialectImpl::SqlServer(MssqlDialect),
            Dialect::Sqlite => DialectImpl::Sqlite(SqliteDialect),
        }
    }
}

impl DialectSql for DialectImpl {
    fn dialect(&self) -> Dialect {
        dispatch!(self, d => d.dialect())
    }
}

impl SchemaBuilder for DialectImpl {
    fn build_data_type(&self, column: &ColumnSchema) -> String {
        dispatch!(self, d => d.build_data_type(column))
    }

    fn build_column_definition(&self, column: &ColumnSchema) -> String {
        dispatch!(self, d => d.build_column_definition(column))
    }

    fn build_create_table(&self, table: &TableSchema) -> Result<String> {
        dispatch!(self, d => d.build_create_table(table))
    }

    fn build_create_index(&self, table: &str, index: &IndexSchema) -> Result<String> {
        dispatch!(self, d => d.build_create_index(table, index))
    }

    fn build_add_foreign_key(&self, table: &str, fk: &ForeignKeySchema) -> Result<String> {
        dispatch!(self, d => d.build_add_foreign_key(table, fk))
    }

    fn build_add_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        dispatch!(self, d => d.build_add_column(table, column))
    }

    fn build_modify_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        dispatch!(self, d => d.build_modify_column(table, column))
    }

    fn build_drop_table(&self, table: &str) -> String {
        dispatch!(self, d => d.build_drop_table(table))
    }

    fn build_delete_all(&self, table: &str) -> String {
        dispatch!(self, d => d.build_delete_all(table))
    }

    fn inlines_index(&self, index: &IndexSchema) -> bool {
        dispatch!(self, d => d.inlines_index(index))
    }

    fn embeds_foreign_keys(&self) -> bool {
        dispatch!(self, d => d.embeds_foreign_keys())
    }
}

impl QueryBuilder for DialectImpl {
    fn param_placeholder(&self, index: usize) -> String {
        dispatch!(self, d => d.param_placeholder(index))
    }

    fn max_params(&self) -> usize {
        dispatch!(self, d => d.max_params())
    }

    fn build_select_page(&self, query: &PageQuery) -> String {
        dispatch!(self, d => d.build_select_page(query))
    }

    fn build_count(&self, table: &str) -> String {
        dispatch!(self, d => d.build_count(table))
    }
}

/// Open a pooled connection for a descriptor.
pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Database>> {
    let db: Arc<dyn Database> = match descriptor.driver_kind.dialect() {
        Dialect::Mysql => Arc::new(MysqlDatabase::connect(descriptor).await?),
        Dialect::Postgres => Arc::new(PostgresDatabase::connect(descriptor).await?),
        Dialect::SqlServer => Arc::new(MssqlDatabase::connect(descriptor).await?),
        Dialect::Sqlite => Arc::new(SqliteDatabase::connect(descriptor).await?),
    };
    Ok(db)
}

/// Opens a database for a descriptor. [`connect`] unless replaced.
pub type Connector =
    Arc<dyn Fn(ConnectionDescriptor) -> BoxFuture<'static, Result<Arc<dyn Database>>> + Send + Sync>;

fn default_connector() -> Connector {
    Arc::new(
        |descriptor: ConnectionDescriptor| -> BoxFuture<'static, Result<Arc<dyn Database>>> {
            Box::pin(async move { connect(&descriptor).await })
        },
    )
}

/// Opens and caches one pool per descriptor for the lifetime of a run.
///
/// Pools are keyed by [`ConnectionDescriptor::pool_key`], so two runs never
/// share a pool even when their connections carry the same name. Each key
/// has its own cell: opening one pool, including its retry backoff, never
/// blocks lookups of another.
pub struct ConnectionManager {
    run_id: String,
    retry: RetryPolicy,
    connector: Connector,
    cancel: Option<CancellationToken>,
    pools: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn Database>>>>>,
}

impl ConnectionManager {
    pub fn new(run_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            run_id: run_id.into(),
            retry,
            connector: default_connector(),
            cancel: None,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    /// Stop waiting between connect attempts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The cached pool for `descriptor`, opening it (with retries) on first use.
    ///
    /// This is the only place connection failures are retried. An exhausted
    /// connect always surfaces as [`CloneError::Connection`].
    pub async fn get(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Database>> {
        let key = descriptor.pool_key(&self.run_id);
        let cell = {
            let mut pools = self.pools.lock().await;
            Arc::clone(pools.entry(key.clone()).or_default())
        };

        let db = cell.get_or_try_init(|| self.open(descriptor)).await?;
        Ok(Arc::clone(db))
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Database>> {
        let label = format!("connect {}", descriptor.name);
        let db = self
            .retry
            .run(&label, self.cancel.as_ref(), || (self.connector)(descriptor.clone()))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Transient => CloneError::connection(&descriptor.name, e.to_string()),
                _ => e,
            })?;
        debug!(pool = %descriptor.pool_key(&self.run_id), "Opened connection pool");
        Ok(db)
    }

    /// Close every pool opened by this manager.
    pub async fn close_all(&self) {
        let mut pools = self.pools.lock().await;
        for (key, cell) in pools.drain() {
            if let Some(db) = cell.get() {
                db.close().await;
                debug!(pool = %key, "Closed connection pool");
            }
        }
        info!(run_id = %self.run_id, "Connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::DriverKind;
    use crate::core::schema::{ColumnSchema, LogicalType};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_dialect_impl_from_driver() {
        let cases = [
            (DriverKind::Mysql, "`t`"),
            (DriverKind::Mariadb, "`t`"),
            (DriverKind::Postgres, "\"t\""),
            (DriverKind::Sqlserver, "[t]"),
            (DriverKind::Sqlite, "\"t\""),
        ];
        for (kind, quoted) in cases {
            let dialect = DialectImpl::from_dialect(kind.dialect());
            assert_eq!(dialect.quote("t"), quoted);
            assert_eq!(dialect.dialect(), kind.dialect());
        }
    }

    #[test]
    fn test_dialect_impl_dispatches_builders() {
        let col = ColumnSchema::new("id", LogicalType::BIGINT).auto_increment();
        assert_eq!(
            DialectImpl::from_dialect(Dialect::Postgres).build_data_type(&col),
            "BIGSERIAL"
        );
        assert_eq!(DialectImpl::from_dialect(Dialect::Postgres).param_placeholder(3), "$3");
        assert_eq!(DialectImpl::from_dialect(Dialect::SqlServer).param_placeholder(3), "@P3");
        assert!(DialectImpl::from_dialect(Dialect::Sqlite).embeds_foreign_keys());
        assert!(!DialectImpl::from_dialect(Dialect::Mysql).embeds_foreign_keys());
    }

    #[tokio::test]
    async fn test_connection_manager_caches_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let descriptor = ConnectionDescriptor::sqlite("local", path.to_string_lossy());

        let manager = ConnectionManager::new("run-1", RetryPolicy::new(1, Duration::ZERO));
        let a = manager.get(&descriptor).await.unwrap();
        let b = manager.get(&descriptor).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = ConnectionManager::new("run-2", RetryPolicy::once());
        let c = other.get(&descriptor).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        manager.close_all().await;
        other.close_all().await;
    }

    /// Connector that counts attempts and fails for descriptors named `bad`.
    fn counting_connector(calls: Arc<AtomicU32>) -> Connector {
        Arc::new(move |descriptor: ConnectionDescriptor| -> BoxFuture<'static, Result<Arc<dyn Database>>> {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                if descriptor.name == "bad" {
                    calls.fetch_add(1, Ordering::SeqCst);
                    return Err(CloneError::connection("bad", "connection refused"));
                }
                connect(&descriptor).await
            })
        })
    }

    #[tokio::test]
    async fn test_failing_connect_does_not_block_cached_pools() {
        let dir = tempfile::tempdir().unwrap();
        let good = ConnectionDescriptor::sqlite("good", dir.path().join("good.db").to_string_lossy());
        let bad = ConnectionDescriptor::sqlite("bad", dir.path().join("bad.db").to_string_lossy());
        let calls = Arc::new(AtomicU32::new(0));

        let manager = Arc::new(
            ConnectionManager::new("run-1", RetryPolicy::new(2, Duration::from_secs(2)))
                .with_connector(counting_connector(Arc::clone(&calls))),
        );
        manager.get(&good).await.unwrap();

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get(&bad).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // The bad descriptor is now in its backoff.
        let started = Instant::now();
        manager.get(&good).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let err = pending.await.unwrap().err().unwrap();
        assert!(matches!(err, CloneError::Connection { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_connect_attempts_follow_policy() {
        let dir = tempfile::tempdir().unwrap();
        let bad = ConnectionDescriptor::sqlite("bad", dir.path().join("bad.db").to_string_lossy());
        let calls = Arc::new(AtomicU32::new(0));
        let manager = ConnectionManager::new("run-1", RetryPolicy::new(3, Duration::ZERO))
            .with_connector(counting_connector(Arc::clone(&calls)));

        assert!(manager.get(&bad).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // A failed open is not cached; the next lookup tries again.
        assert!(manager.get(&bad).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_cancel_stops_connect_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let bad = ConnectionDescriptor::sqlite("bad", dir.path().join("bad.db").to_string_lossy());
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let manager = ConnectionManager::new("run-1", RetryPolicy::new(2, Duration::from_secs(60)))
            .with_connector(counting_connector(Arc::clone(&calls)))
            .with_cancellation(token.clone());

        token.cancel();
        let err = manager.get(&bad).await.err().unwrap();
        assert!(matches!(err, CloneError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
