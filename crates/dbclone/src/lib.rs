//! # dbclone
//!
//! Cross-dialect database clone engine.
//!
//! This library clones a source database into one or more targets across
//! MySQL, MariaDB, PostgreSQL, SQL Server and SQLite, with:
//!
//! - **Schema introspection** into a dialect-neutral model
//! - **DDL generation** per target dialect
//! - **Chunked, ordered transfers** with in-flight anonymization
//! - **Batch orchestration** with dependency ordering, cancellation and
//!   aggregated progress
//! - **Run records** sealed with HMAC and an audit signature per run
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbclone::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> dbclone::Result<()> {
//!     let config = Config::load("clone.yaml")?;
//!     let result = Orchestrator::new(config).run().await?;
//!     println!("{}: {} rows", result.status, result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod anonymize;
pub mod classify;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod replicator;
pub mod retry;
pub mod state;
pub mod transfer;

// Re-exports for convenient access
pub use anonymize::{
    ColumnMutation, FakerRegistry, Mutation, RowSelection, SelectionStrategy,
    TableAnonymizationOptions,
};
pub use classify::ErrorKind;
pub use config::{Config, RunConfig, SchemaSyncMode, SynchronizationOptions};
pub use core::{
    ConnectionDescriptor, Database, DatabaseSchema, Dialect, DriverKind, SchemaBuilder,
    SchemaInspector, SqlValue, TableSchema,
};
pub use drivers::{connect, ConnectionManager, Connector, DialectImpl};
pub use error::{CloneError, Result};
pub use orchestrator::{
    BatchHandle, BatchProgress, HealthReport, Orchestrator, RunResult, ValidationReport,
};
pub use replicator::{render_ddl, replicate_database, ReplicationReport};
pub use retry::RetryPolicy;
pub use state::{
    AuditSigner, LogLevel, MemoryLogger, MemoryRunRepository, RunRepository, RunStatus,
    SyncEvent, SyncLogger,
};
pub use transfer::{transfer_table, TransferConfig, TransferStats};
