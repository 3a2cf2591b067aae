//! Core types shared by every driver.
//!
//! - [`connection`]: connection descriptors, driver kinds and dialects
//! - [`schema`]: the dialect-neutral schema model
//! - [`value`]: SQL values carried between source and target
//! - [`identifier`]: identifier validation and quoting
//! - [`traits`]: the inspector, builder and executor seams drivers implement

pub mod connection;
pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use connection::{ConnectionDescriptor, Dialect, DriverKind};
pub use schema::{
    ColumnDefault, ColumnSchema, DatabaseMetadata, DatabaseSchema, ForeignKeySchema, IndexSchema,
    IndexType, LogicalType, ReferentialAction, TableSchema,
};
pub use traits::{Database, DialectSql, PageQuery, QueryBuilder, SchemaBuilder, SchemaInspector};
pub use value::{Row, SqlValue};
