//! PostgreSQL database driver.
//!
//! - [`PostgresDialect`]: identifier quoting, DML and DDL generation
//! - [`PostgresDatabase`]: deadpool-backed connection, schema inspector and row loader
//!
//! The descriptor's `schema` extra parameter selects the schema (default
//! `public`), `ssl_mode` takes libpq's `sslmode` spelling (default `disable`)
//! and `ssl_root_cert` adds a PEM bundle of trusted roots.

mod builder;
mod dialect;
mod reader;
mod writer;

pub use dialect::PostgresDialect;
pub use reader::PostgresDatabase;
