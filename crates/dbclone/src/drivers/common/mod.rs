//! Common utilities shared across database drivers.
//!
//! - [`catalog`]: folding catalog rows into index and foreign key definitions
//! - [`ddl`]: type sizing, default rendering and FK clauses for schema builders
//! - [`tls`]: TLS configuration for PostgreSQL connections

pub mod catalog;
pub mod ddl;
pub mod tls;

pub use tls::{SslMode, TlsBuilder};
