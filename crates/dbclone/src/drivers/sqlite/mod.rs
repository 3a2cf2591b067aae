//! SQLite database driver.
//!
//! - [`SqliteDialect`]: identifier quoting, DML and DDL generation
//! - [`SqliteDatabase`]: pooled file connection, schema inspector and row loader
//!
//! The descriptor's `database` field is the path of the database file; it is
//! created when missing. Connections run in WAL mode with a busy timeout so
//! concurrent table loads serialize instead of failing.

mod builder;
mod dialect;
mod reader;
mod writer;

pub use dialect::SqliteDialect;
pub use reader::SqliteDatabase;
