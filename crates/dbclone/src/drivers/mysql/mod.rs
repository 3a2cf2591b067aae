//! MySQL/MariaDB database driver.
//!
//! - [`MysqlDialect`]: identifier quoting, DML and DDL generation
//! - [`MysqlDatabase`]: pooled connection, schema inspector and row loader
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+
//!
//! Connections use SQLx. The descriptor's `ssl_mode` extra parameter takes
//! SQLx's MySQL spelling (`disabled`, `preferred`, `required`, `verify_ca`,
//! `verify_identity`) and defaults to `preferred`.

mod builder;
mod dialect;
mod reader;
mod writer;

pub use dialect::MysqlDialect;
pub use reader::MysqlDatabase;
