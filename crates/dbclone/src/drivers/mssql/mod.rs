//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: bracket quoting, `OFFSET/FETCH` paging and T-SQL DDL
//! - [`MssqlDatabase`]: bb8/Tiberius pool, `sys.*` inspector and row loader
//!
//! Extra parameters: `schema` (default `dbo`), `encrypt` and
//! `trust_server_cert` (both default off).

mod builder;
mod dialect;
mod reader;
mod writer;

pub use dialect::MssqlDialect;
pub use reader::MssqlDatabase;
