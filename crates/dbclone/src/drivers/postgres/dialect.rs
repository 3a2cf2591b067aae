//! PostgreSQL SQL dialect.

use crate::core::connection::Dialect;
use crate::core::traits::{DialectSql, QueryBuilder};

/// PostgreSQL dialect: double-quoted identifiers, `$n` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl DialectSql for PostgresDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

impl QueryBuilder for PostgresDialect {
    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn max_params(&self) -> usize {
        65_535
    }
}
