//! MySQL/MariaDB SQL dialect.

use crate::core::connection::Dialect;
use crate::core::traits::{DialectSql, QueryBuilder};

/// MySQL/MariaDB dialect: backtick identifiers, `?` placeholders.
///
/// Compatible with MySQL 5.7+, 8.0+ and MariaDB 10.2+.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

impl DialectSql for MysqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }
}

impl QueryBuilder for MysqlDialect {
    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn max_params(&self) -> usize {
        65_535
    }
}
