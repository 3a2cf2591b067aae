//! SQLite SQL dialect.

use crate::core::connection::Dialect;
use crate::core::traits::{DialectSql, QueryBuilder};

/// SQLite dialect: double-quoted identifiers, `?` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl DialectSql for SqliteDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}

impl QueryBuilder for SqliteDialect {
    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    // SQLITE_MAX_VARIABLE_NUMBER on builds older than 3.32.
    fn max_params(&self) -> usize {
        999
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::PageQuery;

    #[test]
    fn test_rows_per_insert() {
        assert_eq!(SqliteDialect.rows_per_insert(3), 333);
        assert_eq!(SqliteDialect.rows_per_insert(2000), 1);
    }

    #[test]
    fn test_select_page() {
        let sql = SqliteDialect.build_select_page(&PageQuery {
            table: "users".into(),
            columns: vec!["id".into(), "name".into()],
            order_by: vec!["id".into()],
            limit: 2,
            offset: 2,
        });
        assert_eq!(sql, "SELECT \"id\", \"name\" FROM \"users\" ORDER BY \"id\" LIMIT 2 OFFSET 2");
    }
}
