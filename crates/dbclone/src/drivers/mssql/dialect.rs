//! SQL Server dialect.
//!
//! Paging uses `OFFSET .. ROWS FETCH NEXT .. ROWS ONLY`, which requires an
//! `ORDER BY`; [`PageQuery`] always carries one.

use crate::core::connection::Dialect;
use crate::core::traits::{DialectSql, PageQuery, QueryBuilder};

/// SQL Server dialect: bracketed identifiers, `@Pn` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialect;

impl DialectSql for MssqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
    }
}

impl QueryBuilder for MssqlDialect {
    fn param_placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    // TDS caps an RPC call at 2100 parameters.
    fn max_params(&self) -> usize {
        2000
    }

    fn build_select_page(&self, query: &PageQuery) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY {} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            self.quote_columns(&query.columns),
            self.quote(&query.table),
            self.quote_columns(&query.order_by),
            query.offset,
            query.limit
        )
    }

    fn build_count(&self, table: &str) -> String {
        format!("SELECT COUNT_BIG(*) FROM {}", self.quote(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_page_uses_offset_fetch() {
        let sql = MssqlDialect.build_select_page(&PageQuery {
            table: "orders".into(),
            columns: vec!["id".into(), "total".into()],
            order_by: vec!["id".into()],
            limit: 100,
            offset: 200,
        });
        assert_eq!(
            sql,
            "SELECT [id], [total] FROM [orders] ORDER BY [id] OFFSET 200 ROWS FETCH NEXT 100 ROWS ONLY"
        );
    }

    #[test]
    fn test_insert_placeholders() {
        let sql = MssqlDialect.build_insert("t", &["a".into()], 3);
        assert_eq!(sql, "INSERT INTO [t] ([a]) VALUES (@P1), (@P2), (@P3)");
        assert_eq!(MssqlDialect.rows_per_insert(10), 200);
    }

    #[test]
    fn test_count_uses_count_big() {
        assert_eq!(MssqlDialect.build_count("t"), "SELECT COUNT_BIG(*) FROM [t]");
    }
}
