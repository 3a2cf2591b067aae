//! DDL rendering helpers shared by the per-dialect schema builders.

use crate::core::identifier::quote_literal;
use crate::core::schema::{ColumnDefault, ColumnSchema, ForeignKeySchema, ReferentialAction};
use crate::core::traits::DialectSql;

/// Rendered types that never take a length suffix.
const MAX_FAMILY: &[&str] = &[
    "TEXT",
    "TINYTEXT",
    "MEDIUMTEXT",
    "LONGTEXT",
    "BLOB",
    "TINYBLOB",
    "MEDIUMBLOB",
    "LONGBLOB",
    "BYTEA",
    "JSON",
    "JSONB",
    "NTEXT",
    "IMAGE",
];

/// Whether a rendered type is unbounded (`TEXT`, `VARCHAR(MAX)`, `BYTEA`, ...).
pub fn is_max_family(rendered: &str) -> bool {
    let upper = rendered.to_uppercase();
    upper.contains("(MAX)") || MAX_FAMILY.contains(&upper.as_str())
}

/// Append `(length,scale)` or `(length)` to a base type, unless the base is
/// unbounded.
pub fn sized(base: &str, column: &ColumnSchema) -> String {
    if is_max_family(base) {
        return base.to_string();
    }
    match (column.length, column.scale) {
        (Some(length), Some(scale)) => format!("{}({},{})", base, length, scale),
        (Some(length), None) => format!("{}({})", base, length),
        _ => base.to_string(),
    }
}

/// Like [`sized`], with a fallback length when the column has none.
pub fn sized_or(base: &str, column: &ColumnSchema, fallback: u32) -> String {
    if column.length.is_none() {
        return format!("{}({})", base, fallback);
    }
    sized(base, column)
}

/// Render a default value. Numbers pass through, text is quoted.
pub fn render_default(default: &ColumnDefault, boolean_keywords: bool) -> String {
    match default {
        ColumnDefault::Null => "NULL".to_string(),
        ColumnDefault::Boolean(b) if boolean_keywords => {
            if *b { "TRUE" } else { "FALSE" }.to_string()
        }
        ColumnDefault::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        ColumnDefault::Number(n) => n.clone(),
        ColumnDefault::Text(s) => quote_literal(s),
        ColumnDefault::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
    }
}

/// `FOREIGN KEY (..) REFERENCES t (..) ON UPDATE .. ON DELETE ..`
pub fn foreign_key_clause<B: DialectSql + ?Sized>(
    builder: &B,
    fk: &ForeignKeySchema,
    map_action: fn(ReferentialAction) -> ReferentialAction,
) -> String {
    format!(
        "FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
        builder.quote_columns(&fk.columns),
        builder.quote(&fk.referenced_table),
        builder.quote_columns(&fk.referenced_columns),
        map_action(fk.on_update).as_sql(),
        map_action(fk.on_delete).as_sql()
    )
}

/// Identity mapping for dialects that support every referential action.
pub fn same_action(action: ReferentialAction) -> ReferentialAction {
    action
}
