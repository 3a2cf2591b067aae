//! Identifier validation and quoting.
//!
//! Identifiers (table, column, index names) cannot be bound as statement
//! parameters, so they are validated once when a schema is checked and then
//! quoted per dialect everywhere SQL is generated. Values are never quoted
//! here; see [`quote_literal`] for default-value literals.

use super::connection::Dialect;
use crate::error::{CloneError, Result};

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - SQL Server: 128 characters
/// - MySQL: 64 characters
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CloneError::Validation("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(CloneError::Validation(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(CloneError::Validation(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an identifier for the given dialect.
///
/// Backticks for MySQL, brackets for SQL Server, double quotes for
/// PostgreSQL and SQLite. The closing delimiter is escaped by doubling.
pub fn quote_ident(dialect: Dialect, name: &str) -> String {
    match dialect {
        Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        Dialect::SqlServer => format!("[{}]", name.replace(']', "]]")),
        Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// Quote and join a column list: `"a", "b"`.
pub fn quote_list(dialect: Dialect, names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(dialect, n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quote a string literal with single-quote doubling.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
