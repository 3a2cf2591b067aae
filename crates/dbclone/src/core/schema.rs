//! Dialect-neutral schema model: tables, columns, indexes, foreign keys.
//!
//! Every inspector produces these types with the same logical type
//! vocabulary (see [`LogicalType`]), so a builder never needs to know which
//! dialect a schema came from.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::identifier::validate_identifier;
use crate::error::{CloneError, Result};

/// Logical type names shared by all inspectors and builders.
pub struct LogicalType;

impl LogicalType {
    pub const TINYINT: &'static str = "tinyint";
    pub const SMALLINT: &'static str = "smallint";
    pub const MEDIUMINT: &'static str = "mediumint";
    pub const INTEGER: &'static str = "integer";
    pub const BIGINT: &'static str = "bigint";
    pub const DECIMAL: &'static str = "decimal";
    pub const FLOAT: &'static str = "float";
    pub const DOUBLE: &'static str = "double";
    pub const BOOLEAN: &'static str = "boolean";
    pub const CHAR: &'static str = "char";
    pub const VARCHAR: &'static str = "varchar";
    pub const TEXT: &'static str = "text";
    pub const MEDIUMTEXT: &'static str = "mediumtext";
    pub const LONGTEXT: &'static str = "longtext";
    pub const BINARY: &'static str = "binary";
    pub const VARBINARY: &'static str = "varbinary";
    pub const BLOB: &'static str = "blob";
    pub const LONGBLOB: &'static str = "longblob";
    pub const DATE: &'static str = "date";
    pub const TIME: &'static str = "time";
    pub const DATETIME: &'static str = "datetime";
    pub const TIMESTAMP: &'static str = "timestamp";
    pub const TIMESTAMPTZ: &'static str = "timestamptz";
    pub const JSON: &'static str = "json";
    pub const UUID: &'static str = "uuid";

    /// Integer family; the only types that may carry `auto_increment`.
    pub fn is_integer(ty: &str) -> bool {
        matches!(
            ty,
            "tinyint" | "smallint" | "mediumint" | "integer" | "bigint"
        )
    }

    pub fn is_numeric(ty: &str) -> bool {
        Self::is_integer(ty) || matches!(ty, "decimal" | "float" | "double")
    }

    /// Plain character strings, without JSON or UUID.
    pub fn is_character(ty: &str) -> bool {
        matches!(ty, "char" | "varchar" | "text" | "mediumtext" | "longtext")
    }

    pub fn is_textual(ty: &str) -> bool {
        matches!(
            ty,
            "char" | "varchar" | "text" | "mediumtext" | "longtext" | "json" | "uuid"
        )
    }
}

/// Column default value.
///
/// Inspectors normalize each dialect's raw default expression into one of
/// these variants; builders render them back per dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ColumnDefault {
    Null,
    Boolean(bool),
    /// Numeric literal, rendered unquoted.
    Number(String),
    /// String literal, rendered quoted with `'` doubled.
    Text(String),
    /// The current timestamp, in whatever spelling the source used.
    CurrentTimestamp,
}

impl ColumnDefault {
    /// Parse a raw default expression as reported by a catalog.
    ///
    /// Handles the common wrappings: SQL Server parentheses `((0))`,
    /// PostgreSQL casts `'a'::character varying`, quoted literals with
    /// doubled quotes. Returns `None` for sequence defaults.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut s = raw.trim();
        while s.len() >= 2 && s.starts_with('(') && s.ends_with(')') && balanced(&s[1..s.len() - 1]) {
            s = s[1..s.len() - 1].trim();
        }

        if s.to_lowercase().starts_with("nextval(") {
            return None;
        }

        if let Some(rest) = s.strip_prefix('\'') {
            if let Some(end) = closing_quote(rest) {
                return Some(ColumnDefault::Text(rest[..end].replace("''", "'")));
            }
        }
        if let Some(rest) = s.strip_prefix("N'") {
            if let Some(end) = closing_quote(rest) {
                return Some(ColumnDefault::Text(rest[..end].replace("''", "'")));
            }
        }

        // Strip a trailing PostgreSQL cast from unquoted values, e.g. `0::integer`.
        let s = match s.find("::") {
            Some(idx) => s[..idx].trim(),
            None => s,
        };

        let lower = s.to_lowercase();
        match lower.as_str() {
            "null" => Some(ColumnDefault::Null),
            "true" => Some(ColumnDefault::Boolean(true)),
            "false" => Some(ColumnDefault::Boolean(false)),
            "current_timestamp" | "current_timestamp()" | "now()" | "getdate()"
            | "sysdatetime()" | "localtimestamp" | "datetime('now')" => {
                Some(ColumnDefault::CurrentTimestamp)
            }
            _ if is_numeric_literal(s) => Some(ColumnDefault::Number(s.to_string())),
            _ => Some(ColumnDefault::Text(s.to_string())),
        }
    }

    /// Build from an unquoted value where quoting has already been removed
    /// by the catalog (MySQL reports `abc` for `DEFAULT 'abc'`).
    pub fn from_unquoted(value: &str, is_expression: bool) -> Self {
        let lower = value.to_lowercase();
        if is_expression || lower.starts_with("current_timestamp") || lower == "now()" {
            return ColumnDefault::CurrentTimestamp;
        }
        if value.starts_with('\'') {
            if let Some(parsed) = ColumnDefault::parse(value) {
                return parsed;
            }
        }
        if lower == "null" {
            return ColumnDefault::Null;
        }
        if is_numeric_literal(value) {
            return ColumnDefault::Number(value.to_string());
        }
        ColumnDefault::Text(value.to_string())
    }
}

fn balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

/// True for integer and decimal literals, optionally signed.
pub fn is_numeric_literal(s: &str) -> bool {
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    !body.is_empty()
        && body.chars().all(|c| c.is_ascii_digit() || c == '.')
        && body.chars().filter(|c| *c == '.').count() <= 1
        && body.chars().any(|c| c.is_ascii_digit())
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,

    /// Logical type name (see [`LogicalType`]).
    #[serde(rename = "type")]
    pub data_type: String,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default)]
    pub default: Option<ColumnDefault>,

    /// Character length, binary length, or numeric precision.
    #[serde(default)]
    pub length: Option<u32>,

    /// Numeric scale.
    #[serde(default)]
    pub scale: Option<u32>,

    #[serde(default)]
    pub unsigned: bool,

    #[serde(default)]
    pub auto_increment: bool,

    #[serde(default)]
    pub comment: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ColumnSchema {
    /// A nullable column with no length or default.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            length: None,
            scale: None,
            unsigned: false,
            auto_increment: false,
            comment: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_precision(mut self, length: u32, scale: u32) -> Self {
        self.length = Some(length);
        self.scale = Some(scale);
        self
    }

    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }
}

/// Index kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Index,
    Unique,
    Primary,
    Fulltext,
    Spatial,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, columns: Vec<String>, index_type: IndexType) -> Self {
        Self {
            name: name.into(),
            columns,
            index_type,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.index_type == IndexType::Primary
    }
}

/// Referential action for ON UPDATE / ON DELETE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
    #[default]
    NoAction,
}

impl ReferentialAction {
    /// Parse a catalog spelling: `CASCADE`, `SET NULL`, `SET_NULL`, `NO ACTION`, ...
    /// `SET DEFAULT` has no counterpart in every dialect and maps to `NO ACTION`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().replace('_', " ").as_str() {
            "CASCADE" => ReferentialAction::Cascade,
            "SET NULL" => ReferentialAction::SetNull,
            "RESTRICT" => ReferentialAction::Restrict,
            _ => ReferentialAction::NoAction,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// Foreign key metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default)]
    pub on_update: ReferentialAction,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySchema>,
    /// Dialect table options such as `engine`, `charset`, `collation`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key(&self) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.is_primary())
    }

    /// Primary key columns in declared order; empty when the table has none.
    pub fn primary_key_columns(&self) -> &[String] {
        self.primary_key().map(|pk| pk.columns.as_slice()).unwrap_or(&[])
    }

    /// Reject malformed schemas before any DDL is generated.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(CloneError::Validation(format!(
                "table '{}' has no columns",
                self.name
            )));
        }

        validate_identifier(&self.name)?;

        let mut seen = HashSet::new();
        for col in &self.columns {
            validate_identifier(&col.name)?;
            if !seen.insert(col.name.as_str()) {
                return Err(CloneError::Validation(format!(
                    "table '{}' has duplicate column '{}'",
                    self.name, col.name
                )));
            }
            if col.auto_increment && !LogicalType::is_integer(&col.data_type) {
                return Err(CloneError::Validation(format!(
                    "column '{}.{}' is auto-increment but has non-integer type '{}'",
                    self.name, col.name, col.data_type
                )));
            }
            if col.scale.is_some() && col.length.is_none() {
                return Err(CloneError::Validation(format!(
                    "column '{}.{}' has a scale without a length",
                    self.name, col.name
                )));
            }
        }

        let primaries = self.indexes.iter().filter(|i| i.is_primary()).count();
        if primaries > 1 {
            return Err(CloneError::Validation(format!(
                "table '{}' declares {} primary keys",
                self.name, primaries
            )));
        }

        for idx in &self.indexes {
            if let Some(missing) = idx.columns.iter().find(|c| !seen.contains(c.as_str())) {
                return Err(CloneError::Validation(format!(
                    "index '{}' on '{}' references unknown column '{}'",
                    idx.name, self.name, missing
                )));
            }
        }

        Ok(())
    }
}

/// Server-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub version: String,
    pub charset: Option<String>,
    pub collation: Option<String>,
}

/// A whole database: tables in the order the caller should create them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableSchema>,
    pub metadata: DatabaseMetadata,
}

impl DatabaseSchema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Copy without the named table (used to exclude the migration ledger).
    pub fn without_table(&self, name: Option<&str>) -> DatabaseSchema {
        match name {
            Some(excluded) => DatabaseSchema {
                tables: self
                    .tables
                    .iter()
                    .filter(|t| t.name != excluded)
                    .cloned()
                    .collect(),
                metadata: self.metadata.clone(),
            },
            None => self.clone(),
        }
    }
}

/// Split a declared type such as `DECIMAL(10, 2) UNSIGNED` into its base
/// name, length, scale and unsigned flag.
pub fn parse_declared_type(declared: &str) -> (String, Option<u32>, Option<u32>, bool) {
    let lower = declared.trim().to_lowercase();
    let unsigned = lower.contains("unsigned");
    let (base, args) = match lower.find('(') {
        Some(open) => {
            let close = lower[open..].find(')').map(|c| open + c).unwrap_or(lower.len());
            (lower[..open].trim().to_string(), Some(lower[open + 1..close].to_string()))
        }
        None => (
            lower.replace("unsigned", "").trim().to_string(),
            None,
        ),
    };

    let mut length = None;
    let mut scale = None;
    if let Some(args) = args {
        let mut parts = args.split(',').map(|p| p.trim().parse::<u32>().ok());
        length = parts.next().flatten();
        scale = parts.next().flatten();
    }
    (base, length, scale, unsigned)
}
