//! SQLite connection and schema inspector.
//!
//! Schema comes from the `pragma_*` table-valued functions, which accept the
//! table name as a bound parameter. `scope` names an attached schema and
//! defaults to `main`.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::info;

use crate::core::connection::{ConnectionDescriptor, Dialect};
use crate::core::identifier::quote_ident;
use crate::core::schema::{
    parse_declared_type, ColumnDefault, ColumnSchema, DatabaseMetadata, IndexSchema, IndexType,
    LogicalType, TableSchema,
};
use crate::core::traits::SchemaInspector;
use crate::core::value::SqlValue;
use crate::drivers::common::catalog::{group_foreign_keys, ForeignKeyColumnRow};
use crate::error::{CloneError, Result};

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// A pooled SQLite database file.
pub struct SqliteDatabase {
    pub(super) descriptor: ConnectionDescriptor,
    pub(super) pool: SqlitePool,
    /// Applied to each pooled connection before it writes.
    pub(super) foreign_key_checks: AtomicBool,
}

impl SqliteDatabase {
    /// Open (creating if missing) the database file named by `descriptor.database`.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&descriptor.database)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(descriptor.max_connections())
            .connect_with(options)
            .await
            .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;

        info!(connection = %descriptor.name, "Opened SQLite database {}", descriptor.database);

        Ok(Self {
            descriptor: descriptor.clone(),
            pool,
            foreign_key_checks: AtomicBool::new(true),
        })
    }

    async fn table_sql(&self, scope: &str, table: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
            quote_ident(Dialect::Sqlite, scope)
        );
        let row: Option<SqliteRow> = sqlx::query(&sql).bind(table).fetch_optional(&self.pool).await?;
        Ok(match row {
            Some(row) => row.try_get::<Option<String>, _>(0)?,
            None => None,
        })
    }

    async fn load_columns(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?, ?) ORDER BY cid"#,
        )
        .bind(&table.name)
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        let create_sql = self.table_sql(scope, &table.name).await?.unwrap_or_default();
        let has_autoincrement = declares_autoincrement(&create_sql);

        let mut pk: Vec<(i64, String)> = Vec::new();
        for row in &rows {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get::<Option<String>, _>("type")?.unwrap_or_default();
            let pk_pos: i64 = row.try_get("pk")?;

            let mut col = map_declared_type(name.clone(), &declared);
            col.nullable = row.try_get::<i64, _>("notnull")? == 0;
            col.default = row
                .try_get::<Option<String>, _>("dflt_value")?
                .and_then(|raw| ColumnDefault::parse(&raw))
                .map(|d| match (col.data_type.as_str(), d) {
                    (LogicalType::BOOLEAN, ColumnDefault::Number(n)) => ColumnDefault::Boolean(n != "0"),
                    (_, d) => d,
                });
            if pk_pos > 0 {
                pk.push((pk_pos, name));
            }
            table.columns.push(col);
        }

        pk.sort_by_key(|(pos, _)| *pos);
        if let [(_, only)] = pk.as_slice() {
            // A lone INTEGER primary key aliases the rowid and is assigned automatically.
            let rowid_alias = rows.iter().any(|r| {
                r.try_get::<String, _>("name").ok().as_deref() == Some(only.as_str())
                    && r.try_get::<Option<String>, _>("type")
                        .ok()
                        .flatten()
                        .is_some_and(|t| t.eq_ignore_ascii_case("INTEGER"))
            });
            if rowid_alias || has_autoincrement {
                if let Some(col) = table.columns.iter_mut().find(|c| &c.name == only) {
                    if LogicalType::is_integer(&col.data_type) {
                        col.auto_increment = true;
                        col.nullable = false;
                        col.default = None;
                    }
                }
            }
        }
        if !pk.is_empty() {
            table.indexes.push(IndexSchema::new(
                "PRIMARY",
                pk.into_iter().map(|(_, name)| name).collect(),
                IndexType::Primary,
            ));
        }
        Ok(())
    }

    async fn load_indexes(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"SELECT name, "unique", origin FROM pragma_index_list(?, ?) ORDER BY name"#,
        )
        .bind(&table.name)
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let origin: String = row.try_get("origin")?;
            if origin == "pk" {
                continue;
            }
            let name: String = row.try_get("name")?;
            let unique = row.try_get::<i64, _>("unique")? == 1;

            let columns: Vec<String> = sqlx::query(
                "SELECT name FROM pragma_index_info(?, ?) ORDER BY seqno",
            )
            .bind(&name)
            .bind(scope)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| r.try_get::<Option<String>, _>("name").map(Option::unwrap_or_default))
            .collect::<std::result::Result<_, _>>()?;

            // Constraint-backed indexes get generated names that cannot be reused.
            let name = if name.starts_with("sqlite_autoindex_") {
                format!("{}_{}_unique", table.name, columns.join("_"))
            } else {
                name
            };
            let index_type = if unique { IndexType::Unique } else { IndexType::Index };
            table.indexes.push(IndexSchema::new(name, columns, index_type));
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"SELECT id, "table", "from", "to", on_update, on_delete
               FROM pragma_foreign_key_list(?, ?) ORDER BY id, seq"#,
        )
        .bind(&table.name)
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        let mut raw = Vec::with_capacity(rows.len());
        for row in &rows {
            let from: String = row.try_get("from")?;
            raw.push((
                row.try_get::<i64, _>("id")?,
                ForeignKeyColumnRow {
                    constraint_name: String::new(),
                    referenced_column: row.try_get::<Option<String>, _>("to")?.unwrap_or_else(|| from.clone()),
                    column_name: from,
                    referenced_table: row.try_get("table")?,
                    on_update: row.try_get("on_update")?,
                    on_delete: row.try_get("on_delete")?,
                },
            ));
        }

        // SQLite does not report constraint names; derive one per FK id.
        let mut entries = Vec::with_capacity(raw.len());
        for (id, mut entry) in raw.clone() {
            let columns: Vec<&str> = raw
                .iter()
                .filter(|(other, _)| *other == id)
                .map(|(_, r)| r.column_name.as_str())
                .collect();
            entry.constraint_name = format!("{}_{}_foreign", table.name, columns.join("_"));
            entries.push(entry);
        }
        table.foreign_keys = group_foreign_keys(entries);
        Ok(())
    }
}

#[async_trait]
impl SchemaInspector for SqliteDatabase {
    async fn table_names_in(&self, scope: Option<&str>) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_ident(Dialect::Sqlite, scope.unwrap_or("main"))
        );
        let rows: Vec<SqliteRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>(0).map_err(CloneError::from))
            .collect()
    }

    async fn table_schema_in(&self, scope: Option<&str>, table: &str) -> Result<TableSchema> {
        let scope = scope.unwrap_or("main");
        let mut schema = TableSchema::new(table);
        self.load_columns(scope, &mut schema).await?;
        if schema.columns.is_empty() {
            return Err(CloneError::query(format!("no such table: {}", table), None));
        }
        self.load_indexes(scope, &mut schema).await?;
        self.load_foreign_keys(scope, &mut schema).await?;
        Ok(schema)
    }

    async fn get_database_metadata(&self) -> Result<DatabaseMetadata> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await?;
        let encoding: Option<String> = sqlx::query_scalar("PRAGMA encoding")
            .fetch_optional(&self.pool)
            .await?;
        Ok(DatabaseMetadata {
            version,
            charset: encoding,
            collation: None,
        })
    }
}

/// Whether a CREATE TABLE statement uses the AUTOINCREMENT keyword, as a
/// bare word outside comments, string literals and quoted identifiers.
fn declares_autoincrement(sql: &str) -> bool {
    let mut chars = sql.chars().peekable();
    let mut word = String::new();
    while let Some(c) = chars.next() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            word.push(c);
            continue;
        }
        if word.eq_ignore_ascii_case("AUTOINCREMENT") {
            return true;
        }
        word.clear();
        match c {
            '\'' | '"' | '`' => {
                while let Some(q) = chars.next() {
                    // A doubled quote is an escaped quote.
                    if q == c && chars.next_if_eq(&c).is_none() {
                        break;
                    }
                }
            }
            '[' => {
                for q in chars.by_ref() {
                    if q == ']' {
                        break;
                    }
                }
            }
            '-' if chars.next_if_eq(&'-').is_some() => {
                for q in chars.by_ref() {
                    if q == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.next_if_eq(&'*').is_some() => {
                let mut prev = ' ';
                for q in chars.by_ref() {
                    if prev == '*' && q == '/' {
                        break;
                    }
                    prev = q;
                }
            }
            _ => {}
        }
    }
    word.eq_ignore_ascii_case("AUTOINCREMENT")
}

/// Map a declared column type to the logical vocabulary using SQLite's
/// type-affinity spelling rules.
fn map_declared_type(name: String, declared: &str) -> ColumnSchema {
    let (base, length, scale, unsigned) = parse_declared_type(declared);

    let (logical, keep_length) = match base.as_str() {
        "tinyint" => (LogicalType::TINYINT, false),
        "smallint" | "int2" => (LogicalType::SMALLINT, false),
        "mediumint" => (LogicalType::MEDIUMINT, false),
        "integer" | "int" | "int4" => (LogicalType::INTEGER, false),
        "bigint" | "int8" | "unsigned big int" => (LogicalType::BIGINT, false),
        "boolean" | "bool" => (LogicalType::BOOLEAN, false),
        "decimal" | "numeric" => (LogicalType::DECIMAL, true),
        "float" => (LogicalType::FLOAT, false),
        "real" | "double" | "double precision" => (LogicalType::DOUBLE, false),
        "char" | "character" | "nchar" | "native character" => (LogicalType::CHAR, true),
        "varchar" | "nvarchar" | "varying character" => (LogicalType::VARCHAR, true),
        "text" | "clob" | "tinytext" => (LogicalType::TEXT, false),
        "mediumtext" => (LogicalType::MEDIUMTEXT, false),
        "longtext" => (LogicalType::LONGTEXT, false),
        "binary" => (LogicalType::BINARY, true),
        "varbinary" => (LogicalType::VARBINARY, true),
        "blob" | "" => (LogicalType::BLOB, false),
        "longblob" | "mediumblob" => (LogicalType::LONGBLOB, false),
        "date" => (LogicalType::DATE, false),
        "time" => (LogicalType::TIME, false),
        "datetime" => (LogicalType::DATETIME, false),
        "timestamp" => (LogicalType::TIMESTAMP, false),
        "timestamptz" => (LogicalType::TIMESTAMPTZ, false),
        "json" => (LogicalType::JSON, false),
        "uuid" => (LogicalType::UUID, false),
        other if other.contains("int") => (LogicalType::BIGINT, false),
        other if other.contains("char") || other.contains("text") => (LogicalType::TEXT, false),
        _ => (LogicalType::TEXT, false),
    };

    let mut col = ColumnSchema::new(name, logical);
    if keep_length {
        col.length = length;
        col.scale = scale.filter(|_| length.is_some());
    }
    col.unsigned = unsigned;
    col
}

/// Decode one column using the value's storage class and the declared type.
pub(super) fn decode_value(row: &SqliteRow, index: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let storage = raw.type_info().name().to_uppercase();
    let declared = row.column(index).type_info().name().to_uppercase();

    let value = match storage.as_str() {
        "INTEGER" if declared == "BOOLEAN" => SqlValue::Bool(row.try_get::<i64, _>(index)? != 0),
        "INTEGER" => SqlValue::Int(row.try_get(index)?),
        "REAL" => SqlValue::Float(row.try_get(index)?),
        "BLOB" => SqlValue::Bytes(row.try_get(index)?),
        _ => SqlValue::Text(row.try_get(index)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declares_autoincrement_ignores_names_and_comments() {
        assert!(declares_autoincrement(
            "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)"
        ));
        assert!(declares_autoincrement("CREATE TABLE t (id integer primary key autoincrement)"));
        assert!(!declares_autoincrement(
            "CREATE TABLE t (id BIGINT PRIMARY KEY, autoincrement_flag INTEGER)"
        ));
        assert!(!declares_autoincrement(
            "CREATE TABLE t (id BIGINT PRIMARY KEY, \"autoincrement\" TEXT)"
        ));
        assert!(!declares_autoincrement(
            "CREATE TABLE t (id BIGINT PRIMARY KEY -- was AUTOINCREMENT\n, note TEXT DEFAULT 'it''s AUTOINCREMENT')"
        ));
        assert!(!declares_autoincrement("CREATE TABLE t (id BIGINT /* AUTOINCREMENT */ PRIMARY KEY)"));
        assert!(!declares_autoincrement("CREATE TABLE t ([autoincrement] TEXT)"));
    }

    #[test]
    fn test_map_declared_type() {
        let c = map_declared_type("n".into(), "VARCHAR(120)");
        assert_eq!((c.data_type.as_str(), c.length), ("varchar", Some(120)));
        let c = map_declared_type("p".into(), "NUMERIC(10, 2)");
        assert_eq!((c.length, c.scale), (Some(10), Some(2)));
        assert_eq!(map_declared_type("i".into(), "INTEGER").data_type, "integer");
        assert_eq!(map_declared_type("t".into(), "TEXT").data_type, "text");
        assert_eq!(map_declared_type("x".into(), "").data_type, "blob");
        assert_eq!(map_declared_type("b".into(), "BOOLEAN").data_type, "boolean");
        assert_eq!(map_declared_type("u".into(), "UNSIGNED BIG INT").data_type, "bigint");
    }

    #[tokio::test]
    async fn test_inspects_autoincrement_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.db");
        let db = SqliteDatabase::connect(&ConnectionDescriptor::sqlite("src", path.to_string_lossy()))
            .await
            .unwrap();
        sqlx::raw_sql(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email VARCHAR(100) NOT NULL UNIQUE, \
             active BOOLEAN DEFAULT 1); \
             CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id) ON DELETE CASCADE, \
             title TEXT DEFAULT 'untitled'); \
             CREATE INDEX posts_title_idx ON posts (title);",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        assert_eq!(db.get_table_names().await.unwrap(), vec!["posts", "users"]);
        assert!(db.table_exists("users").await.unwrap());
        assert!(!db.table_exists("legacy").await.unwrap());

        let users = db.get_table_schema("users").await.unwrap();
        assert!(users.columns[0].auto_increment);
        assert!(!users.columns[0].nullable);
        assert_eq!(users.primary_key_columns(), &["id".to_string()]);
        assert_eq!(users.columns[2].default, Some(ColumnDefault::Boolean(true)));
        let unique = users.indexes.iter().find(|i| i.index_type == IndexType::Unique).unwrap();
        assert_eq!(unique.name, "users_email_unique");

        let posts = db.get_table_schema("posts").await.unwrap();
        assert_eq!(posts.foreign_keys.len(), 1);
        assert_eq!(posts.foreign_keys[0].name, "posts_user_id_foreign");
        assert_eq!(posts.foreign_keys[0].referenced_table, "users");
        assert!(posts.indexes.iter().any(|i| i.name == "posts_title_idx"));
        assert_eq!(posts.columns[2].default, Some(ColumnDefault::Text("untitled".into())));

        let schema = db.get_database_schema(None).await.unwrap();
        assert_eq!(schema.tables.len(), 2);
        assert!(!schema.metadata.version.is_empty());
    }
}
