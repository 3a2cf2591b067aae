//! MySQL/MariaDB connection and schema inspector.
//!
//! Uses SQLx for connection pooling. Catalog queries read
//! `information_schema` and CAST string columns to CHAR so MySQL 8's
//! binary-collated catalog columns decode as `String`.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Row, TypeInfo, ValueRef};
use tracing::info;

use crate::core::connection::ConnectionDescriptor;
use crate::core::schema::{
    ColumnDefault, ColumnSchema, DatabaseMetadata, IndexType, LogicalType, TableSchema,
};
use crate::core::traits::SchemaInspector;
use crate::core::value::SqlValue;
use crate::drivers::common::catalog::{
    catalog_length, group_foreign_keys, group_indexes, ForeignKeyColumnRow, IndexColumnRow,
};
use crate::error::{CloneError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A pooled MySQL or MariaDB connection.
pub struct MysqlDatabase {
    pub(super) descriptor: ConnectionDescriptor,
    pub(super) pool: MySqlPool,
    /// Applied to each pooled session before it writes.
    pub(super) foreign_key_checks: AtomicBool,
}

impl MysqlDatabase {
    /// Open a pool and verify it with a round trip.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let ssl_mode = descriptor
            .param("ssl_mode")
            .unwrap_or("preferred")
            .parse::<MySqlSslMode>()
            .map_err(|e| CloneError::Config(format!("{}: invalid ssl_mode: {}", descriptor.name, e)))?;

        let options = MySqlConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port())
            .database(&descriptor.database)
            .username(&descriptor.username)
            .password(&descriptor.password)
            .charset("utf8mb4")
            .ssl_mode(ssl_mode);

        let pool = MySqlPoolOptions::new()
            .max_connections(descriptor.max_connections())
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;

        info!(
            connection = %descriptor.name,
            "Connected to {}: {}:{}/{}",
            descriptor.driver_kind,
            descriptor.host,
            descriptor.port(),
            descriptor.database
        );

        Ok(Self {
            descriptor: descriptor.clone(),
            pool,
            foreign_key_checks: AtomicBool::new(true),
        })
    }

    async fn load_columns(&self, scope: Option<&str>, table: &mut TableSchema) -> Result<()> {
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(DATA_TYPE AS CHAR) AS data_type,
                CAST(COLUMN_TYPE AS CHAR) AS column_type,
                CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
                CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS char_length,
                CAST(NUMERIC_PRECISION AS SIGNED) AS num_precision,
                CAST(NUMERIC_SCALE AS SIGNED) AS num_scale,
                CAST(EXTRA AS CHAR) AS extra,
                CAST(COLUMN_COMMENT AS CHAR) AS column_comment
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(scope)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        for row in rows {
            let data_type: String = row.try_get("data_type")?;
            let column_type: String = row.try_get("column_type")?;
            let extra: String = row.try_get::<Option<String>, _>("extra")?.unwrap_or_default();

            let mut col = map_native_type(
                row.try_get("column_name")?,
                &data_type,
                &column_type,
                row.try_get("char_length")?,
                row.try_get("num_precision")?,
                row.try_get("num_scale")?,
            );
            col.nullable = row.try_get::<i64, _>("is_nullable")? == 1;
            col.auto_increment = extra.to_lowercase().contains("auto_increment");
            col.default = row
                .try_get::<Option<String>, _>("column_default")?
                .and_then(|raw| parse_default(&raw, &extra, &col.data_type));
            col.comment = row
                .try_get::<Option<String>, _>("column_comment")?
                .filter(|c| !c.is_empty());
            table.columns.push(col);
        }
        Ok(())
    }

    async fn load_indexes(&self, scope: Option<&str>, table: &mut TableSchema) -> Result<()> {
        let query = r#"
            SELECT
                CAST(INDEX_NAME AS CHAR) AS index_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(NON_UNIQUE AS SIGNED) AS non_unique,
                CAST(INDEX_TYPE AS CHAR) AS index_type
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(scope)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("index_name")?;
            let kind: String = row.try_get("index_type")?;
            let index_type = if name == "PRIMARY" {
                IndexType::Primary
            } else if kind.eq_ignore_ascii_case("FULLTEXT") {
                IndexType::Fulltext
            } else if kind.eq_ignore_ascii_case("SPATIAL") {
                IndexType::Spatial
            } else if row.try_get::<i64, _>("non_unique")? == 0 {
                IndexType::Unique
            } else {
                IndexType::Index
            };
            entries.push(IndexColumnRow {
                index_name: name,
                column_name: row.try_get("column_name")?,
                index_type,
            });
        }
        table.indexes = group_indexes(entries);
        Ok(())
    }

    async fn load_foreign_keys(&self, scope: Option<&str>, table: &mut TableSchema) -> Result<()> {
        let query = r#"
            SELECT
                CAST(k.CONSTRAINT_NAME AS CHAR) AS constraint_name,
                CAST(k.COLUMN_NAME AS CHAR) AS column_name,
                CAST(k.REFERENCED_TABLE_NAME AS CHAR) AS referenced_table,
                CAST(k.REFERENCED_COLUMN_NAME AS CHAR) AS referenced_column,
                CAST(r.UPDATE_RULE AS CHAR) AS update_rule,
                CAST(r.DELETE_RULE AS CHAR) AS delete_rule
            FROM information_schema.KEY_COLUMN_USAGE k
            JOIN information_schema.REFERENTIAL_CONSTRAINTS r
              ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
             AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
             AND r.TABLE_NAME = k.TABLE_NAME
            WHERE k.TABLE_SCHEMA = COALESCE(?, DATABASE())
              AND k.TABLE_NAME = ?
              AND k.REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(scope)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(ForeignKeyColumnRow {
                constraint_name: row.try_get("constraint_name")?,
                column_name: row.try_get("column_name")?,
                referenced_table: row.try_get("referenced_table")?,
                referenced_column: row.try_get("referenced_column")?,
                on_update: row.try_get("update_rule")?,
                on_delete: row.try_get("delete_rule")?,
            });
        }
        table.foreign_keys = group_foreign_keys(entries);
        Ok(())
    }

    async fn load_table_options(&self, scope: Option<&str>, table: &mut TableSchema) -> Result<()> {
        let row: Option<MySqlRow> = sqlx::query(
            r#"
            SELECT CAST(ENGINE AS CHAR) AS engine, CAST(TABLE_COLLATION AS CHAR) AS collation
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            "#,
        )
        .bind(scope)
        .bind(&table.name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            if let Some(engine) = row.try_get::<Option<String>, _>("engine")? {
                table.metadata.insert("engine".into(), engine);
            }
            if let Some(collation) = row.try_get::<Option<String>, _>("collation")? {
                if let Some((charset, _)) = collation.split_once('_') {
                    table.metadata.insert("charset".into(), charset.to_string());
                }
                table.metadata.insert("collation".into(), collation);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaInspector for MysqlDatabase {
    async fn table_names_in(&self, scope: Option<&str>) -> Result<Vec<String>> {
        let rows: Vec<MySqlRow> = sqlx::query(
            r#"
            SELECT CAST(TABLE_NAME AS CHAR) AS table_name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#,
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get("table_name").map_err(CloneError::from))
            .collect()
    }

    async fn table_schema_in(&self, scope: Option<&str>, table: &str) -> Result<TableSchema> {
        let mut schema = TableSchema::new(table);
        self.load_columns(scope, &mut schema).await?;
        if schema.columns.is_empty() {
            return Err(CloneError::query(
                format!("Table '{}' doesn't exist", table),
                Some("42S02".into()),
            ));
        }
        self.load_indexes(scope, &mut schema).await?;
        self.load_foreign_keys(scope, &mut schema).await?;
        self.load_table_options(scope, &mut schema).await?;
        Ok(schema)
    }

    async fn get_database_metadata(&self) -> Result<DatabaseMetadata> {
        let row: MySqlRow = sqlx::query(
            "SELECT CAST(VERSION() AS CHAR) AS version, \
             CAST(@@character_set_database AS CHAR) AS charset, \
             CAST(@@collation_database AS CHAR) AS collation",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseMetadata {
            version: row.try_get("version")?,
            charset: row.try_get("charset")?,
            collation: row.try_get("collation")?,
        })
    }
}

/// Map an `information_schema` column description to the logical model.
fn map_native_type(
    name: String,
    data_type: &str,
    column_type: &str,
    char_length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i64>,
) -> ColumnSchema {
    let data_type = data_type.to_lowercase();
    let column_type = column_type.to_lowercase();
    let length = catalog_length(char_length);

    let (logical, length, scale) = match data_type.as_str() {
        "tinyint" if column_type.starts_with("tinyint(1)") => (LogicalType::BOOLEAN, None, None),
        "bit" if column_type == "bit(1)" => (LogicalType::BOOLEAN, None, None),
        "tinyint" => (LogicalType::TINYINT, None, None),
        "smallint" | "year" => (LogicalType::SMALLINT, None, None),
        "mediumint" => (LogicalType::MEDIUMINT, None, None),
        "int" | "integer" => (LogicalType::INTEGER, None, None),
        "bigint" => (LogicalType::BIGINT, None, None),
        "decimal" | "numeric" => (
            LogicalType::DECIMAL,
            catalog_length(precision),
            scale.and_then(|s| u32::try_from(s).ok()),
        ),
        "float" => (LogicalType::FLOAT, None, None),
        "double" | "real" => (LogicalType::DOUBLE, None, None),
        "char" => (LogicalType::CHAR, length, None),
        "varchar" | "enum" | "set" => (LogicalType::VARCHAR, length, None),
        "tinytext" | "text" => (LogicalType::TEXT, None, None),
        "mediumtext" => (LogicalType::MEDIUMTEXT, None, None),
        "longtext" => (LogicalType::LONGTEXT, None, None),
        "binary" => (LogicalType::BINARY, length, None),
        "varbinary" | "bit" => (LogicalType::VARBINARY, length, None),
        "tinyblob" | "blob" => (LogicalType::BLOB, None, None),
        "mediumblob" | "longblob" => (LogicalType::LONGBLOB, None, None),
        "date" => (LogicalType::DATE, None, None),
        "time" => (LogicalType::TIME, None, None),
        "datetime" => (LogicalType::DATETIME, None, None),
        "timestamp" => (LogicalType::TIMESTAMP, None, None),
        "json" => (LogicalType::JSON, None, None),
        _ => (LogicalType::TEXT, None, None),
    };

    let mut col = ColumnSchema::new(name, logical);
    col.length = length;
    col.scale = scale;
    col.unsigned = column_type.contains("unsigned");
    col
}

/// Normalize a MySQL or MariaDB `COLUMN_DEFAULT`.
///
/// MySQL reports literals unquoted; MariaDB 10.2.7+ quotes them and reports
/// an explicit `NULL` default as the string `NULL`.
fn parse_default(raw: &str, extra: &str, logical: &str) -> Option<ColumnDefault> {
    let generated = extra.to_uppercase().contains("DEFAULT_GENERATED");
    let lower = raw.to_lowercase();
    if generated && !(lower.starts_with("current_timestamp") || lower.starts_with("now(")) {
        return None;
    }
    let default = ColumnDefault::from_unquoted(raw, generated);
    Some(match (logical, default) {
        (LogicalType::BOOLEAN, ColumnDefault::Number(n)) => ColumnDefault::Boolean(n != "0"),
        (_, d) => d,
    })
}

/// Decode one column of a result row by its reported wire type.
pub(super) fn decode_value(row: &MySqlRow, index: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_uppercase();

    let value = match type_name.as_str() {
        "BOOLEAN" => SqlValue::Bool(row.try_get::<bool, _>(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            SqlValue::Int(row.try_get::<i64, _>(index)?)
        }
        t if t.ends_with("UNSIGNED") => {
            let v: u64 = row.try_get(index)?;
            match i64::try_from(v) {
                Ok(i) => SqlValue::Int(i),
                Err(_) => SqlValue::Decimal(rust_decimal::Decimal::from(v)),
            }
        }
        "FLOAT" => SqlValue::Float(f64::from(row.try_get::<f32, _>(index)?)),
        "DOUBLE" => SqlValue::Float(row.try_get::<f64, _>(index)?),
        "DECIMAL" => SqlValue::Decimal(row.try_get(index)?),
        "DATE" => SqlValue::Date(row.try_get(index)?),
        "TIME" => match row.try_get::<chrono::NaiveTime, _>(index) {
            Ok(t) => SqlValue::Time(t),
            // Durations outside 00:00..24:00 have no NaiveTime.
            Err(_) => SqlValue::Text(row.try_get::<String, _>(index)?),
        },
        "DATETIME" | "TIMESTAMP" => SqlValue::DateTime(row.try_get(index)?),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(index)?),
        _ => match row.try_get::<String, _>(index) {
            Ok(s) => SqlValue::Text(s),
            Err(_) => SqlValue::Text(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(index)?).into_owned()),
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(data_type: &str, column_type: &str, len: Option<i64>) -> ColumnSchema {
        map_native_type("c".into(), data_type, column_type, len, None, None)
    }

    #[test]
    fn test_tinyint_one_is_boolean() {
        assert_eq!(map("tinyint", "tinyint(1)", None).data_type, "boolean");
        assert_eq!(map("tinyint", "tinyint(4)", None).data_type, "tinyint");
    }

    #[test]
    fn test_lengths_only_for_sized_types() {
        let c = map("varchar", "varchar(191)", Some(191));
        assert_eq!((c.data_type.as_str(), c.length), ("varchar", Some(191)));
        let c = map("longtext", "longtext", Some(4_294_967_295));
        assert_eq!((c.data_type.as_str(), c.length), ("longtext", None));
    }

    #[test]
    fn test_unsigned_and_decimal() {
        let c = map_native_type("p".into(), "decimal", "decimal(10,2) unsigned", None, Some(10), Some(2));
        assert_eq!((c.length, c.scale, c.unsigned), (Some(10), Some(2), true));
    }

    #[test]
    fn test_parse_default_variants() {
        assert_eq!(
            parse_default("CURRENT_TIMESTAMP", "DEFAULT_GENERATED", "timestamp"),
            Some(ColumnDefault::CurrentTimestamp)
        );
        assert_eq!(parse_default("(uuid())", "DEFAULT_GENERATED", "char"), None);
        assert_eq!(
            parse_default("'pending'", "", "varchar"),
            Some(ColumnDefault::Text("pending".into()))
        );
        assert_eq!(
            parse_default("pending", "", "varchar"),
            Some(ColumnDefault::Text("pending".into()))
        );
        assert_eq!(parse_default("1", "", "boolean"), Some(ColumnDefault::Boolean(true)));
        assert_eq!(parse_default("NULL", "", "varchar"), Some(ColumnDefault::Null));
    }
}
