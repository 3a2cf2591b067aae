//! PostgreSQL connection and schema inspector.
//!
//! Uses deadpool-postgres for connection pooling. Catalog columns of the
//! `information_schema` domain types are cast to plain `text`/`int4` so they
//! decode with the standard `FromSql` impls.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::Type;
use tokio_postgres::Config as PgConfig;
use tracing::{info, warn};

use crate::core::connection::ConnectionDescriptor;
use crate::core::schema::{
    ColumnDefault, ColumnSchema, DatabaseMetadata, IndexSchema, IndexType, LogicalType,
    TableSchema,
};
use crate::core::traits::SchemaInspector;
use crate::core::value::SqlValue;
use crate::drivers::common::catalog::catalog_length;
use crate::drivers::common::TlsBuilder;
use crate::error::{CloneError, Result};

/// Connection establishment timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A pooled PostgreSQL connection bound to one schema.
pub struct PostgresDatabase {
    pub(super) descriptor: ConnectionDescriptor,
    pub(super) pool: Pool,
    /// Schema searched for unqualified names (`extra_params.schema`, default `public`).
    pub(super) schema: String,
    /// Applied to each pooled session before it writes.
    pub(super) foreign_key_checks: AtomicBool,
}

impl PostgresDatabase {
    /// Build a pool, honoring `ssl_mode`, and verify it with a round trip.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let schema = descriptor.param("schema").unwrap_or("public").to_string();

        let mut pg_config = PgConfig::new();
        pg_config.host(&descriptor.host);
        pg_config.port(descriptor.port());
        pg_config.dbname(&descriptor.database);
        pg_config.user(&descriptor.username);
        pg_config.password(&descriptor.password);
        pg_config.options(format!("-c search_path={}", schema));
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let max_size = descriptor.max_connections() as usize;

        let pool = match TlsBuilder::from_descriptor(descriptor)?.build()? {
            None => {
                warn!(
                    connection = %descriptor.name,
                    "PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext."
                );
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr).max_size(max_size).build()
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr).max_size(max_size).build()
            }
        }
        .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;

        let client = pool
            .get()
            .await
            .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;

        info!(
            connection = %descriptor.name,
            "Connected to PostgreSQL: {}:{}/{} (schema {})",
            descriptor.host,
            descriptor.port(),
            descriptor.database,
            schema
        );

        Ok(Self {
            descriptor: descriptor.clone(),
            pool,
            schema,
            foreign_key_checks: AtomicBool::new(true),
        })
    }

    fn scope<'a>(&'a self, scope: Option<&'a str>) -> &'a str {
        scope.unwrap_or(&self.schema)
    }

    async fn load_columns(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                c.column_name::text,
                c.udt_name::text,
                c.is_nullable = 'YES' AS nullable,
                c.column_default::text,
                c.character_maximum_length::int4,
                c.numeric_precision::int4,
                c.numeric_scale::int4,
                c.is_identity = 'YES' AS is_identity,
                col_description(format('%I.%I', c.table_schema, c.table_name)::regclass::oid,
                                c.ordinal_position::int4) AS comment
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;

        for row in client.query(query, &[&scope, &table.name]).await? {
            let udt: String = row.get(1);
            let default: Option<String> = row.get(3);
            let serial = default
                .as_deref()
                .is_some_and(|d| d.to_lowercase().starts_with("nextval("));

            let mut col = map_udt(
                row.get(0),
                &udt,
                row.get::<_, Option<i32>>(4).map(i64::from),
                row.get::<_, Option<i32>>(5).map(i64::from),
                row.get::<_, Option<i32>>(6),
            );
            col.nullable = row.get(2);
            col.auto_increment = (serial || row.get::<_, bool>(7)) && LogicalType::is_integer(&col.data_type);
            col.default = if col.auto_increment {
                None
            } else {
                default.as_deref().and_then(ColumnDefault::parse)
            };
            col.comment = row.get(8);
            table.columns.push(col);
        }
        Ok(())
    }

    async fn load_indexes(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                i.relname::text AS index_name,
                ix.indisprimary,
                ix.indisunique,
                am.amname::text,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)) AS columns
            FROM pg_catalog.pg_index ix
            JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
            JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_am am ON am.oid = i.relam
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1 AND t.relname = $2
            GROUP BY i.relname, ix.indisprimary, ix.indisunique, am.amname
            ORDER BY ix.indisprimary DESC, i.relname
        "#;

        for row in client.query(query, &[&scope, &table.name]).await? {
            let method: String = row.get(3);
            let index_type = if row.get::<_, bool>(1) {
                IndexType::Primary
            } else if row.get::<_, bool>(2) {
                IndexType::Unique
            } else if method == "gin" {
                IndexType::Fulltext
            } else if method == "gist" {
                IndexType::Spatial
            } else {
                IndexType::Index
            };
            table
                .indexes
                .push(IndexSchema::new(row.get::<_, String>(0), row.get(4), index_type));
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                c.conname::text AS fk_name,
                array_agg(a.attname::text ORDER BY array_position(c.conkey, a.attnum)) AS columns,
                rt.relname::text AS ref_table,
                array_agg(ra.attname::text ORDER BY array_position(c.confkey, ra.attnum)) AS ref_columns,
                CASE c.confupdtype
                    WHEN 'r' THEN 'RESTRICT' WHEN 'c' THEN 'CASCADE' WHEN 'n' THEN 'SET_NULL'
                    ELSE 'NO_ACTION'
                END AS on_update,
                CASE c.confdeltype
                    WHEN 'r' THEN 'RESTRICT' WHEN 'c' THEN 'CASCADE' WHEN 'n' THEN 'SET_NULL'
                    ELSE 'NO_ACTION'
                END AS on_delete
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
            JOIN LATERAL unnest(c.conkey, c.confkey) AS k(attnum, refnum) ON true
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            JOIN pg_catalog.pg_attribute ra ON ra.attrelid = rt.oid AND ra.attnum = k.refnum
            WHERE n.nspname = $1 AND t.relname = $2 AND c.contype = 'f'
            GROUP BY c.conname, rt.relname, c.confupdtype, c.confdeltype
            ORDER BY c.conname
        "#;

        for row in client.query(query, &[&scope, &table.name]).await? {
            table.foreign_keys.push(crate::core::schema::ForeignKeySchema {
                name: row.get(0),
                columns: row.get(1),
                referenced_table: row.get(2),
                referenced_columns: row.get(3),
                on_update: crate::core::schema::ReferentialAction::parse(row.get(4)),
                on_delete: crate::core::schema::ReferentialAction::parse(row.get(5)),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaInspector for PostgresDatabase {
    async fn table_names_in(&self, scope: Option<&str>) -> Result<Vec<String>> {
        let scope = self.scope(scope);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
                &[&scope],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn table_schema_in(&self, scope: Option<&str>, table: &str) -> Result<TableSchema> {
        let scope = self.scope(scope);
        let mut schema = TableSchema::new(table);
        self.load_columns(scope, &mut schema).await?;
        if schema.columns.is_empty() {
            return Err(CloneError::query(
                format!("relation \"{}.{}\" does not exist", scope, table),
                Some("42P01".into()),
            ));
        }
        self.load_indexes(scope, &mut schema).await?;
        self.load_foreign_keys(scope, &mut schema).await?;
        Ok(schema)
    }

    async fn get_database_metadata(&self) -> Result<DatabaseMetadata> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT current_setting('server_version'), pg_encoding_to_char(encoding)::text, \
                 datcollate::text FROM pg_database WHERE datname = current_database()",
                &[],
            )
            .await?;
        Ok(DatabaseMetadata {
            version: row.get(0),
            charset: row.get(1),
            collation: row.get(2),
        })
    }
}

/// Map a PostgreSQL `udt_name` to the logical model.
fn map_udt(
    name: String,
    udt: &str,
    char_length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i32>,
) -> ColumnSchema {
    let length = catalog_length(char_length);
    let (logical, length, scale) = match udt {
        "int2" => (LogicalType::SMALLINT, None, None),
        "int4" => (LogicalType::INTEGER, None, None),
        "int8" => (LogicalType::BIGINT, None, None),
        "numeric" => {
            let precision = catalog_length(precision);
            (
                LogicalType::DECIMAL,
                precision,
                scale.and_then(|s| u32::try_from(s).ok()).filter(|_| precision.is_some()),
            )
        }
        "float4" => (LogicalType::FLOAT, None, None),
        "float8" => (LogicalType::DOUBLE, None, None),
        "bool" => (LogicalType::BOOLEAN, None, None),
        "bpchar" => (LogicalType::CHAR, length, None),
        "varchar" => (LogicalType::VARCHAR, length, None),
        "text" | "citext" => (LogicalType::TEXT, None, None),
        "bytea" => (LogicalType::BLOB, None, None),
        "date" => (LogicalType::DATE, None, None),
        "time" | "timetz" => (LogicalType::TIME, None, None),
        "timestamp" => (LogicalType::TIMESTAMP, None, None),
        "timestamptz" => (LogicalType::TIMESTAMPTZ, None, None),
        "json" | "jsonb" => (LogicalType::JSON, None, None),
        "uuid" => (LogicalType::UUID, None, None),
        _ => (LogicalType::TEXT, None, None),
    };
    let mut col = ColumnSchema::new(name, logical);
    col.length = length;
    col.scale = scale;
    col
}

/// Decode one column of a result row by its reported type.
pub(super) fn decode_value(row: &tokio_postgres::Row, index: usize) -> Result<SqlValue> {
    let ty = row.columns()[index].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(index)?.map(SqlValue::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(index)?.map(|v| SqlValue::Int(v.into())),
        Type::INT4 => row.try_get::<_, Option<i32>>(index)?.map(|v| SqlValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(index)?.map(SqlValue::Int),
        Type::OID => row.try_get::<_, Option<u32>>(index)?.map(|v| SqlValue::Int(v.into())),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(index)?.map(|v| SqlValue::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index)?.map(SqlValue::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(index)?
            .map(SqlValue::Decimal),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(index)?.map(SqlValue::Bytes),
        Type::UUID => row.try_get::<_, Option<uuid::Uuid>>(index)?.map(SqlValue::Uuid),
        Type::DATE => row.try_get::<_, Option<chrono::NaiveDate>>(index)?.map(SqlValue::Date),
        Type::TIME => row.try_get::<_, Option<chrono::NaiveTime>>(index)?.map(SqlValue::Time),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(index)?
            .map(SqlValue::DateTime),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(index)?
            .map(SqlValue::DateTimeTz),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)?
            .map(|v| SqlValue::Text(v.to_string())),
        _ => row.try_get::<_, Option<String>>(index)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
