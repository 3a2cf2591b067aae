//! SQL Server connection and schema inspector.
//!
//! Uses Tiberius with bb8 connection pooling. Catalog reads go through the
//! `sys.*` views so identity, default and description metadata come back in
//! one pass per table.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::core::connection::ConnectionDescriptor;
use crate::core::schema::{
    ColumnDefault, ColumnSchema, DatabaseMetadata, ForeignKeySchema, IndexSchema, IndexType,
    LogicalType, ReferentialAction, TableSchema,
};
use crate::core::traits::SchemaInspector;
use crate::core::value::{Row as ValueRow, SqlValue};
use crate::error::{CloneError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection acquisition timeout from pool.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection timeout.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub(super) type TdsClient = Client<Compat<TcpStream>>;

/// bb8 connection manager building Tiberius clients from a descriptor.
#[derive(Clone)]
pub(super) struct TiberiusConnectionManager {
    descriptor: ConnectionDescriptor,
}

impl TiberiusConnectionManager {
    fn build_config(&self) -> Config {
        let d = &self.descriptor;
        let mut config = Config::new();
        config.host(&d.host);
        config.port(d.port());
        config.database(&d.database);
        config.authentication(AuthMethod::sql_server(&d.username, &d.password));

        if flag(d.param("encrypt")) {
            if flag(d.param("trust_server_cert")) {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

fn flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("true" | "1" | "yes")
    )
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// A pooled SQL Server connection bound to one schema.
pub struct MssqlDatabase {
    pub(super) descriptor: ConnectionDescriptor,
    /// `None` once [`Database::close`](crate::core::traits::Database::close) ran.
    pub(super) pool: Mutex<Option<Pool<TiberiusConnectionManager>>>,
    /// Schema searched for tables (`extra_params.schema`, default `dbo`).
    pub(super) schema: String,
    pub(super) foreign_key_checks: AtomicBool,
}

impl MssqlDatabase {
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let manager = TiberiusConnectionManager {
            descriptor: descriptor.clone(),
        };
        let max_size = descriptor.max_connections();
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| CloneError::connection(&descriptor.name, e.to_string()))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            connection = %descriptor.name,
            "Connected to SQL Server: {}:{}/{} (pool_size={})",
            descriptor.host,
            descriptor.port(),
            descriptor.database,
            max_size
        );

        Ok(Self::with_pool(descriptor, pool))
    }

    pub(super) fn with_pool(descriptor: &ConnectionDescriptor, pool: Pool<TiberiusConnectionManager>) -> Self {
        Self {
            descriptor: descriptor.clone(),
            pool: Mutex::new(Some(pool)),
            schema: descriptor.param("schema").unwrap_or("dbo").to_string(),
            foreign_key_checks: AtomicBool::new(true),
        }
    }

    pub(super) async fn client(&self) -> Result<PooledConnection<'static, TiberiusConnectionManager>> {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| CloneError::connection(&self.descriptor.name, "connection pool is closed"))?;
        Ok(pool.get_owned().await?)
    }

    /// Drop the pool handle. Idle connections close with it; checked-out
    /// connections close when returned.
    pub(super) fn release_pool(&self) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    fn scope<'a>(&'a self, scope: Option<&'a str>) -> &'a str {
        scope.unwrap_or(&self.schema)
    }

    async fn catalog_rows(&self, sql: &str, scope: &str, table: Option<&str>) -> Result<Vec<Row>> {
        let mut conn = self.client().await?;
        let mut query = Query::new(sql);
        query.bind(scope);
        if let Some(table) = table {
            query.bind(table);
        }
        let rows = query.query(&mut *conn).await?.into_first_result().await?;
        Ok(rows)
    }

    async fn load_columns(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let sql = r#"
            SELECT
                c.name,
                ty.name,
                CAST(c.max_length AS INT),
                CAST(c.precision AS INT),
                CAST(c.scale AS INT),
                c.is_nullable,
                c.is_identity,
                dc.definition,
                CAST(ep.value AS NVARCHAR(4000))
            FROM sys.columns c
            JOIN sys.tables t ON t.object_id = c.object_id
            JOIN sys.schemas s ON s.schema_id = t.schema_id
            JOIN sys.types ty ON ty.user_type_id = c.user_type_id
            LEFT JOIN sys.default_constraints dc ON dc.object_id = c.default_object_id
            LEFT JOIN sys.extended_properties ep
                ON ep.class = 1 AND ep.major_id = c.object_id
                AND ep.minor_id = c.column_id AND ep.name = 'MS_Description'
            WHERE s.name = @P1 AND t.name = @P2
            ORDER BY c.column_id
        "#;

        for row in self.catalog_rows(sql, scope, Some(&table.name)).await? {
            let mut col = map_native_type(
                text(&row, 0)?,
                &text(&row, 1)?,
                row.try_get::<i32, _>(2)?.unwrap_or(0),
                row.try_get::<i32, _>(3)?.unwrap_or(0),
                row.try_get::<i32, _>(4)?.unwrap_or(0),
            );
            col.nullable = row.try_get::<bool, _>(5)?.unwrap_or(true);
            col.auto_increment = row.try_get::<bool, _>(6)?.unwrap_or(false);
            if col.auto_increment {
                col.nullable = false;
            } else {
                col.default = row
                    .try_get::<&str, _>(7)?
                    .and_then(ColumnDefault::parse)
                    .map(|d| bit_default(&col, d));
            }
            col.comment = row.try_get::<&str, _>(8)?.map(String::from);
            table.columns.push(col);
        }

        debug!(table = %table.name, columns = table.columns.len(), "SQL Server: loaded columns");
        Ok(())
    }

    async fn load_indexes(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let sql = r#"
            SELECT
                i.name,
                i.is_primary_key,
                i.is_unique,
                CAST(i.type AS INT),
                STUFF((
                    SELECT ',' + c2.name
                    FROM sys.index_columns ic2
                    JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
                    WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 0
                    ORDER BY ic2.key_ordinal
                    FOR XML PATH('')
                ), 1, 1, '')
            FROM sys.indexes i
            JOIN sys.tables tb ON i.object_id = tb.object_id
            JOIN sys.schemas s ON tb.schema_id = s.schema_id
            WHERE s.name = @P1 AND tb.name = @P2 AND i.type > 0 AND i.is_hypothetical = 0
            ORDER BY i.is_primary_key DESC, i.name
        "#;

        for row in self.catalog_rows(sql, scope, Some(&table.name)).await? {
            let index_type = if row.try_get::<bool, _>(1)?.unwrap_or(false) {
                IndexType::Primary
            } else if row.try_get::<bool, _>(2)?.unwrap_or(false) {
                IndexType::Unique
            } else if row.try_get::<i32, _>(3)? == Some(4) {
                IndexType::Spatial
            } else {
                IndexType::Index
            };
            table.indexes.push(IndexSchema::new(
                text(&row, 0)?,
                split_list(row.try_get::<&str, _>(4)?),
                index_type,
            ));
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, scope: &str, table: &mut TableSchema) -> Result<()> {
        let sql = r#"
            SELECT
                fk.name,
                STUFF((
                    SELECT ',' + pc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns pc2 ON fkc2.parent_object_id = pc2.object_id AND fkc2.parent_column_id = pc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, ''),
                rt.name,
                STUFF((
                    SELECT ',' + rc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns rc2 ON fkc2.referenced_object_id = rc2.object_id AND fkc2.referenced_column_id = rc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, ''),
                fk.update_referential_action_desc,
                fk.delete_referential_action_desc
            FROM sys.foreign_keys fk
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            WHERE ps.name = @P1 AND pt.name = @P2
            ORDER BY fk.name
        "#;

        for row in self.catalog_rows(sql, scope, Some(&table.name)).await? {
            table.foreign_keys.push(ForeignKeySchema {
                name: text(&row, 0)?,
                columns: split_list(row.try_get::<&str, _>(1)?),
                referenced_table: text(&row, 2)?,
                referenced_columns: split_list(row.try_get::<&str, _>(3)?),
                on_update: ReferentialAction::parse(&text(&row, 4)?),
                on_delete: ReferentialAction::parse(&text(&row, 5)?),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaInspector for MssqlDatabase {
    async fn table_names_in(&self, scope: Option<&str>) -> Result<Vec<String>> {
        let sql = "SELECT t.name FROM sys.tables t \
                   JOIN sys.schemas s ON s.schema_id = t.schema_id \
                   WHERE s.name = @P1 AND t.is_ms_shipped = 0 ORDER BY t.name";
        self.catalog_rows(sql, self.scope(scope), None)
            .await?
            .iter()
            .map(|row| text(row, 0))
            .collect()
    }

    async fn table_schema_in(&self, scope: Option<&str>, table: &str) -> Result<TableSchema> {
        let scope = self.scope(scope);
        let mut schema = TableSchema::new(table);
        self.load_columns(scope, &mut schema).await?;
        if schema.columns.is_empty() {
            return Err(CloneError::query(
                format!("Invalid object name '{}.{}'", scope, table),
                Some("208".into()),
            ));
        }
        self.load_indexes(scope, &mut schema).await?;
        self.load_foreign_keys(scope, &mut schema).await?;
        Ok(schema)
    }

    async fn get_database_metadata(&self) -> Result<DatabaseMetadata> {
        let mut conn = self.client().await?;
        let row = conn
            .simple_query(
                "SELECT CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128)), \
                 CAST(DATABASEPROPERTYEX(DB_NAME(), 'Collation') AS NVARCHAR(128))",
            )
            .await?
            .into_row()
            .await?
            .ok_or_else(|| CloneError::query("SQL Server returned no metadata row", None))?;
        Ok(DatabaseMetadata {
            version: text(&row, 0)?,
            charset: None,
            collation: row.try_get::<&str, _>(1)?.map(String::from),
        })
    }
}

fn text(row: &Row, index: usize) -> Result<String> {
    Ok(row.try_get::<&str, _>(index)?.unwrap_or_default().to_string())
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// SQL Server reports bit defaults as `((1))`.
fn bit_default(col: &ColumnSchema, default: ColumnDefault) -> ColumnDefault {
    match (&default, col.data_type.as_str()) {
        (ColumnDefault::Number(n), LogicalType::BOOLEAN) => ColumnDefault::Boolean(n != "0"),
        _ => default,
    }
}

/// Map a `sys.types` name to the logical model. `max_length` is in bytes and
/// `-1` for `(MAX)`.
fn map_native_type(name: String, native: &str, max_length: i32, precision: i32, scale: i32) -> ColumnSchema {
    let bytes = u32::try_from(max_length).ok().filter(|l| *l > 0);
    let chars = match native {
        "nchar" | "nvarchar" => bytes.map(|b| b / 2),
        _ => bytes,
    };
    let col = |ty: &str| ColumnSchema::new(name.clone(), ty);

    match native {
        "bit" => col(LogicalType::BOOLEAN),
        "tinyint" => col(LogicalType::TINYINT),
        "smallint" => col(LogicalType::SMALLINT),
        "int" => col(LogicalType::INTEGER),
        "bigint" => col(LogicalType::BIGINT),
        "decimal" | "numeric" => col(LogicalType::DECIMAL)
            .with_precision(precision.max(1) as u32, scale.max(0) as u32),
        "money" => col(LogicalType::DECIMAL).with_precision(19, 4),
        "smallmoney" => col(LogicalType::DECIMAL).with_precision(10, 4),
        "real" => col(LogicalType::FLOAT),
        "float" => col(LogicalType::DOUBLE),
        "char" | "nchar" => sized(col(LogicalType::CHAR), chars),
        "varchar" | "nvarchar" => match chars {
            Some(len) => col(LogicalType::VARCHAR).with_length(len),
            None => col(LogicalType::TEXT),
        },
        "text" | "ntext" | "xml" | "sysname" => col(LogicalType::TEXT),
        "binary" => sized(col(LogicalType::BINARY), bytes),
        "varbinary" => match bytes {
            Some(len) => col(LogicalType::VARBINARY).with_length(len),
            None => col(LogicalType::LONGBLOB),
        },
        "image" => col(LogicalType::LONGBLOB),
        "date" => col(LogicalType::DATE),
        "time" => col(LogicalType::TIME),
        "datetime" | "datetime2" | "smalldatetime" => col(LogicalType::DATETIME),
        "datetimeoffset" => col(LogicalType::TIMESTAMPTZ),
        "uniqueidentifier" => col(LogicalType::UUID),
        _ => col(LogicalType::TEXT),
    }
}

fn sized(col: ColumnSchema, length: Option<u32>) -> ColumnSchema {
    match length {
        Some(len) => col.with_length(len),
        None => col,
    }
}

/// Decode every cell of a result row.
pub(super) fn decode_row(row: &Row) -> Result<ValueRow> {
    row.cells().map(|(_, data)| decode_cell(data)).collect()
}

fn decode_cell(data: &ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::Int(v.into())),
        ColumnData::I16(v) => v.map(|v| SqlValue::Int(v.into())),
        ColumnData::I32(v) => v.map(|v| SqlValue::Int(v.into())),
        ColumnData::I64(v) => v.map(SqlValue::Int),
        ColumnData::F32(v) => v.map(|v| SqlValue::Float(v.into())),
        ColumnData::F64(v) => v.map(SqlValue::Float),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| SqlValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Binary(v) => v.as_ref().map(|b| SqlValue::Bytes(b.to_vec())),
        ColumnData::Numeric(_) => rust_decimal::Decimal::from_sql(data)?.map(SqlValue::Decimal),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| SqlValue::Text(x.clone().into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(SqlValue::DateTime)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(SqlValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(SqlValue::Time),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(data)?.map(SqlValue::DateTimeTz)
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[tokio::test]
    async fn test_close_releases_the_pool() {
        use crate::core::connection::DriverKind;
        use crate::core::traits::Database;

        let mut descriptor = ConnectionDescriptor::sqlite("warehouse", "unused");
        descriptor.driver_kind = DriverKind::Sqlserver;
        let manager = TiberiusConnectionManager {
            descriptor: descriptor.clone(),
        };
        let db = MssqlDatabase::with_pool(&descriptor, Pool::builder().max_size(1).build_unchecked(manager));

        db.close().await;
        match db.client().await {
            Err(CloneError::Connection { message, .. }) => assert!(message.contains("closed")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("closed pool handed out a connection"),
        }
        assert!(!db.release_pool());
    }

    #[test]
    fn test_map_native_type() {
        let c = map_native_type("n".into(), "nvarchar", 100, 0, 0);
        assert_eq!((c.data_type.as_str(), c.length), ("varchar", Some(50)));
        assert_eq!(map_native_type("n".into(), "nvarchar", -1, 0, 0).data_type, "text");
        assert_eq!(map_native_type("b".into(), "varbinary", -1, 0, 0).data_type, "longblob");
        let c = map_native_type("p".into(), "decimal", 9, 12, 2);
        assert_eq!((c.length, c.scale), (Some(12), Some(2)));
        let c = map_native_type("m".into(), "money", 8, 19, 4);
        assert_eq!((c.length, c.scale), (Some(19), Some(4)));
        assert_eq!(map_native_type("f".into(), "float", 8, 53, 0).data_type, "double");
        assert_eq!(map_native_type("g".into(), "geography", -1, 0, 0).data_type, "text");
    }

    #[test]
    fn test_bit_default() {
        let col = ColumnSchema::new("active", LogicalType::BOOLEAN);
        let parsed = ColumnDefault::parse("((1))").map(|d| bit_default(&col, d));
        assert_eq!(parsed, Some(ColumnDefault::Boolean(true)));
        let col = ColumnSchema::new("qty", LogicalType::INTEGER);
        let parsed = ColumnDefault::parse("((0))").map(|d| bit_default(&col, d));
        assert_eq!(parsed, Some(ColumnDefault::Number("0".into())));
    }

    #[test]
    fn test_flag_and_split() {
        assert!(flag(Some("TRUE")));
        assert!(!flag(Some("off")));
        assert!(!flag(None));
        assert_eq!(split_list(Some("a,b")), vec!["a", "b"]);
        assert!(split_list(None).is_empty());
    }

    #[test]
    fn test_decode_cell() {
        assert_eq!(decode_cell(&ColumnData::I32(Some(7))).ok(), Some(SqlValue::Int(7)));
        assert_eq!(decode_cell(&ColumnData::I64(None)).ok(), Some(SqlValue::Null));
        assert_eq!(
            decode_cell(&ColumnData::String(Some(Cow::Borrowed("x")))).ok(),
            Some(SqlValue::Text("x".into()))
        );
        assert_eq!(decode_cell(&ColumnData::Bit(Some(true))).ok(), Some(SqlValue::Bool(true)));
    }
}
