//! PostgreSQL statement execution and row loading.
//!
//! Foreign key enforcement is switched per session through
//! `session_replication_role`, which skips the internal FK triggers while set
//! to `replica`. Parameters are converted to the types the server reports for
//! the prepared INSERT, so text read from another dialect lands in date,
//! numeric or JSON columns without casts in the SQL.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use deadpool_postgres::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{ToSql, Type};
use tracing::debug;

use super::dialect::PostgresDialect;
use super::reader::{decode_value, PostgresDatabase};
use crate::core::connection::ConnectionDescriptor;
use crate::core::identifier::quote_literal;
use crate::core::schema::TableSchema;
use crate::core::traits::{Database, DialectSql, PageQuery, QueryBuilder, SchemaBuilder};
use crate::core::value::{Row as ValueRow, SqlValue};
use crate::error::{CloneError, Result};

type PgParam = Box<dyn ToSql + Sync + Send>;

impl PostgresDatabase {
    async fn session(&self, checks: bool) -> Result<Client> {
        let client = self.pool.get().await?;
        client
            .batch_execute(if checks {
                "SET session_replication_role = DEFAULT"
            } else {
                "SET session_replication_role = replica"
            })
            .await?;
        Ok(client)
    }

    fn checks_enabled(&self) -> bool {
        self.foreign_key_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let client = self.session(self.checks_enabled()).await?;
        let trimmed = sql.trim().trim_end_matches(';');
        if trimmed.contains(';') {
            client.batch_execute(sql).await?;
            Ok(0)
        } else {
            Ok(client.execute(trimmed, &[]).await?)
        }
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client.query_one(&PostgresDialect.build_count(table), &[]).await?;
        Ok(row.try_get::<_, i64>(0)?.max(0) as u64)
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<ValueRow>> {
        let client = self.pool.get().await?;
        let rows = client.query(&PostgresDialect.build_select_page(query), &[]).await?;
        rows.iter()
            .map(|row| {
                (0..query.columns.len())
                    .map(|i| decode_value(row, i))
                    .collect::<Result<ValueRow>>()
            })
            .collect()
    }

    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[ValueRow]) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let mut client = self.session(self.checks_enabled()).await?;
        let tx = client.transaction().await?;
        let per_statement = PostgresDialect.rows_per_insert(columns.len());
        for chunk in rows.chunks(per_statement) {
            let sql = PostgresDialect.build_insert(table, columns, chunk.len());
            let stmt = tx.prepare_cached(&sql).await?;
            let params = chunk
                .iter()
                .flatten()
                .zip(stmt.params())
                .map(|(value, ty)| to_param(value, ty))
                .collect::<Result<Vec<PgParam>>>()?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(&stmt, &refs).await?;
        }
        tx.commit().await?;

        debug!(table, rows = rows.len(), "PostgreSQL: inserted rows");
        Ok(rows.len() as u64)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&PostgresDialect.build_drop_table(table))
            .await?;
        Ok(())
    }

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        self.foreign_key_checks.store(enabled, Ordering::SeqCst);
        debug!(connection = %self.descriptor.name, enabled, "PostgreSQL: foreign key checks");
        Ok(())
    }

    /// Move serial sequences past the highest loaded key.
    async fn after_load(&self, table: &TableSchema) -> Result<()> {
        let client = self.pool.get().await?;
        let qualified = format!(
            "{}.{}",
            PostgresDialect.quote(&self.schema),
            PostgresDialect.quote(&table.name)
        );
        for column in table.columns.iter().filter(|c| c.auto_increment) {
            let col = PostgresDialect.quote(&column.name);
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE(MAX({}), 1), MAX({}) IS NOT NULL) FROM {}",
                quote_literal(&qualified),
                quote_literal(&column.name),
                col,
                col,
                qualified
            );
            client.query(&sql, &[]).await?;
            debug!(table = %table.name, column = %column.name, "PostgreSQL: sequence reset");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Convert a value to the parameter type the server expects.
fn to_param(value: &SqlValue, ty: &Type) -> Result<PgParam> {
    if value.is_null() {
        return Ok(typed_null(ty));
    }
    let mismatch = || {
        CloneError::query(
            format!("cannot convert {} to PostgreSQL type {}", value, ty.name()),
            Some("22P02".into()),
        )
    };

    let param: PgParam = match *ty {
        Type::BOOL => Box::new(match value {
            SqlValue::Bool(b) => *b,
            SqlValue::Int(i) => *i != 0,
            SqlValue::Decimal(d) => !d.is_zero(),
            SqlValue::Text(s) => parse_bool(s).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }),
        Type::INT2 => Box::new(i16::try_from(as_i64(value).ok_or_else(mismatch)?).map_err(|_| mismatch())?),
        Type::INT4 => Box::new(i32::try_from(as_i64(value).ok_or_else(mismatch)?).map_err(|_| mismatch())?),
        Type::INT8 => Box::new(as_i64(value).ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(as_f64(value).ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(as_f64(value).ok_or_else(mismatch)?),
        Type::NUMERIC => Box::new(match value {
            SqlValue::Decimal(d) => *d,
            SqlValue::Int(i) => Decimal::from(*i),
            SqlValue::Bool(b) => Decimal::from(*b as i64),
            SqlValue::Float(f) => Decimal::try_from(*f).map_err(|_| mismatch())?,
            SqlValue::Text(s) => s.trim().parse::<Decimal>().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        }),
        Type::BYTEA => Box::new(match value {
            SqlValue::Bytes(b) => b.clone(),
            other => other.to_text().unwrap_or_default().into_bytes(),
        }),
        Type::UUID => Box::new(match value {
            SqlValue::Uuid(u) => *u,
            SqlValue::Text(s) => uuid::Uuid::parse_str(s.trim()).map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        }),
        Type::DATE => Box::new(match value {
            SqlValue::Date(d) => *d,
            SqlValue::DateTime(dt) => dt.date(),
            SqlValue::DateTimeTz(dt) => dt.date_naive(),
            SqlValue::Text(s) => parse_date(s).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }),
        Type::TIME => Box::new(match value {
            SqlValue::Time(t) => *t,
            SqlValue::DateTime(dt) => dt.time(),
            SqlValue::Text(s) => parse_time(s).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }),
        Type::TIMESTAMP => Box::new(match value {
            SqlValue::DateTime(dt) => *dt,
            SqlValue::DateTimeTz(dt) => dt.naive_utc(),
            SqlValue::Date(d) => d.and_time(NaiveTime::MIN),
            SqlValue::Text(s) => parse_datetime(s).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }),
        Type::TIMESTAMPTZ => Box::new(match value {
            SqlValue::DateTimeTz(dt) => *dt,
            SqlValue::DateTime(dt) => Utc.from_utc_datetime(dt).fixed_offset(),
            SqlValue::Date(d) => Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)).fixed_offset(),
            SqlValue::Text(s) => DateTime::<FixedOffset>::parse_from_rfc3339(s.trim())
                .ok()
                .or_else(|| parse_datetime(s).map(|dt| Utc.from_utc_datetime(&dt).fixed_offset()))
                .ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }),
        Type::JSON | Type::JSONB => Box::new(match value {
            SqlValue::Text(s) => serde_json::from_str::<serde_json::Value>(s)
                .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            SqlValue::Bool(b) => serde_json::Value::Bool(*b),
            SqlValue::Int(i) => serde_json::Value::from(*i),
            SqlValue::Float(f) => serde_json::Value::from(*f),
            other => serde_json::Value::String(other.to_text().unwrap_or_default()),
        }),
        _ => Box::new(value.to_text().unwrap_or_default()),
    };
    Ok(param)
}

fn typed_null(ty: &Type) -> PgParam {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::NUMERIC => Box::new(None::<Decimal>),
        Type::BYTEA => Box::new(None::<Vec<u8>>),
        Type::UUID => Box::new(None::<uuid::Uuid>),
        Type::DATE => Box::new(None::<NaiveDate>),
        Type::TIME => Box::new(None::<NaiveTime>),
        Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
        Type::TIMESTAMPTZ => Box::new(None::<DateTime<FixedOffset>>),
        Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
        _ => Box::new(None::<String>),
    }
}

fn as_i64(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Int(i) => Some(*i),
        SqlValue::Bool(b) => Some(*b as i64),
        SqlValue::Decimal(d) => d.trunc().to_i64(),
        SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Float(f) => Some(*f),
        SqlValue::Int(i) => Some(*i as f64),
        SqlValue::Decimal(d) => d.to_f64(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok()
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok()
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| parse_date(s).map(|d| d.and_time(NaiveTime::MIN)))
}
