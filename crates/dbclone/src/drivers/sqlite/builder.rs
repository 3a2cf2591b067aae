//! SQLite DDL generation.
//!
//! SQLite cannot add constraints to an existing table, so primary and
//! foreign keys are always emitted inside `CREATE TABLE`. The operations
//! that would need `ALTER TABLE .. ADD CONSTRAINT` or `ALTER COLUMN` fail
//! with [`CloneError::Unsupported`].

use super::dialect::SqliteDialect;
use crate::core::schema::{ColumnSchema, ForeignKeySchema, IndexSchema, IndexType, LogicalType, TableSchema};
use crate::core::traits::{DialectSql, SchemaBuilder};
use crate::drivers::common::ddl::{foreign_key_clause, render_default, same_action, sized};
use crate::error::{CloneError, Result};

impl SqliteDialect {
    /// The column that becomes the table's rowid alias, if any.
    fn rowid_column<'a>(&self, table: &'a TableSchema) -> Option<&'a ColumnSchema> {
        let pk = table.primary_key_columns();
        if pk.len() != 1 {
            return None;
        }
        table
            .column(&pk[0])
            .filter(|c| c.auto_increment && LogicalType::is_integer(&c.data_type))
    }
}

impl SchemaBuilder for SqliteDialect {
    fn build_data_type(&self, column: &ColumnSchema) -> String {
        match column.data_type.as_str() {
            "tinyint" => "TINYINT".into(),
            "smallint" => "SMALLINT".into(),
            "mediumint" => "MEDIUMINT".into(),
            "integer" => "INTEGER".into(),
            "bigint" => "BIGINT".into(),
            "decimal" => sized("NUMERIC", column),
            "float" | "double" => "REAL".into(),
            "boolean" => "BOOLEAN".into(),
            "char" => sized("CHAR", column),
            "varchar" => sized("VARCHAR", column),
            "text" | "mediumtext" | "longtext" | "json" | "uuid" => "TEXT".into(),
            "binary" | "varbinary" | "blob" | "longblob" => "BLOB".into(),
            "date" => "DATE".into(),
            "time" => "TIME".into(),
            "datetime" => "DATETIME".into(),
            "timestamp" | "timestamptz" => "TIMESTAMP".into(),
            other => sized(&other.to_uppercase(), column),
        }
    }

    fn build_column_definition(&self, column: &ColumnSchema) -> String {
        let mut def = format!("{} {}", self.quote(&column.name), self.build_data_type(column));
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            if !column.auto_increment {
                def.push_str(" DEFAULT ");
                def.push_str(&render_default(default, false));
            }
        }
        def
    }

    fn build_create_table(&self, table: &TableSchema) -> Result<String> {
        table.validate()?;

        let rowid = self.rowid_column(table).map(|c| c.name.as_str());
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                if Some(c.name.as_str()) == rowid {
                    format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote(&c.name))
                } else {
                    self.build_column_definition(c)
                }
            })
            .collect();

        if rowid.is_none() {
            if let Some(pk) = table.primary_key() {
                parts.push(format!("PRIMARY KEY ({})", self.quote_columns(&pk.columns)));
            }
        }
        for fk in &table.foreign_keys {
            parts.push(format!(
                "CONSTRAINT {} {}",
                self.quote(&fk.name),
                foreign_key_clause(self, fk, same_action)
            ));
        }

        Ok(format!("CREATE TABLE {} ({})", self.quote(&table.name), parts.join(", ")))
    }

    fn build_create_index(&self, table: &str, index: &IndexSchema) -> Result<String> {
        let name = self.quote(&index.name);
        let table = self.quote(table);
        let columns = self.quote_columns(&index.columns);
        match index.index_type {
            IndexType::Primary => Err(CloneError::unsupported("SQLite", "ALTER TABLE ADD PRIMARY KEY")),
            IndexType::Unique => Ok(format!("CREATE UNIQUE INDEX {} ON {} ({})", name, table, columns)),
            IndexType::Index | IndexType::Fulltext | IndexType::Spatial => {
                Ok(format!("CREATE INDEX {} ON {} ({})", name, table, columns))
            }
        }
    }

    fn build_add_foreign_key(&self, _table: &str, _fk: &ForeignKeySchema) -> Result<String> {
        Err(CloneError::unsupported("SQLite", "ALTER TABLE ADD FOREIGN KEY"))
    }

    fn build_add_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote(table),
            self.build_column_definition(column)
        ))
    }

    fn build_modify_column(&self, _table: &str, _column: &ColumnSchema) -> Result<String> {
        Err(CloneError::unsupported("SQLite", "ALTER TABLE MODIFY COLUMN"))
    }

    fn embeds_foreign_keys(&self) -> bool {
        true
    }
}
