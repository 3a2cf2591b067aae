//! PostgreSQL DDL generation.
//!
//! Auto-increment columns become `SERIAL`/`BIGSERIAL`/`SMALLSERIAL`. Column
//! comments are emitted as trailing `COMMENT ON COLUMN` statements.

use super::dialect::PostgresDialect;
use crate::core::identifier::quote_literal;
use crate::core::schema::{ColumnSchema, ForeignKeySchema, IndexSchema, IndexType, TableSchema};
use crate::core::traits::{DialectSql, SchemaBuilder};
use crate::drivers::common::ddl::{foreign_key_clause, render_default, same_action, sized};
use crate::error::Result;

impl PostgresDialect {
    fn base_type(&self, column: &ColumnSchema) -> String {
        match column.data_type.as_str() {
            "tinyint" | "smallint" => "SMALLINT".into(),
            "mediumint" | "integer" => "INTEGER".into(),
            "bigint" => "BIGINT".into(),
            "decimal" => sized("NUMERIC", column),
            "float" => "REAL".into(),
            "double" => "DOUBLE PRECISION".into(),
            "boolean" => "BOOLEAN".into(),
            "char" => sized("CHAR", column),
            "varchar" => sized("VARCHAR", column),
            "text" | "mediumtext" | "longtext" => "TEXT".into(),
            "binary" | "varbinary" | "blob" | "longblob" => "BYTEA".into(),
            "date" => "DATE".into(),
            "time" => "TIME".into(),
            "datetime" | "timestamp" => "TIMESTAMP".into(),
            "timestamptz" => "TIMESTAMPTZ".into(),
            "json" => "JSON".into(),
            "uuid" => "UUID".into(),
            other => sized(&other.to_uppercase(), column),
        }
    }

    fn fulltext_expression(&self, columns: &[String]) -> String {
        let parts: Vec<String> = columns
            .iter()
            .map(|c| format!("coalesce({}, '')", self.quote(c)))
            .collect();
        format!("to_tsvector('simple', {})", parts.join(" || ' ' || "))
    }
}

impl SchemaBuilder for PostgresDialect {
    fn build_data_type(&self, column: &ColumnSchema) -> String {
        if column.auto_increment {
            return match column.data_type.as_str() {
                "bigint" => "BIGSERIAL".into(),
                "tinyint" | "smallint" => "SMALLSERIAL".into(),
                _ => "SERIAL".into(),
            };
        }
        self.base_type(column)
    }

    fn build_column_definition(&self, column: &ColumnSchema) -> String {
        let mut def = format!("{} {}", self.quote(&column.name), self.build_data_type(column));
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            if !column.auto_increment {
                def.push_str(" DEFAULT ");
                def.push_str(&render_default(default, true));
            }
        }
        def
    }

    fn build_create_table(&self, table: &TableSchema) -> Result<String> {
        table.validate()?;

        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.build_column_definition(c))
            .collect();
        if let Some(pk) = table.primary_key() {
            parts.push(format!("PRIMARY KEY ({})", self.quote_columns(&pk.columns)));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            self.quote(&table.name),
            parts.join(", ")
        )];
        for col in &table.columns {
            if let Some(comment) = col.comment.as_deref().filter(|c| !c.is_empty()) {
                statements.push(format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    self.quote(&table.name),
                    self.quote(&col.name),
                    quote_literal(comment)
                ));
            }
        }
        Ok(statements.join("; "))
    }

    fn build_create_index(&self, table: &str, index: &IndexSchema) -> Result<String> {
        let name = self.quote(&index.name);
        let table = self.quote(table);
        let columns = self.quote_columns(&index.columns);
        Ok(match index.index_type {
            IndexType::Primary => format!("ALTER TABLE {} ADD PRIMARY KEY ({})", table, columns),
            IndexType::Unique => format!("CREATE UNIQUE INDEX {} ON {} ({})", name, table, columns),
            IndexType::Fulltext => format!(
                "CREATE INDEX {} ON {} USING GIN ({})",
                name,
                table,
                self.fulltext_expression(&index.columns)
            ),
            IndexType::Spatial => format!("CREATE INDEX {} ON {} USING GIST ({})", name, table, columns),
            IndexType::Index => format!("CREATE INDEX {} ON {} ({})", name, table, columns),
        })
    }

    fn build_add_foreign_key(&self, table: &str, fk: &ForeignKeySchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            self.quote(table),
            self.quote(&fk.name),
            foreign_key_clause(self, fk, same_action)
        ))
    }

    fn build_add_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote(table),
            self.build_column_definition(column)
        ))
    }

    /// PostgreSQL cannot combine TYPE, NULL-ness and DEFAULT in one
    /// `ALTER COLUMN`, so this emits one statement per aspect.
    fn build_modify_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        let prefix = format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            self.quote(table),
            self.quote(&column.name)
        );
        let mut statements = vec![
            format!("{} TYPE {}", prefix, self.base_type(column)),
            if column.nullable {
                format!("{} DROP NOT NULL", prefix)
            } else {
                format!("{} SET NOT NULL", prefix)
            },
        ];
        if let Some(default) = &column.default {
            statements.push(format!("{} SET DEFAULT {}", prefix, render_default(default, true)));
        }
        Ok(statements.join("; "))
    }

    fn build_drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", self.quote(table))
    }
}
