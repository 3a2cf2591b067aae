//! SQL Server DDL generation.

use super::dialect::MssqlDialect;
use crate::core::schema::{
    ColumnSchema, ForeignKeySchema, IndexSchema, IndexType, ReferentialAction, TableSchema,
};
use crate::core::traits::{DialectSql, SchemaBuilder};
use crate::drivers::common::ddl::{foreign_key_clause, render_default, sized};
use crate::error::Result;

/// Longest sized VARCHAR/VARBINARY before falling back to `(MAX)`.
const MAX_SIZED: u32 = 8000;

/// SQL Server has no RESTRICT; NO ACTION is the equivalent check.
fn mssql_action(action: ReferentialAction) -> ReferentialAction {
    match action {
        ReferentialAction::Restrict => ReferentialAction::NoAction,
        other => other,
    }
}

fn variable(base: &str, column: &ColumnSchema) -> String {
    match column.length {
        Some(length) if length > 0 && length <= MAX_SIZED => format!("{}({})", base, length),
        _ => format!("{}(MAX)", base),
    }
}

impl SchemaBuilder for MssqlDialect {
    fn build_data_type(&self, column: &ColumnSchema) -> String {
        match column.data_type.as_str() {
            "tinyint" => "TINYINT".into(),
            "smallint" => "SMALLINT".into(),
            "mediumint" | "integer" => "INT".into(),
            "bigint" => "BIGINT".into(),
            "decimal" => sized("DECIMAL", column),
            "float" => "REAL".into(),
            "double" => "FLOAT".into(),
            "boolean" => "BIT".into(),
            "char" => sized("CHAR", column),
            "varchar" => variable("VARCHAR", column),
            "text" | "mediumtext" | "longtext" => "VARCHAR(MAX)".into(),
            "binary" => sized("BINARY", column),
            "varbinary" => variable("VARBINARY", column),
            "blob" | "longblob" => "VARBINARY(MAX)".into(),
            "date" => "DATE".into(),
            "time" => "TIME".into(),
            "datetime" | "timestamp" => "DATETIME2".into(),
            "timestamptz" => "DATETIMEOFFSET".into(),
            "json" => "NVARCHAR(MAX)".into(),
            "uuid" => "UNIQUEIDENTIFIER".into(),
            other => sized(&other.to_uppercase(), column),
        }
    }

    fn build_column_definition(&self, column: &ColumnSchema) -> String {
        let mut def = format!("{} {}", self.quote(&column.name), self.build_data_type(column));
        if column.auto_increment {
            def.push_str(" IDENTITY(1,1)");
        }
        def.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
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

        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.build_column_definition(c))
            .collect();
        if let Some(pk) = table.primary_key() {
            parts.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                self.quote(&format!("PK_{}", table.name)),
                self.quote_columns(&pk.columns)
            ));
        }
        Ok(format!("CREATE TABLE {} ({})", self.quote(&table.name), parts.join(", ")))
    }

    fn build_create_index(&self, table: &str, index: &IndexSchema) -> Result<String> {
        let name = self.quote(&index.name);
        let quoted_table = self.quote(table);
        let columns = self.quote_columns(&index.columns);
        Ok(match index.index_type {
            IndexType::Primary => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                quoted_table,
                self.quote(&format!("PK_{}", table)),
                columns
            ),
            IndexType::Unique => {
                format!("CREATE UNIQUE INDEX {} ON {} ({})", name, quoted_table, columns)
            }
            IndexType::Spatial => {
                format!("CREATE SPATIAL INDEX {} ON {} ({})", name, quoted_table, columns)
            }
            // Full-text indexes need a catalog and a unique key index; a plain
            // index keeps lookups on the same columns working.
            IndexType::Fulltext | IndexType::Index => {
                format!("CREATE INDEX {} ON {} ({})", name, quoted_table, columns)
            }
        })
    }

    fn build_add_foreign_key(&self, table: &str, fk: &ForeignKeySchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            self.quote(table),
            self.quote(&fk.name),
            foreign_key_clause(self, fk, mssql_action)
        ))
    }

    fn build_add_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD {}",
            self.quote(table),
            self.build_column_definition(column)
        ))
    }

    fn build_modify_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        let table = self.quote(table);
        let name = self.quote(&column.name);
        let mut sql = format!(
            "ALTER TABLE {} ALTER COLUMN {} {} {}",
            table,
            name,
            self.build_data_type(column),
            if column.nullable { "NULL" } else { "NOT NULL" }
        );
        if let Some(default) = &column.default {
            if !column.auto_increment {
                sql.push_str(&format!(
                    "; ALTER TABLE {} ADD DEFAULT {} FOR {}",
                    table,
                    render_default(default, false),
                    name
                ));
            }
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnDefault;
    use crate::drivers::common::ddl::is_max_family;

    #[test]
    fn test_max_types_without_length() {
        let d = MssqlDialect;
        assert_eq!(d.build_data_type(&ColumnSchema::new("a", "varchar")), "VARCHAR(MAX)");
        assert_eq!(
            d.build_data_type(&ColumnSchema::new("a", "varchar").with_length(9000)),
            "VARCHAR(MAX)"
        );
        assert_eq!(
            d.build_data_type(&ColumnSchema::new("a", "varchar").with_length(120)),
            "VARCHAR(120)"
        );
        assert_eq!(d.build_data_type(&ColumnSchema::new("b", "varbinary")), "VARBINARY(MAX)");
        assert_eq!(
            d.build_data_type(&ColumnSchema::new("t", "longtext").with_length(4_294_967_295)),
            "VARCHAR(MAX)"
        );
        assert!(is_max_family(&d.build_data_type(&ColumnSchema::new("j", "json"))));
    }

    #[test]
    fn test_identity_has_no_default() {
        let col = ColumnSchema::new("id", "bigint")
            .auto_increment()
            .with_default(ColumnDefault::Number("1".into()));
        assert_eq!(
            MssqlDialect.build_column_definition(&col),
            "[id] BIGINT IDENTITY(1,1) NOT NULL"
        );
    }

    #[test]
    fn test_boolean_default_is_numeric() {
        let col = ColumnSchema::new("active", "boolean").with_default(ColumnDefault::Boolean(true));
        assert_eq!(MssqlDialect.build_column_definition(&col), "[active] BIT NULL DEFAULT 1");
    }

    #[test]
    fn test_create_table_has_one_primary_key() {
        let mut t = TableSchema::new("users");
        t.columns = vec![
            ColumnSchema::new("id", "integer").auto_increment(),
            ColumnSchema::new("name", "varchar").with_length(50),
        ];
        t.indexes = vec![IndexSchema::new("PK_users", vec!["id".into()], IndexType::Primary)];
        let sql = MssqlDialect.build_create_table(&t).unwrap();
        assert_eq!(sql.matches("PRIMARY KEY").count(), 1);
        assert!(sql.contains("CONSTRAINT [PK_users] PRIMARY KEY ([id])"));
    }

    #[test]
    fn test_restrict_maps_to_no_action() {
        let fk = ForeignKeySchema {
            name: "fk_orders_user".into(),
            columns: vec!["user_id".into()],
            referenced_table: "users".into(),
            referenced_columns: vec!["id".into()],
            on_update: ReferentialAction::Restrict,
            on_delete: ReferentialAction::Cascade,
        };
        let sql = MssqlDialect.build_add_foreign_key("orders", &fk).unwrap();
        assert!(sql.ends_with("ON UPDATE NO ACTION ON DELETE CASCADE"));
    }

    #[test]
    fn test_modify_column_with_default() {
        let col = ColumnSchema::new("qty", "integer")
            .not_null()
            .with_default(ColumnDefault::Number("0".into()));
        assert_eq!(
            MssqlDialect.build_modify_column("items", &col).unwrap(),
            "ALTER TABLE [items] ALTER COLUMN [qty] INT NOT NULL; ALTER TABLE [items] ADD DEFAULT 0 FOR [qty]"
        );
    }

    #[test]
    fn test_fulltext_falls_back_to_plain_index() {
        let idx = IndexSchema::new("ft_body", vec!["body".into()], IndexType::Fulltext);
        assert_eq!(
            MssqlDialect.build_create_index("posts", &idx).unwrap(),
            "CREATE INDEX [ft_body] ON [posts] ([body])"
        );
    }
}
