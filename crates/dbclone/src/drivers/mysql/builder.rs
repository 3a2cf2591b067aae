//! MySQL DDL generation.
//!
//! Primary and unique keys are inlined into `CREATE TABLE`; engine, charset
//! and collation from the table metadata become table options.

use super::dialect::MysqlDialect;
use crate::core::schema::{ColumnSchema, ForeignKeySchema, IndexSchema, IndexType, TableSchema};
use crate::core::traits::{DialectSql, SchemaBuilder};
use crate::drivers::common::ddl::{
    foreign_key_clause, is_max_family, render_default, same_action, sized, sized_or,
};
use crate::error::Result;

/// Prefix length used when a TEXT/BLOB column takes part in a unique key.
const INDEX_PREFIX: u32 = 191;

impl MysqlDialect {
    fn key_part(&self, table: &TableSchema, column: &str) -> String {
        let needs_prefix = table
            .column(column)
            .map(|c| is_max_family(&self.build_data_type(c)))
            .unwrap_or(false);
        if needs_prefix {
            format!("{}({})", self.quote(column), INDEX_PREFIX)
        } else {
            self.quote(column)
        }
    }

    fn key_parts(&self, table: &TableSchema, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.key_part(table, c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn table_options(&self, table: &TableSchema) -> String {
        let engine = table
            .metadata
            .get("engine")
            .map(String::as_str)
            .unwrap_or("InnoDB");
        let mut options = format!(" ENGINE={}", engine);
        if let Some(charset) = table.metadata.get("charset") {
            options.push_str(&format!(" DEFAULT CHARSET={}", charset));
        }
        if let Some(collation) = table.metadata.get("collation") {
            options.push_str(&format!(" COLLATE={}", collation));
        }
        options
    }
}

impl SchemaBuilder for MysqlDialect {
    fn build_data_type(&self, column: &ColumnSchema) -> String {
        let unsigned = |base: String| {
            if column.unsigned {
                format!("{} UNSIGNED", base)
            } else {
                base
            }
        };

        match column.data_type.as_str() {
            "tinyint" => unsigned("TINYINT".into()),
            "smallint" => unsigned("SMALLINT".into()),
            "mediumint" => unsigned("MEDIUMINT".into()),
            "integer" => unsigned("INT".into()),
            "bigint" => unsigned("BIGINT".into()),
            "decimal" => unsigned(sized("DECIMAL", column)),
            "float" => "FLOAT".into(),
            "double" => "DOUBLE".into(),
            "boolean" => "TINYINT(1)".into(),
            "char" => sized("CHAR", column),
            "varchar" => sized_or("VARCHAR", column, 255),
            "text" => "TEXT".into(),
            "mediumtext" => "MEDIUMTEXT".into(),
            "longtext" => "LONGTEXT".into(),
            "binary" => sized("BINARY", column),
            "varbinary" => sized_or("VARBINARY", column, 255),
            "blob" => "BLOB".into(),
            "longblob" => "LONGBLOB".into(),
            "date" => "DATE".into(),
            "time" => "TIME".into(),
            "datetime" => "DATETIME".into(),
            "timestamp" | "timestamptz" => "TIMESTAMP".into(),
            "json" => "JSON".into(),
            "uuid" => "CHAR(36)".into(),
            other => sized(&other.to_uppercase(), column),
        }
    }

    fn build_column_definition(&self, column: &ColumnSchema) -> String {
        let data_type = self.build_data_type(column);
        let mut def = format!("{} {}", self.quote(&column.name), data_type);

        def.push_str(if column.nullable { " NULL" } else { " NOT NULL" });

        // MySQL rejects literal defaults on TEXT/BLOB/JSON columns.
        if let Some(default) = &column.default {
            if !column.auto_increment && !is_max_family(&data_type) {
                def.push_str(" DEFAULT ");
                def.push_str(&render_default(default, false));
            }
        }

        if column.auto_increment {
            def.push_str(" AUTO_INCREMENT");
        }

        if let Some(comment) = column.comment.as_deref().filter(|c| !c.is_empty()) {
            def.push_str(&format!(" COMMENT '{}'", comment.replace('\'', "''")));
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

        match table.primary_key() {
            Some(pk) => parts.push(format!("PRIMARY KEY ({})", self.key_parts(table, &pk.columns))),
            None => {
                // AUTO_INCREMENT must be a key.
                if let Some(col) = table.columns.iter().find(|c| c.auto_increment) {
                    parts.push(format!("PRIMARY KEY ({})", self.quote(&col.name)));
                }
            }
        }

        for idx in table.indexes.iter().filter(|i| i.index_type == IndexType::Unique) {
            parts.push(format!(
                "UNIQUE KEY {} ({})",
                self.quote(&idx.name),
                self.key_parts(table, &idx.columns)
            ));
        }

        Ok(format!(
            "CREATE TABLE {} ({}){}",
            self.quote(&table.name),
            parts.join(", "),
            self.table_options(table)
        ))
    }

    fn build_create_index(&self, table: &str, index: &IndexSchema) -> Result<String> {
        let columns = self.quote_columns(&index.columns);
        let table = self.quote(table);
        let name = self.quote(&index.name);
        Ok(match index.index_type {
            IndexType::Primary => format!("ALTER TABLE {} ADD PRIMARY KEY ({})", table, columns),
            IndexType::Unique => format!("CREATE UNIQUE INDEX {} ON {} ({})", name, table, columns),
            IndexType::Fulltext => {
                format!("CREATE FULLTEXT INDEX {} ON {} ({})", name, table, columns)
            }
            IndexType::Spatial => {
                format!("CREATE SPATIAL INDEX {} ON {} ({})", name, table, columns)
            }
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

    fn build_modify_column(&self, table: &str, column: &ColumnSchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            self.quote(table),
            self.build_column_definition(column)
        ))
    }

    fn inlines_index(&self, index: &IndexSchema) -> bool {
        matches!(index.index_type, IndexType::Primary | IndexType::Unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnDefault, ReferentialAction};

    fn users() -> TableSchema {
        let mut t = TableSchema::new("users");
        t.columns = vec![
            ColumnSchema::new("id", "bigint").auto_increment(),
            ColumnSchema::new("email", "varchar").with_length(191).not_null(),
            ColumnSchema::new("bio", "text"),
            ColumnSchema::new("active", "boolean")
                .not_null()
                .with_default(ColumnDefault::Boolean(true)),
        ];
        t.indexes = vec![
            IndexSchema::new("PRIMARY", vec!["id".into()], IndexType::Primary),
            IndexSchema::new("users_email_unique", vec!["email".into()], IndexType::Unique),
        ];
        t.metadata.insert("charset".into(), "utf8mb4".into());
        t.metadata.insert("collation".into(), "utf8mb4_unicode_ci".into());
        t
    }

    #[test]
    fn test_create_table_inlines_keys_once() {
        let sql = MysqlDialect.build_create_table(&users()).unwrap();
        assert_eq!(sql.matches("PRIMARY KEY").count(), 1);
        assert_eq!(sql.matches("UNIQUE KEY").count(), 1);
        assert!(sql.contains("`id` BIGINT NOT NULL AUTO_INCREMENT"));
        assert!(sql.contains("`active` TINYINT(1) NOT NULL DEFAULT 1"));
        assert!(sql.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci"));
    }

    #[test]
    fn test_unique_text_column_gets_prefix() {
        let mut t = users();
        t.indexes.push(IndexSchema::new("bio_unique", vec!["bio".into()], IndexType::Unique));
        let sql = MysqlDialect.build_create_table(&t).unwrap();
        assert!(sql.contains("UNIQUE KEY `bio_unique` (`bio`(191))"));
    }

    #[test]
    fn test_data_types() {
        let d = MysqlDialect;
        let mut col = ColumnSchema::new("n", "integer");
        col.unsigned = true;
        assert_eq!(d.build_data_type(&col), "INT UNSIGNED");
        assert_eq!(
            d.build_data_type(&ColumnSchema::new("p", "decimal").with_precision(8, 2)),
            "DECIMAL(8,2)"
        );
        assert_eq!(d.build_data_type(&ColumnSchema::new("s", "varchar")), "VARCHAR(255)");
        assert_eq!(
            d.build_data_type(&ColumnSchema::new("b", "longtext").with_length(4_294_967_295)),
            "LONGTEXT"
        );
        assert_eq!(d.build_data_type(&ColumnSchema::new("u", "uuid")), "CHAR(36)");
    }

    #[test]
    fn test_string_default_is_quoted() {
        let col = ColumnSchema::new("status", "varchar")
            .with_length(20)
            .with_default(ColumnDefault::Text("it's new".into()));
        assert_eq!(
            MysqlDialect.build_column_definition(&col),
            "`status` VARCHAR(20) NULL DEFAULT 'it''s new'"
        );
    }

    #[test]
    fn test_add_foreign_key() {
        let fk = ForeignKeySchema {
            name: "posts_user_id_foreign".into(),
            columns: vec!["user_id".into()],
            referenced_table: "users".into(),
            referenced_columns: vec!["id".into()],
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::Cascade,
        };
        assert_eq!(
            MysqlDialect.build_add_foreign_key("posts", &fk).unwrap(),
            "ALTER TABLE `posts` ADD CONSTRAINT `posts_user_id_foreign` FOREIGN KEY (`user_id`) \
             REFERENCES `users` (`id`) ON UPDATE NO ACTION ON DELETE CASCADE"
        );
    }

    #[test]
    fn test_modify_column() {
        let col = ColumnSchema::new("name", "varchar").with_length(100).not_null();
        assert_eq!(
            MysqlDialect.build_modify_column("users", &col).unwrap(),
            "ALTER TABLE `users` MODIFY COLUMN `name` VARCHAR(100) NOT NULL"
        );
    }

    #[test]
    fn test_duplicate_columns_rejected_before_ddl() {
        let mut t = users();
        t.columns.push(ColumnSchema::new("email", "text"));
        assert!(MysqlDialect.build_create_table(&t).is_err());
    }
}
