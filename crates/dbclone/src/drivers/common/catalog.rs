//! Helpers for folding per-column catalog rows into index and foreign key
//! definitions. Every inspector reads one row per (constraint, column) pair.

use crate::core::schema::{ForeignKeySchema, IndexSchema, IndexType, ReferentialAction};

/// One column of one index, in key order.
#[derive(Debug, Clone)]
pub struct IndexColumnRow {
    pub index_name: String,
    pub column_name: String,
    pub index_type: IndexType,
}

/// One column pair of one foreign key, in key order.
#[derive(Debug, Clone)]
pub struct ForeignKeyColumnRow {
    pub constraint_name: String,
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub on_update: String,
    pub on_delete: String,
}

/// Group index rows by name, keeping first-seen order.
pub fn group_indexes(rows: impl IntoIterator<Item = IndexColumnRow>) -> Vec<IndexSchema> {
    let mut indexes: Vec<IndexSchema> = Vec::new();
    for row in rows {
        match indexes.iter_mut().find(|i| i.name == row.index_name) {
            Some(idx) => idx.columns.push(row.column_name),
            None => indexes.push(IndexSchema::new(
                row.index_name,
                vec![row.column_name],
                row.index_type,
            )),
        }
    }
    indexes
}

/// Group foreign key rows by constraint name, keeping first-seen order.
pub fn group_foreign_keys(
    rows: impl IntoIterator<Item = ForeignKeyColumnRow>,
) -> Vec<ForeignKeySchema> {
    let mut fks: Vec<ForeignKeySchema> = Vec::new();
    for row in rows {
        match fks.iter_mut().find(|f| f.name == row.constraint_name) {
            Some(fk) => {
                fk.columns.push(row.column_name);
                fk.referenced_columns.push(row.referenced_column);
            }
            None => fks.push(ForeignKeySchema {
                name: row.constraint_name,
                columns: vec![row.column_name],
                referenced_table: row.referenced_table,
                referenced_columns: vec![row.referenced_column],
                on_update: ReferentialAction::parse(&row.on_update),
                on_delete: ReferentialAction::parse(&row.on_delete),
            }),
        }
    }
    fks
}

/// Clamp a catalog length to `u32`, treating zero and negatives as absent.
pub fn catalog_length(value: Option<i64>) -> Option<u32> {
    value.filter(|v| *v > 0).map(|v| u32::try_from(v).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_composite_index() {
        let rows = vec![
            IndexColumnRow {
                index_name: "PRIMARY".into(),
                column_name: "id".into(),
                index_type: IndexType::Primary,
            },
            IndexColumnRow {
                index_name: "name_idx".into(),
                column_name: "last".into(),
                index_type: IndexType::Index,
            },
            IndexColumnRow {
                index_name: "name_idx".into(),
                column_name: "first".into(),
                index_type: IndexType::Index,
            },
        ];
        let idx = group_indexes(rows);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx[1].columns, vec!["last".to_string(), "first".to_string()]);
    }

    #[test]
    fn test_group_foreign_keys() {
        let row = |col: &str, rcol: &str| ForeignKeyColumnRow {
            constraint_name: "fk".into(),
            column_name: col.into(),
            referenced_table: "parent".into(),
            referenced_column: rcol.into(),
            on_update: "NO ACTION".into(),
            on_delete: "SET NULL".into(),
        };
        let fks = group_foreign_keys(vec![row("a", "x"), row("b", "y")]);
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].referenced_columns, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(fks[0].on_delete, ReferentialAction::SetNull);
    }

    #[test]
    fn test_catalog_length() {
        assert_eq!(catalog_length(Some(255)), Some(255));
        assert_eq!(catalog_length(Some(0)), None);
        assert_eq!(catalog_length(Some(-1)), None);
        assert_eq!(catalog_length(Some(4_294_967_295)), Some(u32::MAX));
        assert_eq!(catalog_length(Some(i64::MAX)), Some(u32::MAX));
    }
}
