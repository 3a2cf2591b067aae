//! In-flight row anonymization.
//!
//! [`TableAnonymizationOptions`] is the per-table configuration. Before a
//! table is transferred it is compiled against the table's column list into
//! a [`RowMutator`], which then rewrites each row of every chunk in place.

mod faker;

pub use faker::{FakeGenerator, FakerRegistry};

use serde::{Deserialize, Serialize};

use crate::core::schema::{ColumnSchema, LogicalType};
use crate::core::value::{Row, SqlValue};
use crate::error::{CloneError, Result};
use crate::state::hmac_hex;

fn default_mask_char() -> String {
    "*".to_string()
}

/// How one column's values are rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mutation {
    /// Keep the first `visible_chars` characters, replace the rest with `mask_char`.
    Mask {
        #[serde(default)]
        visible_chars: usize,
        #[serde(default = "default_mask_char")]
        mask_char: String,
    },
    /// Replace every value with a fixed literal.
    Static { value: serde_json::Value },
    /// Replace every value with a generated one of `category`.
    Fake { category: String },
    /// Replace the value with a hex HMAC-SHA256 digest.
    Hash {
        #[serde(default)]
        key: Option<String>,
    },
    /// Pass the value through.
    Keep,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Mask { .. } => "MASK",
            Mutation::Static { .. } => "STATIC",
            Mutation::Fake { .. } => "FAKE",
            Mutation::Hash { .. } => "HASH",
            Mutation::Keep => "KEEP",
        }
    }
}

/// A mutation bound to a column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMutation {
    pub column_name: String,
    #[serde(flatten)]
    pub mutation: Mutation,
}

impl ColumnMutation {
    pub fn new(column_name: impl Into<String>, mutation: Mutation) -> Self {
        Self {
            column_name: column_name.into(),
            mutation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStrategy {
    FirstX,
    LastX,
}

/// Transfer only a slice of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSelection {
    pub strategy: SelectionStrategy,
    pub limit: u64,
    /// Leads the ORDER BY when set; key columns follow as tie-breakers.
    #[serde(default)]
    pub sort_column: Option<String>,
}

/// Anonymization settings for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableAnonymizationOptions {
    #[serde(default)]
    pub column_mutations: Vec<ColumnMutation>,
    #[serde(default)]
    pub row_selection: Option<RowSelection>,
}

impl TableAnonymizationOptions {
    pub fn is_empty(&self) -> bool {
        self.column_mutations.is_empty() && self.row_selection.is_none()
    }
}

enum Compiled {
    Mask { visible: usize, mask: char },
    Static(SqlValue),
    Fake(FakeGenerator),
    Hash(Vec<u8>),
}

/// Mutations resolved to column positions for one table.
pub struct RowMutator {
    steps: Vec<(usize, Compiled)>,
}

impl RowMutator {
    /// Resolve `mutations` against `columns`.
    ///
    /// `default_hash_key` is used by HASH mutations without their own key.
    /// Unknown columns, unknown FAKE categories, and MASK or HASH on a column
    /// that does not hold character data are configuration errors.
    pub fn compile(
        table: &str,
        columns: &[ColumnSchema],
        mutations: &[ColumnMutation],
        faker: &FakerRegistry,
        default_hash_key: &str,
    ) -> Result<Self> {
        let mut steps = Vec::with_capacity(mutations.len());
        for m in mutations {
            let index = columns
                .iter()
                .position(|c| c.name == m.column_name)
                .ok_or_else(|| {
                    CloneError::Config(format!(
                        "{} mutation targets unknown column {}.{}",
                        m.mutation.name(),
                        table,
                        m.column_name
                    ))
                })?;

            if matches!(m.mutation, Mutation::Mask { .. } | Mutation::Hash { .. }) {
                check_character_column(table, &columns[index], &m.mutation)?;
            }

            let step = match &m.mutation {
                Mutation::Keep => continue,
                Mutation::Mask {
                    visible_chars,
                    mask_char,
                } => {
                    let mut chars = mask_char.chars();
                    let mask = match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => {
                            return Err(CloneError::Config(format!(
                                "mask_char for {}.{} must be exactly one character",
                                table, m.column_name
                            )))
                        }
                    };
                    Compiled::Mask {
                        visible: *visible_chars,
                        mask,
                    }
                }
                Mutation::Static { value } => Compiled::Static(SqlValue::from_json(value)),
                Mutation::Fake { category } => {
                    let generator = faker.get(category).ok_or_else(|| {
                        CloneError::Config(format!(
                            "Unknown fake category '{}' for {}.{}",
                            category, table, m.column_name
                        ))
                    })?;
                    Compiled::Fake(generator)
                }
                Mutation::Hash { key } => Compiled::Hash(
                    key.as_deref()
                        .unwrap_or(default_hash_key)
                        .as_bytes()
                        .to_vec(),
                ),
            };
            steps.push((index, step));
        }
        Ok(Self { steps })
    }

    /// Whether every configured mutation is KEEP.
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&self, row: &mut Row) -> Result<()> {
        for (index, step) in &self.steps {
            let Some(value) = row.get_mut(*index) else {
                continue;
            };
            *value = match step {
                Compiled::Static(literal) => literal.clone(),
                Compiled::Fake(generator) => generator(),
                Compiled::Mask { visible, mask } => match value.to_text() {
                    Some(text) => SqlValue::Text(mask_text(&text, *visible, *mask)),
                    None => continue,
                },
                Compiled::Hash(key) => match value.to_text() {
                    Some(text) => SqlValue::Text(hmac_hex(key, text.as_bytes())?),
                    None => continue,
                },
            };
        }
        Ok(())
    }

    pub fn apply_all(&self, rows: &mut [Row]) -> Result<()> {
        if self.is_identity() {
            return Ok(());
        }
        for row in rows {
            self.apply(row)?;
        }
        Ok(())
    }
}

/// Hex HMAC-SHA256 digests are this many characters long.
const HASH_LEN: u32 = 64;

/// MASK and HASH produce text, so the column must store character data.
fn check_character_column(table: &str, column: &ColumnSchema, mutation: &Mutation) -> Result<()> {
    if !LogicalType::is_character(&column.data_type) {
        return Err(CloneError::Config(format!(
            "{} cannot be applied to {}.{} of type {}",
            mutation.name(),
            table,
            column.name,
            column.data_type
        )));
    }
    if let (Mutation::Hash { .. }, Some(length)) = (mutation, column.length) {
        if length < HASH_LEN {
            return Err(CloneError::Config(format!(
                "HASH needs {} characters but {}.{} holds {}",
                HASH_LEN, table, column.name, length
            )));
        }
    }
    Ok(())
}

/// Keep the first `visible` characters and replace the rest with `mask`.
pub fn mask_text(text: &str, visible: usize, mask: char) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| if i < visible { c } else { mask })
        .collect()
}
