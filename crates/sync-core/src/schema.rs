//! Table identity and schema metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Fully qualified table name, e.g. `inventory.orders`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Column types the capture pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Text,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Whether the type has a total order usable for chunk boundaries.
    pub fn is_orderable(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: TableId,
    pub columns: Vec<ColumnDef>,
    /// Single-column primary key; also the split column.
    pub primary_key: Option<String>,
}

impl TableSchema {
    pub fn new(table_id: TableId, columns: Vec<ColumnDef>, primary_key: Option<&str>) -> Self {
        Self {
            table_id,
            columns,
            primary_key: primary_key.map(str::to_string),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary key column, if declared and present.
    pub fn key_column(&self) -> Option<&ColumnDef> {
        self.primary_key.as_deref().and_then(|pk| self.column(pk))
    }

    /// Check that `next` can replace this schema without invalidating rows
    /// already captured: same primary key, every known column still present
    /// with the same type. New columns are allowed.
    pub fn check_compatible(&self, next: &TableSchema) -> Result<()> {
        if self.primary_key != next.primary_key {
            return Err(SyncError::schema_drift(
                self.table_id.as_str(),
                format!(
                    "primary key changed from {:?} to {:?}",
                    self.primary_key, next.primary_key
                ),
            ));
        }
        for column in &self.columns {
            match next.column(&column.name) {
                None => {
                    return Err(SyncError::schema_drift(
                        self.table_id.as_str(),
                        format!("column '{}' was dropped", column.name),
                    ))
                }
                Some(changed) if changed.column_type != column.column_type => {
                    return Err(SyncError::schema_drift(
                        self.table_id.as_str(),
                        format!(
                            "column '{}' changed type from {:?} to {:?}",
                            column.name, column.column_type, changed.column_type
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
