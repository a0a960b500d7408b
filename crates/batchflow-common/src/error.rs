//! Error types for the tabular data model

use thiserror::Error;

use crate::types::ColumnType;

/// Result type alias for batch operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Violations of a batch's schema or row shape
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Row width mismatch: schema declares {expected} columns, row has {actual} values")]
    RowWidth { expected: usize, actual: usize },

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Cannot convert '{value}' to {target}")]
    Conversion { value: String, target: ColumnType },

    #[error("Invalid column type: {0}")]
    InvalidType(String),
}

impl BatchError {
    /// Create a conversion error for a raw value
    pub fn conversion(value: impl Into<String>, target: ColumnType) -> Self {
        Self::Conversion {
            value: value.into(),
            target,
        }
    }
}
