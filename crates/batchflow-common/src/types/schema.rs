//! Ordered column schema

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::value::ColumnType;
use crate::error::{BatchError, Result};

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered list of uniquely named columns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schema {
    columns: Vec<Column>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let mut schema = Self::default();
        for column in columns {
            schema.push(column)?;
        }
        Ok(schema)
    }

    /// Append a column at the end
    pub fn push(&mut self, column: Column) -> Result<()> {
        if self.positions.contains_key(&column.name) {
            return Err(BatchError::DuplicateColumn(column.name));
        }
        self.positions.insert(column.name.clone(), self.columns.len());
        self.columns.push(column);
        Ok(())
    }

    /// Remove a column, returning its former position
    pub fn remove(&mut self, name: &str) -> Result<usize> {
        let index = self.require(name)?;
        self.columns.remove(index);
        self.reindex();
        Ok(index)
    }

    /// Rename a column in place
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> Result<()> {
        let to = to.into();
        let index = self.require(from)?;
        if from == to {
            return Ok(());
        }
        if self.positions.contains_key(&to) {
            return Err(BatchError::DuplicateColumn(to));
        }
        self.columns[index].name = to;
        self.reindex();
        Ok(())
    }

    pub fn set_type(&mut self, name: &str, column_type: ColumnType) -> Result<()> {
        let index = self.require(name)?;
        self.columns[index].column_type = column_type;
        Ok(())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Position of a column, or `UnknownColumn`
    pub fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| BatchError::UnknownColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn reindex(&mut self) {
        self.positions = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            columns: Vec<Column>,
        }

        let raw = Raw::deserialize(deserializer)?;
        Schema::new(raw.columns).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("name", ColumnType::String),
            Column::new("amount", ColumnType::Float),
        ])
        .unwrap()
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = Schema::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("id", ColumnType::String),
        ])
        .unwrap_err();
        assert_eq!(err, BatchError::DuplicateColumn("id".into()));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut schema = sample();
        assert_eq!(schema.remove("name").unwrap(), 1);
        assert_eq!(schema.names(), vec!["id", "amount"]);
        assert_eq!(schema.index_of("amount"), Some(1));
    }

    #[test]
    fn test_rename_collision() {
        let mut schema = sample();
        assert!(schema.rename("name", "id").is_err());
        schema.rename("name", "customer").unwrap();
        assert_eq!(schema.index_of("customer"), Some(1));
        assert!(!schema.contains("name"));
    }

    #[test]
    fn test_serde_round_trip_rebuilds_positions() {
        let json = serde_json::to_string(&sample()).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("amount"), Some(2));
    }
}
