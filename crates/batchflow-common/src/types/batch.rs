//! In-memory batch of rows sharing one schema

use indexmap::IndexMap;
use serde::Serialize;

use super::schema::{Column, Schema};
use super::value::{ColumnType, Value};
use crate::error::{BatchError, Result};

/// One row, positionally aligned with the batch schema
pub type Row = Vec<Value>;

/// Ordered rows that all have exactly the schema's column set.
///
/// Every mutation checks row width against the schema, so a batch can
/// never hold a ragged row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TabularBatch {
    schema: Schema,
    rows: Vec<Row>,
}

impl TabularBatch {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(schema: Schema, rows: Vec<Row>) -> Result<Self> {
        let mut batch = Self::new(schema);
        batch.rows.reserve(rows.len());
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Build a batch from JSON objects.
    ///
    /// Columns are the union of keys in first-seen order. Each column's type
    /// is the widened type of its non-null values; all-null columns are strings.
    pub fn from_json_records(
        records: &[serde_json::Map<String, serde_json::Value>],
    ) -> Result<Self> {
        let mut types: IndexMap<String, Option<ColumnType>> = IndexMap::new();
        for record in records {
            for (key, json) in record {
                let observed = Value::from_json(json).column_type();
                let slot = types.entry(key.clone()).or_insert(None);
                *slot = match (*slot, observed) {
                    (Some(a), Some(b)) => Some(a.widen(b)),
                    (a, b) => a.or(b),
                };
            }
        }

        let schema = Schema::new(
            types
                .iter()
                .map(|(name, ty)| Column::new(name.clone(), ty.unwrap_or(ColumnType::String)))
                .collect(),
        )?;

        let mut batch = Self::new(schema);
        batch.rows.reserve(records.len());
        for record in records {
            let row = batch
                .schema
                .columns()
                .iter()
                .map(|col| match record.get(&col.name) {
                    Some(json) => Value::from_json_as(json, col.column_type),
                    None => Ok(Value::Null),
                })
                .collect::<Result<Row>>()?;
            batch.rows.push(row);
        }
        Ok(batch)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.schema.require(name)
    }

    pub fn push_row(&mut self, row: Row) -> Result<()> {
        if row.len() != self.schema.len() {
            return Err(BatchError::RowWidth {
                expected: self.schema.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Values of one column in row order
    pub fn column_values(&self, name: &str) -> Result<impl Iterator<Item = &Value> + '_> {
        let index = self.column_index(name)?;
        Ok(self.rows.iter().map(move |row| &row[index]))
    }

    /// Append a column; `values` must have one entry per row
    pub fn add_column(&mut self, column: Column, values: Vec<Value>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(BatchError::RowWidth {
                expected: self.rows.len(),
                actual: values.len(),
            });
        }
        self.schema.push(column)?;
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Result<()> {
        let index = self.schema.remove(name)?;
        for row in &mut self.rows {
            row.remove(index);
        }
        Ok(())
    }

    pub fn rename_column(&mut self, from: &str, to: impl Into<String>) -> Result<()> {
        self.schema.rename(from, to)
    }

    /// Replace a column's values and declared type together
    pub fn replace_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        values: Vec<Value>,
    ) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(BatchError::RowWidth {
                expected: self.rows.len(),
                actual: values.len(),
            });
        }
        let index = self.column_index(name)?;
        self.schema.set_type(name, column_type)?;
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[index] = value;
        }
        Ok(())
    }

    /// Keep rows for which the predicate holds; returns the number removed
    pub fn retain_rows<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Row) -> bool,
    {
        let before = self.rows.len();
        self.rows.retain(|row| keep(row));
        before - self.rows.len()
    }

    /// Fixed-size row slices in order; the last may be shorter
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[Row]> + '_ {
        self.rows.chunks(size.max(1))
    }

    pub fn into_parts(self) -> (Schema, Vec<Row>) {
        (self.schema, self.rows)
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_json_records(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let map = self
                    .schema
                    .columns()
                    .iter()
                    .zip(row)
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(map)
            })
            .collect()
    }
}
