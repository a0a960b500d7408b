//! Schema negotiation between inferred and declared column types

use batchflow_common::{Column, ColumnType, TabularBatch, Value};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{EtlError, EtlResult};

/// Convert every value of `column` to `to`, updating the declared type.
///
/// Nulls stay null. The first value that cannot be converted fails the
/// whole column with a schema error naming the row.
pub fn coerce_column(batch: &mut TabularBatch, column: &str, to: ColumnType) -> EtlResult<()> {
    let index = batch.column_index(column)?;
    let values = batch
        .rows()
        .iter()
        .enumerate()
        .map(|(row, values)| {
            values[index].coerce(to).map_err(|e| {
                EtlError::schema(format!("column '{}' row {}: {}", column, row, e))
            })
        })
        .collect::<EtlResult<Vec<Value>>>()?;

    batch.replace_column(column, to, values)?;
    Ok(())
}

/// Merge the inferred schema with `type_mapping` overrides into one
/// authoritative schema.
///
/// A mapped column missing from a batch with rows is a schema error. An
/// empty batch gains the mapped column as all-null so that downstream
/// steps see the declared shape.
pub fn negotiate(
    mut batch: TabularBatch,
    type_mapping: &IndexMap<String, ColumnType>,
) -> EtlResult<TabularBatch> {
    for (column, declared) in type_mapping {
        match batch.schema().column(column).map(|c| c.column_type) {
            Some(inferred) if inferred == *declared => {},
            Some(inferred) => {
                debug!(column = %column, from = %inferred, to = %declared, "Applying type override");
                coerce_column(&mut batch, column, *declared)?;
            },
            None if batch.is_empty() => {
                batch.add_column(Column::new(column.clone(), *declared), Vec::new())?;
            },
            None => {
                return Err(EtlError::schema(format!(
                    "type_mapping names column '{}' which the source did not produce",
                    column
                )));
            },
        }
    }
    Ok(batch)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use batchflow_common::Schema;

    fn batch() -> TabularBatch {
        let schema = Schema::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("price", ColumnType::String),
        ])
        .unwrap();
        TabularBatch::from_rows(
            schema,
            vec![
                vec![Value::Int(1), Value::from("9.99")],
                vec![Value::Int(2), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_override_applied() {
        let mapping = IndexMap::from([
            ("price".to_string(), ColumnType::Float),
            ("id".to_string(), ColumnType::String),
        ]);
        let out = negotiate(batch(), &mapping).unwrap();
        assert_eq!(out.schema().column("price").unwrap().column_type, ColumnType::Float);
        assert_eq!(out.rows()[0], vec![Value::from("1"), Value::Float(9.99)]);
        assert_eq!(out.rows()[1][1], Value::Null);
    }

    #[test]
    fn test_unconvertible_value_is_schema_error() {
        let mapping = IndexMap::from([("price".to_string(), ColumnType::Int)]);
        let err = negotiate(batch(), &mapping).unwrap_err();
        assert!(matches!(err, EtlError::Schema(_)));
        assert!(err.to_string().contains("row 0"));
    }

    #[test]
    fn test_missing_column() {
        let mapping = IndexMap::from([("region".to_string(), ColumnType::String)]);
        assert!(negotiate(batch(), &mapping).is_err());

        let empty = TabularBatch::new(Schema::default());
        let out = negotiate(empty, &mapping).unwrap();
        assert_eq!(out.schema().names(), vec!["region"]);
    }
}
