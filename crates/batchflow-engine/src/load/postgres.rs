//! PostgreSQL table store

use async_trait::async_trait;
use batchflow_common::{Column, ColumnType, Schema, TabularBatch, Value};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use super::{ChunkWrite, TableStore, WriteMode};
use crate::error::{EtlError, EtlResult};

/// Writes chunks into pre-provisioned Postgres tables, one transaction per
/// chunk
#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn describe(&self, table: &str) -> EtlResult<Vec<Column>> {
        let (namespace, name) = split_table(table);
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1, current_schema())
              AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(namespace)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(EtlError::schema(format!("target table {} does not exist", table)));
        }

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("column_name")?;
                let data_type: String = row.try_get("data_type")?;
                Ok(Column::new(name, column_type_for(&data_type)))
            })
            .collect()
    }
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, table),
    }
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn quote_table(table: &str) -> String {
    table.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn column_type_for(data_type: &str) -> ColumnType {
    match data_type {
        "smallint" | "integer" | "bigint" => ColumnType::Int,
        "real" | "double precision" | "numeric" => ColumnType::Float,
        "boolean" => ColumnType::Bool,
        "date" => ColumnType::Date,
        t if t.starts_with("timestamp") => ColumnType::Timestamp,
        _ => ColumnType::String,
    }
}

fn select_cast(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int => "bigint",
        ColumnType::Float => "double precision",
        ColumnType::Bool => "boolean",
        ColumnType::Date => "date",
        ColumnType::Timestamp => "timestamp",
        ColumnType::String => "text",
    }
}

fn push_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value, declared: ColumnType) {
    match value {
        Value::Null => match declared {
            ColumnType::Int => b.push_bind(None::<i64>),
            ColumnType::Float => b.push_bind(None::<f64>),
            ColumnType::Bool => b.push_bind(None::<bool>),
            ColumnType::Date => b.push_bind(None::<NaiveDate>),
            ColumnType::Timestamp => b.push_bind(None::<NaiveDateTime>),
            ColumnType::String => b.push_bind(None::<String>),
        },
        Value::String(s) => b.push_bind(s.clone()),
        Value::Int(i) => b.push_bind(*i),
        Value::Float(f) => b.push_bind(*f),
        Value::Bool(v) => b.push_bind(*v),
        Value::Date(d) => b.push_bind(*d),
        Value::Timestamp(ts) => b.push_bind(*ts),
    };
}

fn decode(row: &PgRow, index: usize, column_type: ColumnType) -> Result<Value, sqlx::Error> {
    let value = match column_type {
        ColumnType::Int => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        ColumnType::Float => row.try_get::<Option<f64>, _>(index)?.map(Value::Float),
        ColumnType::Bool => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        ColumnType::Date => row.try_get::<Option<NaiveDate>, _>(index)?.map(Value::Date),
        ColumnType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(Value::Timestamp),
        ColumnType::String => row.try_get::<Option<String>, _>(index)?.map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn target_columns(&self, table: &str, _schema: &Schema) -> EtlResult<Vec<String>> {
        Ok(self.describe(table).await?.into_iter().map(|c| c.name).collect())
    }

    async fn write_chunk(&self, chunk: ChunkWrite<'_>) -> EtlResult<u64> {
        let table = quote_table(chunk.table);
        let mut tx = self.pool.begin().await?;

        if chunk.mode == WriteMode::ReplaceThenInsert {
            let deleted = sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(table = chunk.table, deleted, "Cleared table for replace");
        }

        if !chunk.rows.is_empty() {
            let columns = chunk.schema.columns();
            let column_list = columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ");

            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, column_list));
            query_builder.push_values(chunk.rows, |mut b, row| {
                for (value, column) in row.iter().zip(columns) {
                    push_value(&mut b, value, column.column_type);
                }
            });

            if let WriteMode::Upsert { conflict_key } = chunk.mode {
                let keys = conflict_key
                    .iter()
                    .map(|k| quote_ident(k))
                    .collect::<Vec<_>>()
                    .join(", ");
                let updates = columns
                    .iter()
                    .filter(|c| !conflict_key.contains(&c.name))
                    .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
                    .collect::<Vec<_>>();
                if updates.is_empty() {
                    query_builder.push(format!(" ON CONFLICT ({}) DO NOTHING", keys));
                } else {
                    query_builder.push(format!(
                        " ON CONFLICT ({}) DO UPDATE SET {}",
                        keys,
                        updates.join(", ")
                    ));
                }
            }

            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(chunk.rows.len() as u64)
    }

    async fn row_count(&self, table: &str) -> EtlResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_table(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_table(&self, table: &str) -> EtlResult<TabularBatch> {
        let columns = self.describe(table).await?;
        let select_list = columns
            .iter()
            .map(|c| format!("{}::{}", quote_ident(&c.name), select_cast(c.column_type)))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!("SELECT {} FROM {}", select_list, quote_table(table)))
            .fetch_all(&self.pool)
            .await?;

        let schema = Schema::new(columns)?;
        let mut batch = TabularBatch::new(schema.clone());
        for row in &rows {
            let values = schema
                .columns()
                .iter()
                .enumerate()
                .map(|(i, c)| decode(row, i, c.column_type))
                .collect::<Result<Vec<_>, _>>()?;
            batch.push_row(values)?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_table("analytics.orders"), "\"analytics\".\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_information_schema_types() {
        assert_eq!(column_type_for("bigint"), ColumnType::Int);
        assert_eq!(column_type_for("numeric"), ColumnType::Float);
        assert_eq!(column_type_for("timestamp with time zone"), ColumnType::Timestamp);
        assert_eq!(column_type_for("character varying"), ColumnType::String);
        assert_eq!(split_table("orders"), (None, "orders"));
    }
}
