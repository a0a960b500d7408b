use batchflow_common::{BatchError, Column, ColumnType, Row, Schema, TabularBatch, Value};
use chrono::Datelike;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{
    AggregateFunction, Aggregation, DatePart, Encoding, FillStrategy, NamingConvention, Predicate,
    TransformStep,
};
use crate::schema::coerce_column;

/// Warnings produced by a step: message and affected count
type Notes = Vec<(String, usize)>;

type StepResult = Result<(TabularBatch, Notes), String>;

pub(super) fn apply_step(step: &TransformStep, batch: TabularBatch) -> StepResult {
    match step {
        TransformStep::Deduplicate { columns } => deduplicate(batch, columns.as_deref()),
        TransformStep::FillMissing { column, strategy } => fill_missing(batch, column, strategy),
        TransformStep::DropMissing { columns } => drop_missing(batch, columns.as_deref()),
        TransformStep::DropSparseColumns { max_missing_ratio } => {
            drop_sparse_columns(batch, *max_missing_ratio)
        },
        TransformStep::DropColumns { columns } => drop_columns(batch, columns),
        TransformStep::Coerce { column, to } => {
            let mut batch = batch;
            coerce_column(&mut batch, column, *to).map_err(|e| e.to_string())?;
            Ok((batch, Vec::new()))
        },
        TransformStep::Filter { column, predicate } => filter(batch, column, predicate),
        TransformStep::DeriveDatePart {
            source,
            part,
            target,
        } => derive_date_part(batch, source, *part, target),
        TransformStep::EncodeCategorical {
            column,
            encoding,
            prefix,
        } => encode_categorical(batch, column, *encoding, prefix.as_deref()),
        TransformStep::StandardizeColumns { convention } => standardize_columns(batch, *convention),
        TransformStep::Aggregate {
            group_by,
            aggregations,
        } => aggregate(batch, group_by, aggregations),
    }
}

fn err(e: BatchError) -> String {
    e.to_string()
}

fn indices(batch: &TabularBatch, columns: Option<&[String]>) -> Result<Vec<usize>, String> {
    match columns {
        Some(names) => names
            .iter()
            .map(|name| batch.column_index(name).map_err(err))
            .collect(),
        None => Ok((0..batch.schema().len()).collect()),
    }
}

fn removed_rows(count: usize) -> Notes {
    if count == 0 {
        Vec::new()
    } else {
        vec![(format!("{} rows removed", count), count)]
    }
}

fn deduplicate(mut batch: TabularBatch, columns: Option<&[String]>) -> StepResult {
    let key_columns = indices(&batch, columns)?;
    let mut seen: HashSet<Vec<Value>> = HashSet::with_capacity(batch.len());
    let removed = batch.retain_rows(|row| {
        let key: Vec<Value> = key_columns.iter().map(|&i| row[i].clone()).collect();
        seen.insert(key)
    });
    Ok((batch, removed_rows(removed)))
}

fn fill_missing(mut batch: TabularBatch, column: &str, strategy: &FillStrategy) -> StepResult {
    let index = batch.column_index(column).map_err(err)?;
    let column_type = batch.schema().columns()[index].column_type;
    let present: Vec<&Value> = batch
        .rows()
        .iter()
        .map(|row| &row[index])
        .filter(|v| !v.is_null())
        .collect();

    let fill = match strategy {
        FillStrategy::Value(json) => Some(Value::from_json_as(json, column_type).map_err(err)?),
        FillStrategy::Mean | FillStrategy::Median => {
            if !column_type.is_numeric() {
                return Err(format!(
                    "{:?} fill needs a numeric column, '{}' is {}",
                    strategy, column, column_type
                ));
            }
            let mut numbers: Vec<f64> = present.iter().filter_map(|v| v.as_f64()).collect();
            let stat = if matches!(strategy, FillStrategy::Mean) {
                mean(&numbers)
            } else {
                median(&mut numbers)
            };
            stat.map(|x| match column_type {
                ColumnType::Int => Value::Int(x.round() as i64),
                _ => Value::Float(x),
            })
        },
        FillStrategy::Mode => mode(&present),
    };

    let Some(fill) = fill else {
        let nulls = batch.len() - present.len();
        let notes = if nulls > 0 {
            vec![(
                format!("no non-null values in '{}' to derive a fill value; nulls kept", column),
                nulls,
            )]
        } else {
            Vec::new()
        };
        return Ok((batch, notes));
    };

    let mut filled = 0;
    let values = batch
        .rows()
        .iter()
        .map(|row| {
            if row[index].is_null() {
                filled += 1;
                fill.clone()
            } else {
                row[index].clone()
            }
        })
        .collect();
    batch
        .replace_column(column, column_type, values)
        .map_err(err)?;

    let notes = if filled > 0 {
        vec![(format!("{} values defaulted in '{}'", filled, column), filled)]
    } else {
        Vec::new()
    };
    Ok((batch, notes))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Most frequent value; ties go to the value seen first
fn mode(values: &[&Value]) -> Option<Value> {
    let mut counts: IndexMap<&Value, usize> = IndexMap::new();
    for value in values {
        *counts.entry(*value).or_insert(0) += 1;
    }
    let mut best: Option<(&Value, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(v, _)| v.clone())
}

fn drop_missing(mut batch: TabularBatch, columns: Option<&[String]>) -> StepResult {
    let checked = indices(&batch, columns)?;
    let removed = batch.retain_rows(|row| checked.iter().all(|&i| !row[i].is_null()));
    Ok((batch, removed_rows(removed)))
}

fn drop_sparse_columns(mut batch: TabularBatch, max_missing_ratio: f64) -> StepResult {
    if batch.is_empty() {
        return Ok((batch, Vec::new()));
    }

    let rows = batch.len() as f64;
    let sparse: Vec<String> = batch
        .schema()
        .columns()
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            let nulls = batch.rows().iter().filter(|row| row[*i].is_null()).count();
            nulls as f64 / rows > max_missing_ratio
        })
        .map(|(_, c)| c.name.clone())
        .collect();

    for name in &sparse {
        batch.drop_column(name).map_err(err)?;
    }

    let notes = if sparse.is_empty() {
        Vec::new()
    } else {
        vec![(
            format!("{} sparse columns removed: {}", sparse.len(), sparse.join(", ")),
            sparse.len(),
        )]
    };
    Ok((batch, notes))
}

fn drop_columns(mut batch: TabularBatch, columns: &[String]) -> StepResult {
    for name in columns {
        batch.drop_column(name).map_err(err)?;
    }
    Ok((
        batch,
        vec![(
            format!("{} columns removed: {}", columns.len(), columns.join(", ")),
            columns.len(),
        )],
    ))
}

fn filter(mut batch: TabularBatch, column: &str, predicate: &Predicate) -> StepResult {
    let index = batch.column_index(column).map_err(err)?;
    let column_type = batch.schema().columns()[index].column_type;
    // Numeric bounds stay as written; compare() orders int against float
    let bound = |json: &serde_json::Value| match json {
        serde_json::Value::Number(_) if column_type.is_numeric() => Ok(Value::from_json(json)),
        _ => Value::from_json_as(json, column_type).map_err(err),
    };
    let same = |cell: &Value, expected: &Value| cell.compare(expected).is_some_and(|o| o.is_eq());

    let removed = match predicate {
        Predicate::Range { min, max } => {
            let min = min.as_ref().map(bound).transpose()?;
            let max = max.as_ref().map(bound).transpose()?;
            batch.retain_rows(|row| {
                let value = &row[index];
                let above = min
                    .as_ref()
                    .map_or(true, |m| value.compare(m).is_some_and(|o| o.is_ge()));
                let below = max
                    .as_ref()
                    .map_or(true, |m| value.compare(m).is_some_and(|o| o.is_le()));
                !value.is_null() && above && below
            })
        },
        Predicate::Equals { value } => {
            let expected = bound(value)?;
            batch.retain_rows(|row| same(&row[index], &expected))
        },
        Predicate::OneOf { values } | Predicate::NotOneOf { values } => {
            let members = values.iter().map(bound).collect::<Result<Vec<Value>, String>>()?;
            let keep_members = matches!(predicate, Predicate::OneOf { .. });
            batch.retain_rows(|row| {
                let cell = &row[index];
                !cell.is_null() && members.iter().any(|m| same(cell, m)) == keep_members
            })
        },
    };

    Ok((batch, removed_rows(removed)))
}

fn derive_date_part(mut batch: TabularBatch, source: &str, part: DatePart, target: &str) -> StepResult {
    let index = batch.column_index(source).map_err(err)?;
    let column_type = batch.schema().columns()[index].column_type;
    if !column_type.is_temporal() {
        return Err(format!(
            "column '{}' is {}, expected date or timestamp",
            source, column_type
        ));
    }

    let values = batch
        .rows()
        .iter()
        .map(|row| {
            let date = match &row[index] {
                Value::Date(d) => Some(*d),
                Value::Timestamp(ts) => Some(ts.date()),
                _ => None,
            };
            date.map_or(Value::Null, |d| {
                Value::Int(match part {
                    DatePart::Year => i64::from(d.year()),
                    DatePart::Month => i64::from(d.month()),
                    DatePart::Day => i64::from(d.day()),
                    DatePart::Weekday => i64::from(d.weekday().num_days_from_monday()),
                })
            })
        })
        .collect();

    batch
        .add_column(Column::new(target, ColumnType::Int), values)
        .map_err(err)?;
    Ok((batch, Vec::new()))
}

fn encode_categorical(
    mut batch: TabularBatch,
    column: &str,
    encoding: Encoding,
    prefix: Option<&str>,
) -> StepResult {
    let index = batch.column_index(column).map_err(err)?;
    let categories: BTreeSet<String> = batch
        .rows()
        .iter()
        .map(|row| &row[index])
        .filter(|v| !v.is_null())
        .map(|v| v.to_string())
        .collect();

    match encoding {
        Encoding::OneHot => {
            let prefix = prefix.unwrap_or(column);
            for category in &categories {
                let values = batch
                    .rows()
                    .iter()
                    .map(|row| Value::Bool(!row[index].is_null() && row[index].to_string() == *category))
                    .collect();
                batch
                    .add_column(
                        Column::new(format!("{}_{}", prefix, category), ColumnType::Bool),
                        values,
                    )
                    .map_err(err)?;
            }
        },
        Encoding::Ordinal => {
            let codes: HashMap<&String, i64> = categories
                .iter()
                .enumerate()
                .map(|(code, category)| (category, code as i64))
                .collect();
            let values = batch
                .rows()
                .iter()
                .map(|row| {
                    if row[index].is_null() {
                        Value::Null
                    } else {
                        codes
                            .get(&row[index].to_string())
                            .map_or(Value::Null, |code| Value::Int(*code))
                    }
                })
                .collect();
            batch
                .replace_column(column, ColumnType::Int, values)
                .map_err(err)?;
        },
    }

    Ok((batch, Vec::new()))
}

pub(crate) fn standardize_name(name: &str, convention: NamingConvention) -> String {
    match convention {
        NamingConvention::SnakeCase => {
            let replaced: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect();
            replaced.to_lowercase().trim_matches('_').to_string()
        },
        NamingConvention::Lower => name.trim().to_lowercase(),
        NamingConvention::Upper => name.trim().to_uppercase(),
    }
}

fn standardize_columns(mut batch: TabularBatch, convention: NamingConvention) -> StepResult {
    let renames: Vec<(String, String)> = batch
        .schema()
        .names()
        .into_iter()
        .map(|name| (name.to_string(), standardize_name(name, convention)))
        .collect();

    let mut targets = HashSet::new();
    for (from, to) in &renames {
        if to.is_empty() {
            return Err(format!("column '{}' has no usable characters", from));
        }
        if !targets.insert(to.as_str()) {
            return Err(format!("columns collide after renaming: '{}'", to));
        }
    }

    // Rebuild the schema in one pass so that swaps like a->b, b->a never collide midway
    let (schema, rows) = batch.into_parts();
    let columns = schema
        .columns()
        .iter()
        .zip(&renames)
        .map(|(col, (_, to))| Column::new(to.clone(), col.column_type))
        .collect();
    batch = TabularBatch::from_rows(Schema::new(columns).map_err(err)?, rows).map_err(err)?;

    Ok((batch, Vec::new()))
}

#[derive(Default)]
struct Accumulator {
    count: i64,
    sum: f64,
    int_sum: i64,
    int_overflow: bool,
    min: Option<Value>,
    max: Option<Value>,
}

impl Accumulator {
    fn update(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        self.count += 1;
        if let Some(x) = value.as_f64() {
            self.sum += x;
        }
        if let Value::Int(i) = value {
            match self.int_sum.checked_add(*i) {
                Some(sum) => self.int_sum = sum,
                None => self.int_overflow = true,
            }
        }
        if self.min.as_ref().map_or(true, |m| value.compare(m).is_some_and(|o| o.is_lt())) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |m| value.compare(m).is_some_and(|o| o.is_gt())) {
            self.max = Some(value.clone());
        }
    }

    fn finish(&self, agg: &Aggregation, input: ColumnType) -> Result<Value, String> {
        let value = match agg.function {
            AggregateFunction::Count => Value::Int(self.count),
            AggregateFunction::Sum if input == ColumnType::Int && self.int_overflow => {
                return Err(format!(
                    "sum of '{}' overflows int; coerce it to float first",
                    agg.column
                ))
            },
            AggregateFunction::Sum if input == ColumnType::Int => Value::Int(self.int_sum),
            AggregateFunction::Sum => Value::Float(self.sum),
            AggregateFunction::Mean if self.count == 0 => Value::Null,
            AggregateFunction::Mean => Value::Float(self.sum / self.count as f64),
            AggregateFunction::Min => self.min.clone().unwrap_or(Value::Null),
            AggregateFunction::Max => self.max.clone().unwrap_or(Value::Null),
        };
        Ok(value)
    }
}

fn output_type(function: AggregateFunction, input: ColumnType) -> ColumnType {
    match function {
        AggregateFunction::Count => ColumnType::Int,
        AggregateFunction::Sum if input == ColumnType::Int => ColumnType::Int,
        AggregateFunction::Sum | AggregateFunction::Mean => ColumnType::Float,
        AggregateFunction::Min | AggregateFunction::Max => input,
    }
}

fn aggregate(batch: TabularBatch, group_by: &[String], aggregations: &[Aggregation]) -> StepResult {
    let key_indices = indices(&batch, Some(group_by))?;

    let mut inputs = Vec::with_capacity(aggregations.len());
    let mut columns: Vec<Column> = key_indices
        .iter()
        .map(|&i| batch.schema().columns()[i].clone())
        .collect();

    for agg in aggregations {
        let index = batch.column_index(&agg.column).map_err(err)?;
        let input = batch.schema().columns()[index].column_type;
        if matches!(agg.function, AggregateFunction::Sum | AggregateFunction::Mean)
            && !input.is_numeric()
        {
            return Err(format!(
                "{} needs a numeric column, '{}' is {}",
                agg.function.as_str(),
                agg.column,
                input
            ));
        }
        inputs.push((index, input));
        columns.push(Column::new(agg.output_name(), output_type(agg.function, input)));
    }
    let schema = Schema::new(columns).map_err(err)?;

    let mut groups: IndexMap<Vec<Value>, Vec<Accumulator>> = IndexMap::new();
    for row in batch.rows() {
        let key: Vec<Value> = key_indices.iter().map(|&i| row[i].clone()).collect();
        let accumulators = groups
            .entry(key)
            .or_insert_with(|| aggregations.iter().map(|_| Accumulator::default()).collect());
        for (acc, (index, _)) in accumulators.iter_mut().zip(&inputs) {
            acc.update(&row[*index]);
        }
    }

    let rows = groups
        .into_iter()
        .map(|(mut key, accumulators)| {
            for ((acc, agg), (_, input)) in accumulators.iter().zip(aggregations).zip(&inputs) {
                key.push(acc.finish(agg, *input)?);
            }
            Ok(key)
        })
        .collect::<Result<Vec<Row>, String>>()?;

    let dropped: Vec<&str> = batch
        .schema()
        .columns()
        .iter()
        .enumerate()
        .filter(|(i, _)| !key_indices.contains(i) && !inputs.iter().any(|(index, _)| index == i))
        .map(|(_, col)| col.name.as_str())
        .collect();

    let rows_in = batch.len();
    let out = TabularBatch::from_rows(schema, rows).map_err(err)?;
    let collapsed = rows_in - out.len();
    let mut notes = Vec::new();
    if collapsed > 0 {
        notes.push((format!("{} rows collapsed into {} groups", rows_in, out.len()), collapsed));
    }
    if !dropped.is_empty() {
        notes.push((
            format!("{} columns removed by aggregation: {}", dropped.len(), dropped.join(", ")),
            dropped.len(),
        ));
    }
    Ok((out, notes))
}
