//! Declarative transformation pipeline
//!
//! A job's `transform_spec` is an ordered list of [`TransformStep`]s. Each
//! step consumes a [`TabularBatch`] and produces a new one. Steps that remove
//! rows, columns or replace values record a warning in the
//! [`TransformReport`]; steps that cannot proceed (an unknown column, a value
//! that cannot be coerced) halt the pipeline with a schema error naming the
//! step.

mod steps;

use batchflow_common::{ColumnType, TabularBatch};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EtlError, EtlResult};

/// One transformation, tagged by `op` in job files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum TransformStep {
    /// Keep the first occurrence of each row (or of each key over `columns`)
    Deduplicate {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    FillMissing {
        column: String,
        strategy: FillStrategy,
    },
    /// Drop rows holding a null in any of `columns` (all columns when unset)
    DropMissing {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    /// Drop columns whose null ratio exceeds `max_missing_ratio`
    DropSparseColumns { max_missing_ratio: f64 },
    DropColumns { columns: Vec<String> },
    Coerce { column: String, to: ColumnType },
    /// Keep rows whose value matches; nulls never match
    Filter { column: String, predicate: Predicate },
    DeriveDatePart {
        source: String,
        part: DatePart,
        target: String,
    },
    EncodeCategorical {
        column: String,
        encoding: Encoding,
        #[serde(default)]
        prefix: Option<String>,
    },
    StandardizeColumns { convention: NamingConvention },
    Aggregate {
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
}

/// How `fill_missing` picks a replacement value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    Value(serde_json::Value),
    Mean,
    Median,
    Mode,
}

/// Row predicate for `filter`. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Range {
        #[serde(default)]
        min: Option<serde_json::Value>,
        #[serde(default)]
        max: Option<serde_json::Value>,
    },
    Equals { value: serde_json::Value },
    OneOf { values: Vec<serde_json::Value> },
    NotOneOf { values: Vec<serde_json::Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Month,
    Day,
    /// Monday = 0
    Weekday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// One bool column per distinct value, named `{prefix}_{value}`
    OneHot,
    /// Integer codes assigned in sorted value order
    Ordinal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    SnakeCase,
    Lower,
    Upper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aggregation {
    pub column: String,
    pub function: AggregateFunction,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    /// Output column name: the alias, or `{column}_{function}`
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.column, self.function.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Mean => "mean",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

impl TransformStep {
    pub fn op_name(&self) -> &'static str {
        match self {
            TransformStep::Deduplicate { .. } => "deduplicate",
            TransformStep::FillMissing { .. } => "fill_missing",
            TransformStep::DropMissing { .. } => "drop_missing",
            TransformStep::DropSparseColumns { .. } => "drop_sparse_columns",
            TransformStep::DropColumns { .. } => "drop_columns",
            TransformStep::Coerce { .. } => "coerce",
            TransformStep::Filter { .. } => "filter",
            TransformStep::DeriveDatePart { .. } => "derive_date_part",
            TransformStep::EncodeCategorical { .. } => "encode_categorical",
            TransformStep::StandardizeColumns { .. } => "standardize_columns",
            TransformStep::Aggregate { .. } => "aggregate",
        }
    }

    /// Static checks that need no data
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TransformStep::DropSparseColumns { max_missing_ratio } => {
                if !(0.0..=1.0).contains(max_missing_ratio) {
                    return Err(format!(
                        "max_missing_ratio must be within [0, 1], got {}",
                        max_missing_ratio
                    ));
                }
            },
            TransformStep::DropColumns { columns } if columns.is_empty() => {
                return Err("columns must not be empty".to_string());
            },
            TransformStep::DeriveDatePart { target, .. } if target.trim().is_empty() => {
                return Err("target must not be empty".to_string());
            },
            TransformStep::Aggregate { aggregations, .. } if aggregations.is_empty() => {
                return Err("at least one aggregation is required".to_string());
            },
            TransformStep::Filter {
                predicate: Predicate::Range { min: None, max: None },
                ..
            } => {
                return Err("range predicate needs min, max or both".to_string());
            },
            _ => {},
        }
        Ok(())
    }
}

/// Soft violation recorded by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformWarning {
    pub step: usize,
    pub op: String,
    pub message: String,
    pub count: usize,
}

/// What a pipeline run did to the batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub steps_applied: usize,
    pub warnings: Vec<TransformWarning>,
}

#[derive(Debug)]
pub struct TransformOutcome {
    pub batch: TabularBatch,
    pub report: TransformReport,
}

/// Run `steps` over `batch` in order
pub fn apply(batch: TabularBatch, steps: &[TransformStep]) -> EtlResult<TransformOutcome> {
    let mut report = TransformReport {
        rows_in: batch.len(),
        ..Default::default()
    };
    let mut current = batch;

    for (index, step) in steps.iter().enumerate() {
        let op = step.op_name();
        let rows_before = current.len();

        let (next, notes) = steps::apply_step(step, current)
            .map_err(|e| EtlError::schema(format!("step {} ({}): {}", index, op, e)))?;

        for (message, count) in notes {
            warn!(step = index, op, count, "{}", message);
            report.warnings.push(TransformWarning {
                step: index,
                op: op.to_string(),
                message,
                count,
            });
        }

        debug!(step = index, op, rows_before, rows_after = next.len(), "Transform step applied");
        current = next;
        report.steps_applied += 1;
    }

    report.rows_out = current.len();
    Ok(TransformOutcome {
        batch: current,
        report,
    })
}
