//! Data quality metrics
//!
//! Each job may declare metrics to compute after loading, over either the
//! loaded batch or the whole target table. Every metric has a warn and a
//! fail threshold and a direction: for `null_rate` and `row_count_delta`
//! higher values are worse, for `uniqueness` and `range_compliance` lower
//! values are worse. Results are appended to the metrics table; a `fail` only
//! fails the job when the job's quality block is `blocking`.

use batchflow_common::{TabularBatch, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{EtlError, EtlResult};

/// Quality block of a job descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualitySpec {
    /// A `fail` result fails the job
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub scope: QualityScope,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

/// What the metrics are computed over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityScope {
    #[default]
    Batch,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HigherIsWorse,
    LowerIsWorse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    NullRate { column: String },
    Uniqueness { column: String },
    RangeCompliance {
        column: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    RowCountDelta,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::NullRate { .. } => "null_rate",
            MetricKind::Uniqueness { .. } => "uniqueness",
            MetricKind::RangeCompliance { .. } => "range_compliance",
            MetricKind::RowCountDelta => "row_count_delta",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            MetricKind::NullRate { .. } | MetricKind::RowCountDelta => Direction::HigherIsWorse,
            MetricKind::Uniqueness { .. } | MetricKind::RangeCompliance { .. } => {
                Direction::LowerIsWorse
            },
        }
    }

    fn column(&self) -> Option<&str> {
        match self {
            MetricKind::NullRate { column }
            | MetricKind::Uniqueness { column }
            | MetricKind::RangeCompliance { column, .. } => Some(column),
            MetricKind::RowCountDelta => None,
        }
    }

    /// Stored metric name, e.g. `null_rate.email`
    pub fn metric_name(&self) -> String {
        match self.column() {
            Some(column) => format!("{}.{}", self.as_str(), column),
            None => self.as_str().to_string(),
        }
    }
}

/// One configured metric with its thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMetricSpec", into = "RawMetricSpec")]
pub struct MetricSpec {
    pub kind: MetricKind,
    pub warn: f64,
    pub fail: f64,
}

/// Flat wire form: `{ metric: null_rate, column: email, warn: 0.05, fail: 0.2 }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMetricSpec {
    metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    warn: f64,
    fail: f64,
}

impl TryFrom<RawMetricSpec> for MetricSpec {
    type Error = String;

    fn try_from(raw: RawMetricSpec) -> Result<Self, Self::Error> {
        let needs_column = |column: Option<String>| {
            column.ok_or_else(|| format!("metric '{}' requires a column", raw.metric))
        };
        let no_bounds = raw.min.is_none() && raw.max.is_none();

        let kind = match raw.metric.as_str() {
            "null_rate" if no_bounds => MetricKind::NullRate {
                column: needs_column(raw.column.clone())?,
            },
            "uniqueness" if no_bounds => MetricKind::Uniqueness {
                column: needs_column(raw.column.clone())?,
            },
            "range_compliance" => {
                if no_bounds {
                    return Err("range_compliance needs min, max or both".to_string());
                }
                MetricKind::RangeCompliance {
                    column: needs_column(raw.column.clone())?,
                    min: raw.min,
                    max: raw.max,
                }
            },
            "row_count_delta" if no_bounds && raw.column.is_none() => MetricKind::RowCountDelta,
            "null_rate" | "uniqueness" | "row_count_delta" => {
                return Err(format!("metric '{}' does not take these fields", raw.metric));
            },
            other => return Err(format!("unknown metric '{}'", other)),
        };

        Ok(MetricSpec {
            kind,
            warn: raw.warn,
            fail: raw.fail,
        })
    }
}

impl From<MetricSpec> for RawMetricSpec {
    fn from(spec: MetricSpec) -> Self {
        let (min, max) = match &spec.kind {
            MetricKind::RangeCompliance { min, max, .. } => (*min, *max),
            _ => (None, None),
        };
        RawMetricSpec {
            metric: spec.kind.as_str().to_string(),
            column: spec.kind.column().map(str::to_string),
            min,
            max,
            warn: spec.warn,
            fail: spec.fail,
        }
    }
}

impl MetricSpec {
    pub fn new(kind: MetricKind, warn: f64, fail: f64) -> Self {
        Self { kind, warn, fail }
    }

    /// Threshold sanity: finite, ordered by direction, ratios within [0, 1]
    pub fn validate(&self) -> Result<(), String> {
        if !self.warn.is_finite() || !self.fail.is_finite() {
            return Err("thresholds must be finite numbers".to_string());
        }
        let is_ratio = !matches!(self.kind, MetricKind::RowCountDelta);
        let unit = 0.0..=1.0;
        if is_ratio && !(unit.contains(&self.warn) && unit.contains(&self.fail)) {
            return Err(format!("{} thresholds must be within [0, 1]", self.kind.as_str()));
        }
        if self.warn < 0.0 || self.fail < 0.0 {
            return Err("thresholds must not be negative".to_string());
        }
        match self.kind.direction() {
            Direction::HigherIsWorse if self.warn > self.fail => Err(format!(
                "{}: warn ({}) must not exceed fail ({})",
                self.kind.as_str(),
                self.warn,
                self.fail
            )),
            Direction::LowerIsWorse if self.warn < self.fail => Err(format!(
                "{}: warn ({}) must not be below fail ({})",
                self.kind.as_str(),
                self.warn,
                self.fail
            )),
            _ => Ok(()),
        }
    }

    pub fn classify(&self, value: f64) -> MetricStatus {
        match self.kind.direction() {
            Direction::HigherIsWorse if value > self.fail => MetricStatus::Fail,
            Direction::HigherIsWorse if value > self.warn => MetricStatus::Warn,
            Direction::LowerIsWorse if value < self.fail => MetricStatus::Fail,
            Direction::LowerIsWorse if value < self.warn => MetricStatus::Warn,
            _ => MetricStatus::Pass,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Pass,
    Warn,
    Fail,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Pass => "pass",
            MetricStatus::Warn => "warn",
            MetricStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MetricStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "warn" => MetricStatus::Warn,
            "fail" => MetricStatus::Fail,
            _ => MetricStatus::Pass,
        }
    }
}

/// One measured metric, append-only once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub metric_id: Uuid,
    pub run_id: Option<Uuid>,
    pub table_name: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold_value: f64,
    pub status: MetricStatus,
    pub measured_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Inputs that do not come from the subject batch itself
#[derive(Debug, Clone, Default)]
pub struct QualityContext {
    pub run_id: Option<Uuid>,
    /// Row count of the target table after this load
    pub current_table_rows: Option<u64>,
    /// Row count recorded by the previous successful run on the same table
    pub previous_table_rows: Option<u64>,
}

/// Compute every metric over `subject`
pub fn evaluate(
    table_name: &str,
    subject: &TabularBatch,
    specs: &[MetricSpec],
    context: &QualityContext,
) -> EtlResult<Vec<QualityMetric>> {
    specs
        .iter()
        .map(|spec| {
            let (value, mut details) = measure(&spec.kind, subject, context)?;
            let status = spec.classify(value);
            if let Some(map) = details.as_object_mut() {
                map.insert("warn_threshold".into(), spec.warn.into());
                map.insert("fail_threshold".into(), spec.fail.into());
                map.insert("direction".into(), direction_label(spec.kind.direction()).into());
            }
            Ok(QualityMetric {
                metric_id: Uuid::new_v4(),
                run_id: context.run_id,
                table_name: table_name.to_string(),
                metric_name: spec.kind.metric_name(),
                metric_value: value,
                threshold_value: spec.fail,
                status,
                measured_at: Utc::now(),
                details,
            })
        })
        .collect()
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::HigherIsWorse => "higher_is_worse",
        Direction::LowerIsWorse => "lower_is_worse",
    }
}

fn column_values<'a>(subject: &'a TabularBatch, column: &str) -> EtlResult<Vec<&'a Value>> {
    let values = subject.column_values(column).map_err(|_| {
        EtlError::schema(format!("quality metric references unknown column '{}'", column))
    })?;
    Ok(values.collect())
}

fn ratio(numerator: usize, denominator: usize, empty: f64) -> f64 {
    if denominator == 0 {
        empty
    } else {
        numerator as f64 / denominator as f64
    }
}

fn measure(
    kind: &MetricKind,
    subject: &TabularBatch,
    context: &QualityContext,
) -> EtlResult<(f64, serde_json::Value)> {
    let measured = match kind {
        MetricKind::NullRate { column } => {
            let values = column_values(subject, column)?;
            let nulls = values.iter().filter(|v| v.is_null()).count();
            (
                ratio(nulls, values.len(), 0.0),
                serde_json::json!({ "null_count": nulls, "row_count": values.len() }),
            )
        },
        MetricKind::Uniqueness { column } => {
            let values = column_values(subject, column)?;
            let present: Vec<&Value> = values.into_iter().filter(|v| !v.is_null()).collect();
            let distinct: HashSet<&Value> = present.iter().copied().collect();
            (
                ratio(distinct.len(), present.len(), 1.0),
                serde_json::json!({ "distinct_count": distinct.len(), "non_null_count": present.len() }),
            )
        },
        MetricKind::RangeCompliance { column, min, max } => {
            let values = column_values(subject, column)?;
            let present: Vec<&Value> = values.into_iter().filter(|v| !v.is_null()).collect();
            let in_range = present
                .iter()
                .filter(|v| {
                    v.as_f64().is_some_and(|x| {
                        min.map_or(true, |m| x >= m) && max.map_or(true, |m| x <= m)
                    })
                })
                .count();
            (
                ratio(in_range, present.len(), 1.0),
                serde_json::json!({
                    "in_range_count": in_range,
                    "non_null_count": present.len(),
                    "min": min,
                    "max": max,
                }),
            )
        },
        MetricKind::RowCountDelta => {
            let current = context
                .current_table_rows
                .unwrap_or(subject.len() as u64);
            match context.previous_table_rows {
                None => (
                    0.0,
                    serde_json::json!({ "current_rows": current, "baseline": "no baseline" }),
                ),
                Some(0) => (
                    if current == 0 { 0.0 } else { 1.0 },
                    serde_json::json!({ "current_rows": current, "previous_rows": 0 }),
                ),
                Some(previous) => (
                    current.abs_diff(previous) as f64 / previous as f64,
                    serde_json::json!({ "current_rows": current, "previous_rows": previous }),
                ),
            }
        },
    };
    Ok(measured)
}

/// Counts per status, stored in run metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
}

impl QualitySummary {
    pub fn of(metrics: &[QualityMetric]) -> Self {
        metrics.iter().fold(Self::default(), |mut acc, m| {
            match m.status {
                MetricStatus::Pass => acc.passed += 1,
                MetricStatus::Warn => acc.warned += 1,
                MetricStatus::Fail => acc.failed += 1,
            }
            acc
        })
    }
}

/// Message describing every failed metric, if any
pub fn failure_message(metrics: &[QualityMetric]) -> Option<String> {
    let failed: Vec<String> = metrics
        .iter()
        .filter(|m| m.status == MetricStatus::Fail)
        .map(|m| {
            format!(
                "{} on {} = {:.4} (fail threshold {})",
                m.metric_name, m.table_name, m.metric_value, m.threshold_value
            )
        })
        .collect();
    (!failed.is_empty()).then(|| failed.join("; "))
}
