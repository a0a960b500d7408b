//! Cell values and column types

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{BatchError, Result};

/// Accepted date layouts, tried in order
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Accepted timestamp layouts, tried in order (fractional seconds optional)
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[serde(alias = "str", alias = "text")]
    String,
    #[serde(alias = "integer", alias = "int64")]
    Int,
    #[serde(alias = "double", alias = "number", alias = "float64")]
    Float,
    #[serde(alias = "boolean")]
    Bool,
    Date,
    #[serde(alias = "datetime")]
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Bool => "bool",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Timestamp)
    }

    /// Common supertype of two inferred types.
    ///
    /// `int` and `float` widen to `float`, `date` and `timestamp` widen to
    /// `timestamp`; every other disagreement widens to `string`.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;

        match (self, other) {
            (a, b) if a == b => a,
            (Int, Float) | (Float, Int) => Float,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            _ => String,
        }
    }

    /// Narrowest type a raw text cell fits, or `None` for an empty cell
    pub fn infer(raw: &str) -> Option<ColumnType> {
        let s = raw.trim();
        if s.is_empty() {
            return None;
        }

        let inferred = if s.parse::<i64>().is_ok() {
            ColumnType::Int
        } else if parse_float(s).is_some() {
            ColumnType::Float
        } else if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
            ColumnType::Bool
        } else if parse_date(s).is_some() {
            ColumnType::Date
        } else if parse_timestamp(s).is_some() {
            ColumnType::Timestamp
        } else {
            ColumnType::String
        };

        Some(inferred)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = BatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(ColumnType::String),
            "int" | "integer" | "int64" => Ok(ColumnType::Int),
            "float" | "double" | "number" | "float64" => Ok(ColumnType::Float),
            "bool" | "boolean" => Ok(ColumnType::Bool),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            other => Err(BatchError::InvalidType(other.to_string())),
        }
    }
}

/// A single cell
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type of a non-null value
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(ColumnType::String),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Parse a raw text cell as the given type. Empty cells become `Null`.
    pub fn parse_as(raw: &str, target: ColumnType) -> Result<Value> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(Value::Null);
        }

        let parsed = match target {
            ColumnType::String => Some(Value::String(raw.to_string())),
            ColumnType::Int => s.parse::<i64>().ok().map(Value::Int).or_else(|| {
                parse_float(s)
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Value::Int(f as i64))
            }),
            ColumnType::Float => parse_float(s).map(Value::Float),
            ColumnType::Bool => parse_bool(s).map(Value::Bool),
            ColumnType::Date => parse_date(s)
                .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
                .map(Value::Date),
            ColumnType::Timestamp => parse_timestamp(s)
                .or_else(|| parse_date(s).map(|d| d.and_time(NaiveTime::MIN)))
                .map(Value::Timestamp),
        };

        parsed.ok_or_else(|| BatchError::conversion(s, target))
    }

    /// Convert this value to another column type
    pub fn coerce(&self, target: ColumnType) -> Result<Value> {
        if self.column_type() == Some(target) {
            return Ok(self.clone());
        }

        match (self, target) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::String(s), _) => Value::parse_as(s, target),
            (_, ColumnType::String) => Ok(Value::String(self.to_string())),
            (Value::Int(i), ColumnType::Float) => Ok(Value::Float(*i as f64)),
            (Value::Float(f), ColumnType::Int) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(Value::Int(*f as i64))
            },
            (Value::Int(i), ColumnType::Bool) if *i == 0 || *i == 1 => Ok(Value::Bool(*i == 1)),
            (Value::Bool(b), ColumnType::Int) => Ok(Value::Int(i64::from(*b))),
            (Value::Bool(b), ColumnType::Float) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            (Value::Timestamp(ts), ColumnType::Date) => Ok(Value::Date(ts.date())),
            (Value::Date(d), ColumnType::Timestamp) => Ok(Value::Timestamp(d.and_time(NaiveTime::MIN))),
            _ => Err(BatchError::conversion(self.to_string(), target)),
        }
    }

    /// Value for a JSON scalar, inferring the type from the JSON kind.
    ///
    /// Nested arrays and objects are kept as their JSON text.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }

    /// Value for a JSON scalar converted to a declared column type
    pub fn from_json_as(json: &serde_json::Value, target: ColumnType) -> Result<Value> {
        Value::from_json(json).coerce(target)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Date(_) | Value::Timestamp(_) => serde_json::Value::String(self.to_string()),
        }
    }

    /// Ordering between comparable values; `None` across incompatible types.
    ///
    /// Numbers compare across int/float; `Null` is not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_bits(*a) == float_bits(*b),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {},
            Value::String(s) => s.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => float_bits(*f).hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Timestamp(ts) => ts.hash(state),
        }
    }
}

/// Cells serialize as plain JSON scalars, the shape `from_json` reads back.
/// Dates and timestamps are written as text; non-finite floats as null.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::String(s) => serializer.serialize_str(s),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Float(_) => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Date(_) | Value::Timestamp(_) => serializer.collect_str(self),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Canonical bit pattern so that `0.0 == -0.0` and every NaN hashes alike
fn float_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

fn parse_float(s: &str) -> Option<f64> {
    // Rejects "inf", "NaN" and similar words that f64::from_str accepts
    let numeric_chars = s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    if !numeric_chars || !s.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse::<f64>().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_widen() {
        assert_eq!(ColumnType::Int.widen(ColumnType::Int), ColumnType::Int);
        assert_eq!(ColumnType::Int.widen(ColumnType::Float), ColumnType::Float);
        assert_eq!(ColumnType::Date.widen(ColumnType::Timestamp), ColumnType::Timestamp);
        assert_eq!(ColumnType::Bool.widen(ColumnType::Int), ColumnType::String);
        assert_eq!(ColumnType::Float.widen(ColumnType::String), ColumnType::String);
    }

    #[test]
    fn test_infer() {
        assert_eq!(ColumnType::infer(""), None);
        assert_eq!(ColumnType::infer("  "), None);
        assert_eq!(ColumnType::infer("42"), Some(ColumnType::Int));
        assert_eq!(ColumnType::infer("-4.5"), Some(ColumnType::Float));
        assert_eq!(ColumnType::infer("1e3"), Some(ColumnType::Float));
        assert_eq!(ColumnType::infer("TRUE"), Some(ColumnType::Bool));
        assert_eq!(ColumnType::infer("2024-01-31"), Some(ColumnType::Date));
        assert_eq!(ColumnType::infer("2024-01-31 10:15:00"), Some(ColumnType::Timestamp));
        assert_eq!(ColumnType::infer("2024-01-31T10:15:00Z"), Some(ColumnType::Timestamp));
        assert_eq!(ColumnType::infer("nan"), Some(ColumnType::String));
        assert_eq!(ColumnType::infer("alice"), Some(ColumnType::String));
    }

    #[test]
    fn test_column_type_from_str() {
        assert_eq!("datetime".parse::<ColumnType>().unwrap(), ColumnType::Timestamp);
        assert_eq!("Integer".parse::<ColumnType>().unwrap(), ColumnType::Int);
        assert!("uuid".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_parse_as_rejects_text_in_numeric_column() {
        let err = Value::parse_as("abc", ColumnType::Int).unwrap_err();
        assert_eq!(err, BatchError::conversion("abc", ColumnType::Int));
        assert_eq!(Value::parse_as("", ColumnType::Int).unwrap(), Value::Null);
        assert_eq!(Value::parse_as("7.0", ColumnType::Int).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Value::Int(3).coerce(ColumnType::Float).unwrap(), Value::Float(3.0));
        assert_eq!(Value::Float(2.5).coerce(ColumnType::String).unwrap(), Value::from("2.5"));
        assert!(Value::Float(2.5).coerce(ColumnType::Int).is_err());
        assert_eq!(
            Value::from("2024-03-01").coerce(ColumnType::Timestamp).unwrap(),
            Value::Timestamp(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_time(NaiveTime::MIN))
        );
        assert_eq!(Value::Null.coerce(ColumnType::Int).unwrap(), Value::Null);
    }

    #[test]
    fn test_float_equality_is_canonical() {
        assert_eq!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_compare_across_numeric_types() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::from("1").compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Value::from_json(&serde_json::json!(5)), Value::Int(5));
        assert_eq!(Value::from_json(&serde_json::json!(5.5)), Value::Float(5.5));
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
        assert_eq!(
            Value::from_json(&serde_json::json!({"a": 1})),
            Value::from("{\"a\":1}")
        );
    }
}
