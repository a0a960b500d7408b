//! Tabular data model shared by every pipeline stage

mod batch;
mod schema;
mod value;

pub use batch::{Row, TabularBatch};
pub use schema::{Column, Schema};
pub use value::{ColumnType, Value};
