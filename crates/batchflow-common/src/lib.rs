//! Batchflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the batchflow workspace.
//!
//! # Overview
//!
//! - **Types**: the tabular data model (`Value`, `ColumnType`, `Schema`, `TabularBatch`)
//!   that flows from extraction through transformation into the loader
//! - **Error Handling**: `BatchError` for schema and row-shape violations
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use batchflow_common::types::{Column, ColumnType, Schema, TabularBatch, Value};
//!
//! fn build() -> batchflow_common::Result<TabularBatch> {
//!     let schema = Schema::new(vec![
//!         Column::new("id", ColumnType::Int),
//!         Column::new("name", ColumnType::String),
//!     ])?;
//!     let mut batch = TabularBatch::new(schema);
//!     batch.push_row(vec![Value::Int(1), Value::String("alice".into())])?;
//!     Ok(batch)
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{BatchError, Result};
pub use types::{Column, ColumnType, Row, Schema, TabularBatch, Value};
