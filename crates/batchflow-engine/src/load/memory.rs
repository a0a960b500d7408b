//! In-process table store for dry runs and tests

use async_trait::async_trait;
use batchflow_common::{Row, Schema, TabularBatch, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{ChunkWrite, TableStore, WriteMode};
use crate::error::{EtlError, EtlResult};

/// Injected behavior for one chunk of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFailure {
    /// Fail every attempt
    Permanent,
    /// Fail the first `times` attempts with a transient error
    Transient { times: u32 },
}

/// A chunk write that reached the store and committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub job_name: String,
    pub table: String,
    pub chunk_index: usize,
    pub rows: usize,
}

#[derive(Debug, Default)]
struct Table {
    schema: Schema,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    failures: HashMap<(String, usize), ChunkFailure>,
    write_log: Vec<WriteEvent>,
}

/// Table store holding everything in memory.
///
/// With `auto_create`, missing tables are created from the first batch
/// written to them.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    state: Mutex<State>,
    auto_create: bool,
    write_delay: Option<Duration>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_create() -> Self {
        Self {
            auto_create: true,
            ..Self::default()
        }
    }

    /// Pause before each chunk commit, which lets concurrent loads interleave
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_table(&self, table: &str, schema: Schema) {
        self.state().tables.insert(
            table.to_string(),
            Table {
                schema,
                rows: Vec::new(),
            },
        );
    }

    pub fn fail_chunk(&self, table: &str, chunk_index: usize, failure: ChunkFailure) {
        self.state()
            .failures
            .insert((table.to_string(), chunk_index), failure);
    }

    pub fn write_log(&self) -> Vec<WriteEvent> {
        self.state().write_log.clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().tables.keys().cloned().collect();
        names.sort();
        names
    }
}

fn missing_table(table: &str) -> EtlError {
    EtlError::schema(format!("target table {} does not exist", table))
}

/// Reorder `row` from the batch layout into the table layout
fn project(row: &Row, batch: &Schema, table: &Schema) -> Row {
    table
        .columns()
        .iter()
        .map(|column| {
            batch
                .index_of(&column.name)
                .map(|i| row[i].clone())
                .unwrap_or(Value::Null)
        })
        .collect()
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn target_columns(&self, table: &str, schema: &Schema) -> EtlResult<Vec<String>> {
        let mut state = self.state();
        if !state.tables.contains_key(table) {
            if !self.auto_create {
                return Err(missing_table(table));
            }
            state.tables.insert(
                table.to_string(),
                Table {
                    schema: schema.clone(),
                    rows: Vec::new(),
                },
            );
        }
        Ok(state.tables[table]
            .schema
            .names()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    async fn write_chunk(&self, chunk: ChunkWrite<'_>) -> EtlResult<u64> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let failure_key = (chunk.table.to_string(), chunk.chunk_index);
        match state.failures.get_mut(&failure_key) {
            Some(ChunkFailure::Permanent) => {
                return Err(EtlError::load(format!(
                    "chunk {} rejected by {}",
                    chunk.chunk_index, chunk.table
                )));
            },
            Some(ChunkFailure::Transient { times }) if *times > 0 => {
                *times -= 1;
                return Err(EtlError::transient_load(format!(
                    "chunk {} temporarily rejected by {}",
                    chunk.chunk_index, chunk.table
                )));
            },
            _ => {},
        }

        let target = state
            .tables
            .get_mut(chunk.table)
            .ok_or_else(|| missing_table(chunk.table))?;
        let incoming: Vec<Row> = chunk
            .rows
            .iter()
            .map(|row| project(row, chunk.schema, &target.schema))
            .collect();

        match chunk.mode {
            WriteMode::Insert => target.rows.extend(incoming),
            WriteMode::ReplaceThenInsert => target.rows = incoming,
            WriteMode::Upsert { conflict_key } => {
                let key_positions: Vec<usize> = conflict_key
                    .iter()
                    .map(|k| target.schema.require(k))
                    .collect::<Result<_, _>>()?;
                for row in incoming {
                    let existing = target
                        .rows
                        .iter_mut()
                        .find(|r| key_positions.iter().all(|&i| r[i] == row[i]));
                    match existing {
                        Some(existing) => {
                            // Only columns present in the batch are updated
                            for (i, column) in target.schema.columns().iter().enumerate() {
                                if chunk.schema.contains(&column.name) {
                                    existing[i] = row[i].clone();
                                }
                            }
                        },
                        None => target.rows.push(row),
                    }
                }
            },
        }

        state.write_log.push(WriteEvent {
            job_name: chunk.job_name.to_string(),
            table: chunk.table.to_string(),
            chunk_index: chunk.chunk_index,
            rows: chunk.rows.len(),
        });
        Ok(chunk.rows.len() as u64)
    }

    async fn row_count(&self, table: &str) -> EtlResult<u64> {
        let state = self.state();
        let target = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(target.rows.len() as u64)
    }

    async fn fetch_table(&self, table: &str) -> EtlResult<TabularBatch> {
        let state = self.state();
        let target = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(TabularBatch::from_rows(
            target.schema.clone(),
            target.rows.clone(),
        )?)
    }
}
