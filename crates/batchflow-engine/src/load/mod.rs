//! Chunked, transactional loading into target tables
//!
//! A batch is written in fixed-size chunks, in order, each chunk committed
//! atomically by the [`TableStore`]. A failed chunk is retried while its
//! error is transient; once a chunk fails for good the load stops, earlier
//! chunks stay committed and the [`LoadResult`] names the failed chunk.
//!
//! Only one load per target table runs at a time inside a process; the
//! [`TableLocks`] scope is held for the whole chunk sequence.

mod memory;
pub(crate) mod postgres;

pub use memory::{ChunkFailure, MemoryTableStore, WriteEvent};
pub use postgres::PgTableStore;

use async_trait::async_trait;
use batchflow_common::{Row, Schema, TabularBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::error::{EtlError, EtlResult};
use crate::retry::RetryPolicy;

/// Conflict resolution against existing rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Clear the table with the first chunk, then insert
    Replace,
    Append,
    /// Insert, updating non-key columns of rows matching `conflict_key`
    Upsert,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::Replace => "replace",
            LoadStrategy::Append => "append",
            LoadStrategy::Upsert => "upsert",
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single chunk is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode<'a> {
    Insert,
    /// Delete every existing row, then insert, in one transaction
    ReplaceThenInsert,
    Upsert { conflict_key: &'a [String] },
}

/// One chunk handed to a [`TableStore`]
#[derive(Debug, Clone, Copy)]
pub struct ChunkWrite<'a> {
    pub job_name: &'a str,
    pub table: &'a str,
    pub schema: &'a Schema,
    pub rows: &'a [Row],
    pub mode: WriteMode<'a>,
    pub chunk_index: usize,
}

/// Relational backend the loader writes through
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Column names of `table`, for a batch shaped like `schema`.
    ///
    /// A missing table is a schema error unless the store creates tables.
    async fn target_columns(&self, table: &str, schema: &Schema) -> EtlResult<Vec<String>>;

    /// Apply one chunk atomically; returns the rows written
    async fn write_chunk(&self, chunk: ChunkWrite<'_>) -> EtlResult<u64>;

    async fn row_count(&self, table: &str) -> EtlResult<u64>;

    /// Entire table contents, typed from the table definition
    async fn fetch_table(&self, table: &str) -> EtlResult<TabularBatch>;
}

/// Outcome of one load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub records_loaded: u64,
    pub chunks_total: usize,
    pub chunks_committed: usize,
    pub chunks_failed: usize,
    pub first_failed_chunk: Option<usize>,
    pub failure: Option<String>,
}

impl LoadResult {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.chunks_committed == self.chunks_total
    }
}

/// Rows and chunks committed so far, readable while a load is in flight
#[derive(Debug, Default)]
pub struct LoadProgress {
    rows_committed: AtomicU64,
    chunks_committed: AtomicUsize,
    chunks_total: AtomicUsize,
    current_chunk: AtomicUsize,
}

impl LoadProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rows_committed(&self) -> u64 {
        self.rows_committed.load(Ordering::SeqCst)
    }

    pub fn chunks_committed(&self) -> usize {
        self.chunks_committed.load(Ordering::SeqCst)
    }

    /// Chunk being written, or the next one to write
    pub fn current_chunk(&self) -> usize {
        self.current_chunk.load(Ordering::SeqCst)
    }

    /// Result describing a load that stopped early, e.g. on cancellation
    pub fn interrupted(&self, reason: impl Into<String>) -> LoadResult {
        LoadResult {
            records_loaded: self.rows_committed(),
            chunks_total: self.chunks_total.load(Ordering::SeqCst),
            chunks_committed: self.chunks_committed(),
            chunks_failed: 1,
            first_failed_chunk: Some(self.current_chunk()),
            failure: Some(reason.into()),
        }
    }
}

/// Per-table exclusive scopes shared by every loader in the process
#[derive(Debug, Clone, Default)]
pub struct TableLocks {
    tables: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TableLocks {
    pub async fn acquire(&self, table: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut tables = self
                .tables
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tables.entry(table.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Writes batches through a [`TableStore`] in committed chunks
#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn TableStore>,
    chunk_size: usize,
    retry: RetryPolicy,
    locks: TableLocks,
}

impl Loader {
    pub fn new(store: Arc<dyn TableStore>, chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            retry,
            locks: TableLocks::default(),
        }
    }

    pub fn with_locks(mut self, locks: TableLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Check the batch against the target before any write
    pub async fn verify(
        &self,
        batch: &TabularBatch,
        table: &str,
        strategy: LoadStrategy,
        conflict_key: Option<&[String]>,
    ) -> EtlResult<()> {
        let target = self.store.target_columns(table, batch.schema()).await?;
        let missing: Vec<&str> = batch
            .schema()
            .names()
            .into_iter()
            .filter(|c| !target.iter().any(|t| t == c))
            .collect();
        if !missing.is_empty() {
            return Err(EtlError::schema(format!(
                "table {} has no column(s) {}",
                table,
                missing.join(", ")
            )));
        }

        if strategy == LoadStrategy::Upsert {
            let keys = conflict_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| EtlError::config("upsert requires conflict_key"))?;
            if let Some(key) = keys.iter().find(|k| !batch.schema().contains(k)) {
                return Err(EtlError::schema(format!(
                    "conflict_key column '{}' is not in the batch",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Load `batch` into `table`.
    ///
    /// Verification failures return `Err` with nothing written. Chunk
    /// failures return `Ok` with `failure` set and the committed counts.
    #[instrument(skip(self, batch, conflict_key, progress), fields(rows = batch.len()))]
    pub async fn load(
        &self,
        job_name: &str,
        batch: &TabularBatch,
        table: &str,
        strategy: LoadStrategy,
        conflict_key: Option<&[String]>,
        progress: &LoadProgress,
    ) -> EtlResult<LoadResult> {
        self.verify(batch, table, strategy, conflict_key).await?;

        let _table_scope = self.locks.acquire(table).await;
        debug!(table, "Acquired table scope");

        let mut chunks: Vec<&[Row]> = batch.chunks(self.chunk_size).collect();
        if chunks.is_empty() && strategy == LoadStrategy::Replace {
            // Replacing with nothing still clears the table
            chunks.push(&[]);
        }

        let keys = conflict_key.unwrap_or(&[]);
        let mut result = LoadResult {
            chunks_total: chunks.len(),
            ..Default::default()
        };
        progress.chunks_total.store(chunks.len(), Ordering::SeqCst);

        for (index, rows) in chunks.into_iter().enumerate() {
            progress.current_chunk.store(index, Ordering::SeqCst);
            let mode = match strategy {
                LoadStrategy::Replace if index == 0 => WriteMode::ReplaceThenInsert,
                LoadStrategy::Replace | LoadStrategy::Append => WriteMode::Insert,
                LoadStrategy::Upsert => WriteMode::Upsert { conflict_key: keys },
            };
            let chunk = ChunkWrite {
                job_name,
                table,
                schema: batch.schema(),
                rows,
                mode,
                chunk_index: index,
            };

            let written = self
                .retry
                .run("write_chunk", |_| self.store.write_chunk(chunk))
                .await;

            match written {
                Ok(count) => {
                    result.records_loaded += count;
                    result.chunks_committed += 1;
                    progress.rows_committed.fetch_add(count, Ordering::SeqCst);
                    progress.chunks_committed.fetch_add(1, Ordering::SeqCst);
                    debug!(job = job_name, table, chunk = index, rows = count, "Chunk committed");
                },
                Err(e) => {
                    warn!(
                        job = job_name,
                        table,
                        chunk = index,
                        rows_committed = result.records_loaded,
                        error = %e,
                        "Chunk failed, aborting load"
                    );
                    result.chunks_failed = 1;
                    result.first_failed_chunk = Some(index);
                    result.failure = Some(e.to_string());
                    return Ok(result);
                },
            }
        }

        info!(
            job = job_name,
            table,
            strategy = %strategy,
            records_loaded = result.records_loaded,
            chunks = result.chunks_committed,
            "Load complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use batchflow_common::{Column, ColumnType, Value};

    fn numbered(count: i64) -> TabularBatch {
        let schema = Schema::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("label", ColumnType::String),
        ])
        .unwrap();
        let rows = (0..count)
            .map(|i| vec![Value::Int(i), Value::from(format!("row-{}", i))])
            .collect();
        TabularBatch::from_rows(schema, rows).unwrap()
    }

    fn store_with_table() -> Arc<MemoryTableStore> {
        let store = Arc::new(MemoryTableStore::new());
        store.create_table("events", numbered(0).schema().clone());
        store
    }

    #[tokio::test]
    async fn test_chunks_and_permanent_failure() {
        let store = store_with_table();
        store.fail_chunk("events", 1, ChunkFailure::Permanent);
        let loader = Loader::new(store.clone(), 500, RetryPolicy::immediate(3));
        let progress = LoadProgress::new();

        let result = loader
            .load("j", &numbered(1200), "events", LoadStrategy::Append, None, &progress)
            .await
            .unwrap();

        assert_eq!(result.chunks_total, 3);
        assert_eq!(result.records_loaded, 500);
        assert_eq!(result.chunks_committed, 1);
        assert_eq!(result.first_failed_chunk, Some(1));
        assert!(result.failure.is_some());
        assert_eq!(store.row_count("events").await.unwrap(), 500);

        let attempted: Vec<usize> = store.write_log().iter().map(|e| e.chunk_index).collect();
        assert_eq!(attempted, vec![0], "third chunk must never be attempted");
        assert_eq!(progress.rows_committed(), 500);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = store_with_table();
        store.fail_chunk("events", 0, ChunkFailure::Transient { times: 2 });
        let loader = Loader::new(store.clone(), 100, RetryPolicy::immediate(3));

        let result = loader
            .load("j", &numbered(150), "events", LoadStrategy::Append, None, &LoadProgress::default())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.records_loaded, 150);
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let store = store_with_table();
        let loader = Loader::new(store.clone(), 7, RetryPolicy::none());
        let batch = numbered(20);

        for _ in 0..2 {
            let result = loader
                .load("j", &batch, "events", LoadStrategy::Replace, None, &LoadProgress::default())
                .await
                .unwrap();
            assert_eq!(result.chunks_total, 3);
        }

        let table = store.fetch_table("events").await.unwrap();
        assert_eq!(table.rows(), batch.rows());
    }

    #[tokio::test]
    async fn test_replace_with_empty_batch_clears_table() {
        let store = store_with_table();
        let loader = Loader::new(store.clone(), 10, RetryPolicy::none());
        loader
            .load("j", &numbered(5), "events", LoadStrategy::Append, None, &LoadProgress::default())
            .await
            .unwrap();

        let result = loader
            .load("j", &numbered(0), "events", LoadStrategy::Replace, None, &LoadProgress::default())
            .await
            .unwrap();

        assert_eq!(result.chunks_total, 1);
        assert_eq!(result.records_loaded, 0);
        assert_eq!(store.row_count("events").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_touches_only_matching_rows() {
        let store = store_with_table();
        let loader = Loader::new(store.clone(), 4, RetryPolicy::none());
        loader
            .load("j", &numbered(10), "events", LoadStrategy::Append, None, &LoadProgress::default())
            .await
            .unwrap();

        let schema = numbered(0).schema().clone();
        let changes = TabularBatch::from_rows(
            schema,
            vec![
                vec![Value::Int(3), Value::from("changed")],
                vec![Value::Int(42), Value::from("new")],
            ],
        )
        .unwrap();
        let key = vec!["id".to_string()];
        loader
            .load("j", &changes, "events", LoadStrategy::Upsert, Some(&key), &LoadProgress::default())
            .await
            .unwrap();

        let table = store.fetch_table("events").await.unwrap();
        assert_eq!(table.len(), 11);
        for row in table.rows() {
            match row[0] {
                Value::Int(3) => assert_eq!(row[1], Value::from("changed")),
                Value::Int(42) => assert_eq!(row[1], Value::from("new")),
                Value::Int(i) => assert_eq!(row[1], Value::from(format!("row-{}", i))),
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn test_columns_must_exist_in_target() {
        let store = store_with_table();
        let loader = Loader::new(store.clone(), 10, RetryPolicy::none());
        let mut batch = numbered(3);
        batch
            .add_column(
                Column::new("extra", ColumnType::Bool),
                vec![Value::Null, Value::Null, Value::Null],
            )
            .unwrap();

        let err = loader
            .load("j", &batch, "events", LoadStrategy::Append, None, &LoadProgress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Schema(_)));
        assert!(store.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_key_must_be_in_batch() {
        let store = store_with_table();
        let loader = Loader::new(store, 10, RetryPolicy::none());
        let key = vec!["event_id".to_string()];
        let err = loader
            .load("j", &numbered(1), "events", LoadStrategy::Upsert, Some(&key), &LoadProgress::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("event_id"));
    }
}
