//! Job run lifecycle records
//!
//! Every job execution is one [`JobRun`] row whose status only moves
//! forward:
//!
//! ```text
//! pending -> extracting -> transforming -> loading -> quality_check
//!                                                   \-> success | partial | failed
//! ```
//!
//! Any non-terminal status may finish. The [`JobLogger`] hands out a
//! [`RunHandle`] that callers pass back into each lifecycle call.

mod memory;
mod postgres;

pub use memory::MemoryRunStore;
pub use postgres::PgRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EtlError, EtlResult};
use crate::quality::QualityMetric;

/// Status of one job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Extracting,
    Transforming,
    Loading,
    QualityCheck,
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Extracting => "extracting",
            JobStatus::Transforming => "transforming",
            JobStatus::Loading => "loading",
            JobStatus::QualityCheck => "quality_check",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Partial | JobStatus::Failed)
    }

    fn stage_rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Extracting => 1,
            JobStatus::Transforming => 2,
            JobStatus::Loading => 3,
            JobStatus::QualityCheck => 4,
            JobStatus::Success | JobStatus::Partial | JobStatus::Failed => 5,
        }
    }

    /// Whether a run in this status may move to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.stage_rank() > self.stage_rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => JobStatus::Pending,
            "extracting" => JobStatus::Extracting,
            "transforming" => JobStatus::Transforming,
            "loading" => JobStatus::Loading,
            "quality_check" => JobStatus::QualityCheck,
            "success" => JobStatus::Success,
            "partial" => JobStatus::Partial,
            _ => JobStatus::Failed,
        }
    }
}

/// One execution of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_name: String,
    pub target_table: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl JobRun {
    /// Table row count recorded after this run's load
    pub fn table_row_count(&self) -> Option<u64> {
        self.metadata.get("table_row_count").and_then(|v| v.as_u64())
    }
}

/// Reference to an in-flight run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub job_name: String,
    pub target_table: String,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
}

/// Terminal facts recorded by [`JobLogger::finish`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: JobStatus,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl RunOutcome {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            records_processed: 0,
            records_loaded: 0,
            error_message: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Persistence behind the job logger
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &JobRun) -> EtlResult<()>;

    async fn update_status(&self, run_id: Uuid, status: JobStatus) -> EtlResult<()>;

    /// Write the terminal state of a run
    async fn complete_run(&self, run: &JobRun) -> EtlResult<()>;

    async fn last_successful(&self, job_name: &str) -> EtlResult<Option<JobRun>>;

    async fn last_successful_for_table(&self, table: &str) -> EtlResult<Option<JobRun>>;

    async fn insert_metrics(&self, metrics: &[QualityMetric]) -> EtlResult<()>;

    /// Most recent runs first
    async fn recent_runs(&self, job_name: &str, limit: usize) -> EtlResult<Vec<JobRun>>;
}

/// Records job lifecycles through a [`RunStore`]
#[derive(Clone)]
pub struct JobLogger {
    store: Arc<dyn RunStore>,
}

impl JobLogger {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Insert a pending run and move it straight to extracting
    pub async fn start(&self, job_name: &str, target_table: &str) -> EtlResult<RunHandle> {
        let run = JobRun {
            run_id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            target_table: target_table.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: JobStatus::Pending,
            records_processed: 0,
            records_loaded: 0,
            error_message: None,
            metadata: serde_json::Value::Object(Default::default()),
        };
        self.store.insert_run(&run).await?;
        debug!(job = job_name, run_id = %run.run_id, "Run started");

        let handle = RunHandle {
            run_id: run.run_id,
            job_name: run.job_name,
            target_table: run.target_table,
            status: JobStatus::Pending,
            start_time: run.start_time,
        };
        self.advance(handle, JobStatus::Extracting).await
    }

    /// Move to a later non-terminal stage
    pub async fn advance(&self, mut handle: RunHandle, stage: JobStatus) -> EtlResult<RunHandle> {
        if stage.is_terminal() || !handle.status.can_transition_to(stage) {
            return Err(EtlError::InvalidTransition {
                from: handle.status,
                to: stage,
            });
        }
        self.store.update_status(handle.run_id, stage).await?;
        debug!(job = %handle.job_name, from = %handle.status, to = %stage, "Run advanced");
        handle.status = stage;
        Ok(handle)
    }

    /// Record the terminal state. `records_loaded` is clamped to
    /// `records_processed`.
    pub async fn finish(&self, handle: RunHandle, outcome: RunOutcome) -> EtlResult<JobRun> {
        if !outcome.status.is_terminal() || !handle.status.can_transition_to(outcome.status) {
            return Err(EtlError::InvalidTransition {
                from: handle.status,
                to: outcome.status,
            });
        }

        let mut records_loaded = outcome.records_loaded;
        if records_loaded > outcome.records_processed {
            warn!(
                job = %handle.job_name,
                records_loaded,
                records_processed = outcome.records_processed,
                "records_loaded exceeds records_processed, clamping"
            );
            records_loaded = outcome.records_processed;
        }

        let run = JobRun {
            run_id: handle.run_id,
            job_name: handle.job_name,
            target_table: handle.target_table,
            start_time: handle.start_time,
            end_time: Some(Utc::now()),
            status: outcome.status,
            records_processed: outcome.records_processed,
            records_loaded,
            error_message: outcome.error_message,
            metadata: outcome.metadata,
        };
        self.store.complete_run(&run).await?;
        Ok(run)
    }

    pub async fn last_successful(&self, job_name: &str) -> EtlResult<Option<JobRun>> {
        self.store.last_successful(job_name).await
    }

    pub async fn last_successful_for_table(&self, table: &str) -> EtlResult<Option<JobRun>> {
        self.store.last_successful_for_table(table).await
    }

    pub async fn record_metrics(&self, metrics: &[QualityMetric]) -> EtlResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        self.store.insert_metrics(metrics).await
    }

    pub async fn recent_runs(&self, job_name: &str, limit: usize) -> EtlResult<Vec<JobRun>> {
        self.store.recent_runs(job_name, limit).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn logger() -> (JobLogger, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        (JobLogger::new(store.clone()), store)
    }

    #[test]
    fn test_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Extracting));
        assert!(JobStatus::Extracting.can_transition_to(JobStatus::Loading));
        assert!(JobStatus::Extracting.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Loading.can_transition_to(JobStatus::Transforming));
        assert!(!JobStatus::Loading.can_transition_to(JobStatus::Loading));
        assert!(!JobStatus::Success.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Partial));
    }

    #[test]
    fn test_status_strings() {
        for status in [JobStatus::QualityCheck, JobStatus::Partial, JobStatus::Extracting] {
            assert_eq!(JobStatus::from(status.as_str().to_string()), status);
        }
        assert_eq!(
            serde_json::to_value(JobStatus::QualityCheck).unwrap(),
            serde_json::json!("quality_check")
        );
    }

    #[tokio::test]
    async fn test_start_lands_in_extracting() {
        let (logger, store) = logger();
        let handle = logger.start("orders", "analytics.orders").await.unwrap();
        assert_eq!(handle.status, JobStatus::Extracting);
        assert_eq!(store.runs()[0].status, JobStatus::Extracting);
    }

    #[tokio::test]
    async fn test_backward_advance_rejected() {
        let (logger, _) = logger();
        let handle = logger.start("orders", "t").await.unwrap();
        let handle = logger.advance(handle, JobStatus::Loading).await.unwrap();
        let err = logger
            .advance(handle.clone(), JobStatus::Transforming)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EtlError::InvalidTransition {
                from: JobStatus::Loading,
                to: JobStatus::Transforming
            }
        ));
        assert!(logger.advance(handle, JobStatus::Success).await.is_err());
    }

    #[tokio::test]
    async fn test_finish_clamps_loaded() {
        let (logger, store) = logger();
        let handle = logger.start("orders", "t").await.unwrap();
        let mut outcome = RunOutcome::new(JobStatus::Success);
        outcome.records_processed = 10;
        outcome.records_loaded = 12;

        let run = logger.finish(handle, outcome).await.unwrap();
        assert_eq!(run.records_loaded, 10);
        assert!(run.end_time.is_some());
        assert_eq!(store.runs()[0], run);
    }

    #[tokio::test]
    async fn test_last_successful_ignores_failures() {
        let (logger, _) = logger();
        let first = logger.start("orders", "t").await.unwrap();
        let first = logger
            .finish(first, RunOutcome::new(JobStatus::Success))
            .await
            .unwrap();
        let second = logger.start("orders", "t").await.unwrap();
        logger
            .finish(second, RunOutcome::new(JobStatus::Failed))
            .await
            .unwrap();

        let last = logger.last_successful("orders").await.unwrap().unwrap();
        assert_eq!(last.run_id, first.run_id);
        assert_eq!(
            logger.last_successful_for_table("t").await.unwrap().unwrap().run_id,
            first.run_id
        );
        assert!(logger.last_successful("other").await.unwrap().is_none());
        assert_eq!(logger.recent_runs("orders", 5).await.unwrap().len(), 2);
    }
}
