//! Drives jobs through extract, transform, load and quality check
//!
//! Each job is isolated: its failure is recorded in its own run and never
//! stops sibling jobs. With `max_concurrent_jobs > 1` jobs are grouped into
//! lanes by target table. A lane runs its jobs in declaration order and
//! lanes run concurrently under a semaphore, so two jobs writing the same
//! table never overlap.

use batchflow_common::TabularBatch;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::archive::{archive_batch, ObjectStore};
use crate::config::EngineConfig;
use crate::error::{EtlError, EtlResult};
use crate::extract::build_extractor;
use crate::joblog::{JobLogger, JobStatus, RunHandle, RunOutcome, RunStore};
use crate::jobs::{JobConfigSet, JobDescriptor, TableName};
use crate::load::{LoadProgress, LoadStrategy, Loader, TableStore};
use crate::quality::{self, QualityContext, QualityScope, QualitySummary};
use crate::schema;
use crate::transform;

/// Result of one job within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_name: String,
    pub run_id: Option<Uuid>,
    pub status: JobStatus,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub error_message: Option<String>,
    /// Skipped because a recent successful run exists
    pub skipped: bool,
}

/// Result of one orchestrator invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_started_at: DateTime<Utc>,
    pub run_finished_at: DateTime<Utc>,
    /// In declaration order
    pub jobs: Vec<JobSummary>,
    /// No job failed
    pub success: bool,
}

impl RunSummary {
    pub fn job(&self, name: &str) -> Option<&JobSummary> {
        self.jobs.iter().find(|j| j.job_name == name)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Why a job stopped before success
struct StageFailure {
    status: JobStatus,
    stage: JobStatus,
    error: EtlError,
    chunk: Option<usize>,
}

impl StageFailure {
    fn at(stage: JobStatus) -> impl FnOnce(EtlError) -> StageFailure {
        move |error| StageFailure {
            status: JobStatus::Failed,
            stage,
            error,
            chunk: None,
        }
    }
}

/// Mutable facts gathered while a job moves through its stages
struct JobTracker {
    handle: RunHandle,
    records_processed: u64,
    records_loaded: u64,
    metadata: Map<String, Json>,
}

fn to_json<T: Serialize>(value: &T) -> Json {
    serde_json::to_value(value).unwrap_or(Json::Null)
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

pub struct PipelineOrchestrator {
    config: EngineConfig,
    loader: Loader,
    logger: JobLogger,
    archive: Option<Arc<dyn ObjectStore>>,
    cancel: CancellationToken,
}

/// Jobs grouped by parsed target table, in declaration order. Names that
/// do not parse keep their own lane under the raw string.
fn group_lanes(
    jobs: &JobConfigSet,
) -> IndexMap<Result<TableName, &str>, Vec<(usize, &JobDescriptor)>> {
    let mut lanes: IndexMap<_, Vec<_>> = IndexMap::new();
    for (index, job) in jobs.iter().enumerate() {
        let key = TableName::parse(&job.target_table).map_err(|_| job.target_table.as_str());
        lanes.entry(key).or_default().push((index, job));
    }
    lanes
}

impl PipelineOrchestrator {
    pub fn new(
        config: EngineConfig,
        table_store: Arc<dyn TableStore>,
        run_store: Arc<dyn RunStore>,
    ) -> Self {
        let loader = Loader::new(table_store, config.chunk_size, config.retry.clone());
        Self {
            config,
            loader,
            logger: JobLogger::new(run_store),
            archive: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_archive(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.archive = Some(store);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Run every job in `jobs`.
    ///
    /// Only an invalid configuration returns `Err`, before any job starts.
    /// Job failures are reported in the summary.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    pub async fn run(&self, jobs: &JobConfigSet) -> EtlResult<RunSummary> {
        jobs.validate()?;
        let run_started_at = Utc::now();

        let summaries = if self.config.max_concurrent_jobs <= 1 {
            let mut summaries = Vec::with_capacity(jobs.len());
            for job in jobs.iter() {
                summaries.push(self.run_job(job).await);
            }
            summaries
        } else {
            self.run_lanes(jobs).await
        };

        let summary = RunSummary {
            run_started_at,
            run_finished_at: Utc::now(),
            success: summaries.iter().all(|j| j.status != JobStatus::Failed),
            jobs: summaries,
        };
        info!(
            success = summary.success,
            succeeded = summary.count(JobStatus::Success),
            partial = summary.count(JobStatus::Partial),
            failed = summary.count(JobStatus::Failed),
            elapsed_ms = (summary.run_finished_at - summary.run_started_at).num_milliseconds(),
            "Run complete"
        );
        Ok(summary)
    }

    async fn run_lanes(&self, jobs: &JobConfigSet) -> Vec<JobSummary> {
        let lanes = group_lanes(jobs);
        let semaphore = Semaphore::new(self.config.max_concurrent_jobs);
        let lane_results = join_all(lanes.into_values().map(|lane| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                let mut results = Vec::with_capacity(lane.len());
                for (index, job) in lane {
                    results.push((index, self.run_job(job).await));
                }
                results
            }
        }))
        .await;

        let mut indexed: Vec<(usize, JobSummary)> = lane_results.into_iter().flatten().collect();
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Run one job to a terminal state; never fails
    #[instrument(skip(self, job), fields(job = %job.job_name, table = %job.target_table))]
    async fn run_job(&self, job: &JobDescriptor) -> JobSummary {
        if let Some(skipped) = self.recently_succeeded(job).await {
            return skipped;
        }

        let handle = match self.logger.start(&job.job_name, &job.target_table).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(job = %job.job_name, error = %e, "Could not record run start");
                return JobSummary {
                    job_name: job.job_name.clone(),
                    run_id: None,
                    status: JobStatus::Failed,
                    records_processed: 0,
                    records_loaded: 0,
                    error_message: Some(format!("job '{}' failed at pending: {}", job.job_name, e)),
                    skipped: false,
                };
            },
        };

        let mut tracker = JobTracker {
            handle,
            records_processed: 0,
            records_loaded: 0,
            metadata: Map::new(),
        };
        tracker
            .metadata
            .insert("source_kind".to_string(), Json::from(job.source.kind()));
        tracker
            .metadata
            .insert("load_strategy".to_string(), Json::from(job.load_strategy.as_str()));

        let result = self.execute(job, &mut tracker).await;
        self.finish(job, tracker, result).await
    }

    /// Successful run of `job` inside its skip window, reported as skipped
    async fn recently_succeeded(&self, job: &JobDescriptor) -> Option<JobSummary> {
        let window = job.skip_if_succeeded_within_secs?;
        let last = match self.logger.last_successful(&job.job_name).await {
            Ok(last) => last?,
            Err(e) => {
                warn!(job = %job.job_name, error = %e, "Could not look up last successful run");
                return None;
            },
        };
        let ended = last.end_time?;
        let age = Utc::now().signed_duration_since(ended);
        if age.num_seconds() >= i64::try_from(window).unwrap_or(i64::MAX) {
            return None;
        }

        info!(
            job = %job.job_name,
            last_run = %last.run_id,
            age_secs = age.num_seconds(),
            "Skipping job, succeeded recently"
        );
        Some(JobSummary {
            job_name: job.job_name.clone(),
            run_id: None,
            status: JobStatus::Success,
            records_processed: 0,
            records_loaded: 0,
            error_message: None,
            skipped: true,
        })
    }

    /// Race `future` against run cancellation and the stage timeout
    async fn guarded<T, F>(&self, stage: JobStatus, future: F) -> EtlResult<T>
    where
        F: Future<Output = EtlResult<T>>,
    {
        let timeout = self.config.stage_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EtlError::Cancelled("run cancelled".to_string())),
            _ = sleep_for(timeout) => Err(EtlError::Cancelled(format!(
                "{} timed out after {}s",
                stage,
                timeout.map(|t| t.as_secs()).unwrap_or_default()
            ))),
            result = future => result,
        }
    }

    async fn enter(&self, tracker: &mut JobTracker, stage: JobStatus) -> Result<(), StageFailure> {
        let from = tracker.handle.status;
        tracker.handle = self
            .logger
            .advance(tracker.handle.clone(), stage)
            .await
            .map_err(StageFailure::at(from))?;
        Ok(())
    }

    async fn execute(
        &self,
        job: &JobDescriptor,
        tracker: &mut JobTracker,
    ) -> Result<JobStatus, StageFailure> {
        // Extract
        let raw = self
            .guarded(JobStatus::Extracting, async {
                let extractor = build_extractor(&job.source, self.config.retry.clone())?;
                info!(job = %job.job_name, source = %extractor.describe(), "Extracting");
                extractor.extract().await
            })
            .await
            .map_err(StageFailure::at(JobStatus::Extracting))?;
        tracker.records_processed = raw.len() as u64;
        tracker
            .metadata
            .insert("rows_extracted".to_string(), Json::from(raw.len()));

        // Transform
        self.enter(tracker, JobStatus::Transforming).await?;
        let archived_source = (job.archive && self.config.archive_enabled && self.archive.is_some())
            .then(|| raw.clone());
        let transformed = schema::negotiate(raw, &job.type_mapping)
            .and_then(|batch| transform::apply(batch, &job.transform_spec))
            .map_err(StageFailure::at(JobStatus::Transforming))?;
        tracker
            .metadata
            .insert("transform".to_string(), to_json(&transformed.report));
        let batch = transformed.batch;

        // Load
        self.enter(tracker, JobStatus::Loading).await?;
        self.load(job, &batch, tracker).await?;

        if let (Some(source), Some(store)) = (archived_source, &self.archive) {
            match archive_batch(store.as_ref(), &job.job_name, tracker.handle.run_id, &source).await {
                Ok(receipt) => {
                    tracker.metadata.insert("archive".to_string(), to_json(&receipt));
                },
                Err(e) => warn!(job = %job.job_name, error = %e, "Archival failed, continuing"),
            }
        }

        // Quality check
        self.enter(tracker, JobStatus::QualityCheck).await?;
        self.guarded(JobStatus::QualityCheck, self.check_quality(job, &batch, tracker))
            .await
            .map_err(StageFailure::at(JobStatus::QualityCheck))?;

        Ok(JobStatus::Success)
    }

    async fn load(
        &self,
        job: &JobDescriptor,
        batch: &TabularBatch,
        tracker: &mut JobTracker,
    ) -> Result<(), StageFailure> {
        let progress = LoadProgress::new();
        let conflict_key = match job.load_strategy {
            LoadStrategy::Upsert => job.conflict_key.as_deref(),
            LoadStrategy::Replace | LoadStrategy::Append => None,
        };
        let loaded = self
            .guarded(
                JobStatus::Loading,
                self.loader.load(
                    &job.job_name,
                    batch,
                    &job.target_table,
                    job.load_strategy,
                    conflict_key,
                    &progress,
                ),
            )
            .await;

        let result = match loaded {
            Ok(result) => result,
            Err(error @ EtlError::Cancelled(_)) => {
                let result = progress.interrupted(error.to_string());
                tracker.records_loaded = result.records_loaded;
                tracker.metadata.insert("load".to_string(), to_json(&result));
                return Err(StageFailure {
                    status: JobStatus::Failed,
                    stage: JobStatus::Loading,
                    error,
                    chunk: result.first_failed_chunk,
                });
            },
            Err(error) => return Err(StageFailure::at(JobStatus::Loading)(error)),
        };

        tracker.records_loaded = result.records_loaded;
        tracker.metadata.insert("load".to_string(), to_json(&result));

        match result.failure {
            None => Ok(()),
            Some(failure) => Err(StageFailure {
                status: if result.records_loaded > 0 {
                    JobStatus::Partial
                } else {
                    JobStatus::Failed
                },
                stage: JobStatus::Loading,
                error: EtlError::load(failure),
                chunk: result.first_failed_chunk,
            }),
        }
    }

    async fn check_quality(
        &self,
        job: &JobDescriptor,
        batch: &TabularBatch,
        tracker: &mut JobTracker,
    ) -> EtlResult<()> {
        let store = self.loader.store();
        let table_rows = store.row_count(&job.target_table).await?;
        tracker
            .metadata
            .insert("table_row_count".to_string(), Json::from(table_rows));

        let specs = &job.quality.metrics;
        if specs.is_empty() {
            return Ok(());
        }

        let previous_table_rows = self
            .logger
            .last_successful_for_table(&job.target_table)
            .await?
            .and_then(|run| run.table_row_count());
        let context = QualityContext {
            run_id: Some(tracker.handle.run_id),
            current_table_rows: Some(table_rows),
            previous_table_rows,
        };

        let metrics = match job.quality.scope {
            QualityScope::Batch => quality::evaluate(&job.target_table, batch, specs, &context)?,
            QualityScope::Table => {
                let table = store.fetch_table(&job.target_table).await?;
                quality::evaluate(&job.target_table, &table, specs, &context)?
            },
        };
        self.logger.record_metrics(&metrics).await?;

        let summary = QualitySummary::of(&metrics);
        info!(
            job = %job.job_name,
            passed = summary.passed,
            warned = summary.warned,
            failed = summary.failed,
            "Quality metrics recorded"
        );
        tracker.metadata.insert("quality".to_string(), to_json(&summary));

        if let Some(message) = quality::failure_message(&metrics) {
            if job.quality.blocking {
                return Err(EtlError::QualityViolation(message));
            }
            warn!(job = %job.job_name, "{}", message);
        }
        Ok(())
    }

    async fn finish(
        &self,
        job: &JobDescriptor,
        tracker: JobTracker,
        result: Result<JobStatus, StageFailure>,
    ) -> JobSummary {
        let (status, error_message) = match result {
            Ok(status) => (status, None),
            Err(failure) => {
                let detail = match failure.chunk {
                    Some(chunk) => format!(
                        " (chunk {}, {} rows committed)",
                        chunk, tracker.records_loaded
                    ),
                    None => String::new(),
                };
                (
                    failure.status,
                    Some(format!(
                        "job '{}' failed at {}{}: {}",
                        job.job_name, failure.stage, detail, failure.error
                    )),
                )
            },
        };

        let run_id = tracker.handle.run_id;
        let outcome = RunOutcome {
            status,
            records_processed: tracker.records_processed,
            records_loaded: tracker.records_loaded,
            error_message: error_message.clone(),
            metadata: Json::Object(tracker.metadata),
        };
        let (records_processed, records_loaded) = match self.logger.finish(tracker.handle, outcome).await {
            Ok(run) => (run.records_processed, run.records_loaded),
            Err(e) => {
                error!(job = %job.job_name, run_id = %run_id, error = %e, "Could not record run outcome");
                (tracker.records_processed, tracker.records_loaded.min(tracker.records_processed))
            },
        };

        match status {
            JobStatus::Success => info!(
                job = %job.job_name,
                status = %status,
                records_processed,
                records_loaded,
                "Job finished"
            ),
            _ => warn!(
                job = %job.job_name,
                status = %status,
                records_processed,
                records_loaded,
                error = error_message.as_deref().unwrap_or_default(),
                "Job finished"
            ),
        }

        JobSummary {
            job_name: job.job_name.clone(),
            run_id: Some(run_id),
            status,
            records_processed,
            records_loaded,
            error_message,
            skipped: false,
        }
    }
}
