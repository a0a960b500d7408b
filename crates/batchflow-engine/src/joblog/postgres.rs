//! PostgreSQL run store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use super::{JobRun, JobStatus, RunStore};
use crate::config::{DEFAULT_JOB_LOG_TABLE, DEFAULT_METRICS_TABLE};
use crate::error::{EtlError, EtlResult};
use crate::jobs::is_qualified_identifier;
use crate::load::postgres::quote_table;
use crate::quality::QualityMetric;

const RUN_COLUMNS: &str = "run_id, job_name, target_table, start_time, end_time, status, \
     records_processed, records_loaded, error_message, metadata";

#[derive(Debug, sqlx::FromRow)]
struct JobRunRow {
    run_id: Uuid,
    job_name: String,
    target_table: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    records_processed: i64,
    records_loaded: i64,
    error_message: Option<String>,
    metadata: serde_json::Value,
}

impl From<JobRunRow> for JobRun {
    fn from(row: JobRunRow) -> Self {
        JobRun {
            run_id: row.run_id,
            job_name: row.job_name,
            target_table: row.target_table,
            start_time: row.start_time,
            end_time: row.end_time,
            status: JobStatus::from(row.status),
            records_processed: row.records_processed.max(0) as u64,
            records_loaded: row.records_loaded.max(0) as u64,
            error_message: row.error_message,
            metadata: row.metadata,
        }
    }
}

/// Run store on the `etl_job_logs` and `data_quality_metrics` tables
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
    job_log_table: String,
    metrics_table: String,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            job_log_table: quote_table(DEFAULT_JOB_LOG_TABLE),
            metrics_table: quote_table(DEFAULT_METRICS_TABLE),
        }
    }

    pub fn with_tables(pool: PgPool, job_log_table: &str, metrics_table: &str) -> EtlResult<Self> {
        for table in [job_log_table, metrics_table] {
            if !is_qualified_identifier(table) {
                return Err(EtlError::config(format!("invalid table name '{}'", table)));
            }
        }
        Ok(Self {
            pool,
            job_log_table: quote_table(job_log_table),
            metrics_table: quote_table(metrics_table),
        })
    }

    /// Create the log tables (and their schema) when absent
    pub async fn ensure_tables(&self) -> EtlResult<()> {
        for table in [&self.job_log_table, &self.metrics_table] {
            if let Some((schema, _)) = table.split_once('.') {
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
                    .execute(&self.pool)
                    .await?;
            }
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                run_id UUID PRIMARY KEY,
                job_name TEXT NOT NULL,
                target_table TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ,
                status TEXT NOT NULL,
                records_processed BIGINT NOT NULL DEFAULT 0,
                records_loaded BIGINT NOT NULL DEFAULT 0,
                error_message TEXT,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )
            "#,
            self.job_log_table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                metric_id UUID PRIMARY KEY,
                run_id UUID,
                table_name TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                metric_value DOUBLE PRECISION NOT NULL,
                threshold_value DOUBLE PRECISION NOT NULL,
                status TEXT NOT NULL,
                measured_at TIMESTAMPTZ NOT NULL,
                details JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )
            "#,
            self.metrics_table
        ))
        .execute(&self.pool)
        .await?;

        info!(
            job_log_table = %self.job_log_table,
            metrics_table = %self.metrics_table,
            "Run store tables ready"
        );
        Ok(())
    }

    async fn latest_success(&self, column: &str, value: &str) -> EtlResult<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(&format!(
            "SELECT {} FROM {} WHERE {} = $1 AND status = 'success' \
             ORDER BY end_time DESC NULLS LAST LIMIT 1",
            RUN_COLUMNS, self.job_log_table, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(JobRun::from))
    }
}

fn to_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert_run(&self, run: &JobRun) -> EtlResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.job_log_table, RUN_COLUMNS
        ))
        .bind(run.run_id)
        .bind(&run.job_name)
        .bind(&run.target_table)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.status.as_str())
        .bind(to_i64(run.records_processed))
        .bind(to_i64(run.records_loaded))
        .bind(&run.error_message)
        .bind(&run.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, run_id: Uuid, status: JobStatus) -> EtlResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = $2 WHERE run_id = $1",
            self.job_log_table
        ))
        .bind(run_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(&self, run: &JobRun) -> EtlResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $2,
                end_time = $3,
                records_processed = $4,
                records_loaded = $5,
                error_message = $6,
                metadata = $7
            WHERE run_id = $1
            "#,
            self.job_log_table
        ))
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.end_time)
        .bind(to_i64(run.records_processed))
        .bind(to_i64(run.records_loaded))
        .bind(&run.error_message)
        .bind(&run.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_successful(&self, job_name: &str) -> EtlResult<Option<JobRun>> {
        self.latest_success("job_name", job_name).await
    }

    async fn last_successful_for_table(&self, table: &str) -> EtlResult<Option<JobRun>> {
        self.latest_success("target_table", table).await
    }

    async fn insert_metrics(&self, metrics: &[QualityMetric]) -> EtlResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (metric_id, run_id, table_name, metric_name, metric_value, \
             threshold_value, status, measured_at, details) ",
            self.metrics_table
        ));
        query_builder.push_values(metrics, |mut b, metric| {
            b.push_bind(metric.metric_id)
                .push_bind(metric.run_id)
                .push_bind(&metric.table_name)
                .push_bind(&metric.metric_name)
                .push_bind(metric.metric_value)
                .push_bind(metric.threshold_value)
                .push_bind(metric.status.as_str())
                .push_bind(metric.measured_at)
                .push_bind(&metric.details);
        });
        query_builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn recent_runs(&self, job_name: &str, limit: usize) -> EtlResult<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(&format!(
            "SELECT {} FROM {} WHERE job_name = $1 ORDER BY start_time DESC LIMIT $2",
            RUN_COLUMNS, self.job_log_table
        ))
        .bind(job_name)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobRun::from).collect())
    }
}
