use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{JobRun, JobStatus, RunStore};
use crate::error::{EtlError, EtlResult};
use crate::quality::QualityMetric;

#[derive(Debug, Default)]
struct State {
    runs: Vec<JobRun>,
    metrics: Vec<QualityMetric>,
}

/// Run store kept in process memory, in insertion order
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<State>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn runs(&self) -> Vec<JobRun> {
        self.state().runs.clone()
    }

    pub fn metrics(&self) -> Vec<QualityMetric> {
        self.state().metrics.clone()
    }

    fn latest_success<F>(&self, matches: F) -> Option<JobRun>
    where
        F: Fn(&JobRun) -> bool,
    {
        // Newest end time wins; unfinished runs sort last, ties go to the later insert
        self.state()
            .runs
            .iter()
            .filter(|run| run.status == JobStatus::Success && matches(run))
            .max_by_key(|run| run.end_time)
            .cloned()
    }
}

fn unknown_run(run_id: Uuid) -> EtlError {
    EtlError::Storage(format!("run {} not found", run_id))
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert_run(&self, run: &JobRun) -> EtlResult<()> {
        self.state().runs.push(run.clone());
        Ok(())
    }

    async fn update_status(&self, run_id: Uuid, status: JobStatus) -> EtlResult<()> {
        let mut state = self.state();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| unknown_run(run_id))?;
        run.status = status;
        Ok(())
    }

    async fn complete_run(&self, run: &JobRun) -> EtlResult<()> {
        let mut state = self.state();
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id)
            .ok_or_else(|| unknown_run(run.run_id))?;
        *stored = run.clone();
        Ok(())
    }

    async fn last_successful(&self, job_name: &str) -> EtlResult<Option<JobRun>> {
        Ok(self.latest_success(|run| run.job_name == job_name))
    }

    async fn last_successful_for_table(&self, table: &str) -> EtlResult<Option<JobRun>> {
        Ok(self.latest_success(|run| run.target_table == table))
    }

    async fn insert_metrics(&self, metrics: &[QualityMetric]) -> EtlResult<()> {
        self.state().metrics.extend_from_slice(metrics);
        Ok(())
    }

    async fn recent_runs(&self, job_name: &str, limit: usize) -> EtlResult<Vec<JobRun>> {
        Ok(self
            .state()
            .runs
            .iter()
            .rev()
            .filter(|run| run.job_name == job_name)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn finished(job_name: &str, hour: Option<u32>, status: JobStatus) -> JobRun {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        JobRun {
            run_id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            target_table: "raw_data.users".to_string(),
            start_time: start,
            end_time: hour.map(|h| start + Duration::hours(i64::from(h))),
            status,
            records_processed: 0,
            records_loaded: 0,
            error_message: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    #[tokio::test]
    async fn test_last_successful_orders_by_end_time() {
        let store = MemoryRunStore::new();
        let late = finished("users", Some(9), JobStatus::Success);
        let early = finished("users", Some(3), JobStatus::Success);
        let unfinished = finished("users", None, JobStatus::Success);
        let failed = finished("users", Some(12), JobStatus::Failed);
        for run in [&late, &early, &unfinished, &failed] {
            store.insert_run(run).await.unwrap();
        }

        let found = store.last_successful("users").await.unwrap().unwrap();
        assert_eq!(found.run_id, late.run_id);
        let found = store
            .last_successful_for_table("raw_data.users")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.run_id, late.run_id);
    }

    #[tokio::test]
    async fn test_last_successful_tie_goes_to_later_insert() {
        let store = MemoryRunStore::new();
        let first = finished("users", Some(5), JobStatus::Success);
        let second = finished("users", Some(5), JobStatus::Success);
        store.insert_run(&first).await.unwrap();
        store.insert_run(&second).await.unwrap();

        let found = store.last_successful("users").await.unwrap().unwrap();
        assert_eq!(found.run_id, second.run_id);
        assert!(store.last_successful("orders").await.unwrap().is_none());
    }
}
