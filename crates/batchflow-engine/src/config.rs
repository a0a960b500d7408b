//! Engine configuration from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::retry::{
    RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_GROWTH_FACTOR, DEFAULT_JITTER_MS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
};

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Rows written per committed chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Jobs run one after another unless raised.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 1;

/// Per-stage timeout in seconds (0 disables).
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 0;

/// Table receiving one row per job run.
pub const DEFAULT_JOB_LOG_TABLE: &str = "analytics.etl_job_logs";

/// Table receiving quality metrics.
pub const DEFAULT_METRICS_TABLE: &str = "analytics.data_quality_metrics";

/// Engine-wide settings shared by every job in a run
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub max_concurrent_jobs: usize,
    pub stage_timeout: Option<Duration>,
    pub job_log_table: String,
    pub metrics_table: String,
    pub archive_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            stage_timeout: None,
            job_log_table: DEFAULT_JOB_LOG_TABLE.to_string(),
            metrics_table: DEFAULT_METRICS_TABLE.to_string(),
            archive_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Load from `ETL_*` environment variables (after reading `.env`)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let stage_timeout_secs: u64 = env_or("ETL_STAGE_TIMEOUT_SECS", DEFAULT_STAGE_TIMEOUT_SECS);

        let config = Self {
            chunk_size: env_or("ETL_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            retry: RetryPolicy {
                max_attempts: env_or("ETL_RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                base_delay: Duration::from_millis(env_or(
                    "ETL_RETRY_BASE_DELAY_MS",
                    DEFAULT_BASE_DELAY_MS,
                )),
                growth_factor: env_or("ETL_RETRY_GROWTH_FACTOR", DEFAULT_GROWTH_FACTOR),
                max_delay: Duration::from_millis(env_or(
                    "ETL_RETRY_MAX_DELAY_MS",
                    DEFAULT_MAX_DELAY_MS,
                )),
                jitter: Duration::from_millis(env_or("ETL_RETRY_JITTER_MS", DEFAULT_JITTER_MS)),
            },
            max_concurrent_jobs: env_or("ETL_MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT_JOBS),
            stage_timeout: (stage_timeout_secs > 0).then(|| Duration::from_secs(stage_timeout_secs)),
            job_log_table: std::env::var("ETL_JOB_LOG_TABLE")
                .unwrap_or_else(|_| DEFAULT_JOB_LOG_TABLE.to_string()),
            metrics_table: std::env::var("ETL_METRICS_TABLE")
                .unwrap_or_else(|_| DEFAULT_METRICS_TABLE.to_string()),
            archive_enabled: env_or("ETL_ARCHIVE_ENABLED", false),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("ETL_CHUNK_SIZE must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("ETL_RETRY_MAX_ATTEMPTS must be at least 1");
        }

        if !self.retry.growth_factor.is_finite() || self.retry.growth_factor < 1.0 {
            anyhow::bail!(
                "ETL_RETRY_GROWTH_FACTOR must be a finite number >= 1.0, got {}",
                self.retry.growth_factor
            );
        }

        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("ETL_MAX_CONCURRENT_JOBS must be greater than 0");
        }

        for (var, table) in [
            ("ETL_JOB_LOG_TABLE", &self.job_log_table),
            ("ETL_METRICS_TABLE", &self.metrics_table),
        ] {
            if !crate::jobs::is_qualified_identifier(table) {
                anyhow::bail!("{} is not a valid table name: '{}'", var, table);
            }
        }

        Ok(())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.job_log_table, "analytics.etl_job_logs");
        assert!(config.stage_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("ETL_CHUNK_SIZE", "250");
        std::env::set_var("ETL_RETRY_MAX_ATTEMPTS", "5");
        std::env::set_var("ETL_STAGE_TIMEOUT_SECS", "90");
        std::env::set_var("ETL_MAX_CONCURRENT_JOBS", "4");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.max_concurrent_jobs, 4);

        std::env::remove_var("ETL_CHUNK_SIZE");
        std::env::remove_var("ETL_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("ETL_STAGE_TIMEOUT_SECS");
        std::env::remove_var("ETL_MAX_CONCURRENT_JOBS");
    }

    #[test]
    #[serial]
    fn test_zero_chunk_size_rejected() {
        std::env::set_var("ETL_CHUNK_SIZE", "0");
        assert!(EngineConfig::from_env().is_err());
        std::env::remove_var("ETL_CHUNK_SIZE");
    }

    #[test]
    fn test_bad_table_name_rejected() {
        let config = EngineConfig {
            metrics_table: "analytics.metrics; drop".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
