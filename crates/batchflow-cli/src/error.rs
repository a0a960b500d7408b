//! Error types for the batchflow CLI
//!
//! Messages are user-facing and say what to check next.

use batchflow_engine::EtlError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Exit code for a run where at least one job failed
pub const EXIT_JOB_FAILED: i32 = 1;

/// Exit code for configuration problems found before any job ran
pub const EXIT_CONFIG: i32 = 2;

#[derive(Error, Debug)]
pub enum CliError {
    /// Job file or environment is missing or invalid
    #[error("Configuration error: {0}. Run 'batchflow validate --jobs <file>' to check the job file.")]
    Config(String),

    /// History and non-dry runs need a database
    #[error("Database error: {0}. Check DATABASE_URL and that the database is reachable.")]
    Database(String),

    /// Engine failure outside any single job
    #[error("Engine error: {0}")]
    Engine(EtlError),

    /// Summary could not be rendered as JSON
    #[error("Failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => EXIT_CONFIG,
            _ => EXIT_JOB_FAILED,
        }
    }
}

impl From<EtlError> for CliError {
    fn from(err: EtlError) -> Self {
        match err {
            EtlError::Config(msg) => CliError::Config(msg),
            EtlError::Database(e) => CliError::Database(e.to_string()),
            other => CliError::Engine(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_errors_exit_with_two() {
        let err = CliError::from(EtlError::config("job 'users': unknown job"));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
        assert!(err.to_string().contains("batchflow validate"));
    }

    #[test]
    fn test_other_engine_errors_exit_with_one() {
        let err = CliError::from(EtlError::Network("connection reset".to_string()));
        assert_eq!(err.exit_code(), EXIT_JOB_FAILED);
        assert_eq!(err.to_string(), "Engine error: Network error: connection reset");
    }
}
