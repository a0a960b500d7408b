//! Engine error types

use batchflow_common::BatchError;
use thiserror::Error;

use crate::joblog::JobStatus;

/// Result alias for engine operations
pub type EtlResult<T> = std::result::Result<T, EtlError>;

/// SQLSTATE codes worth retrying: serialization failure, deadlock, admin shutdown
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "57P01"];

/// Errors raised while running a job
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source not found: {path}")]
    SourceNotFound { path: String },

    #[error("Parse error in {location}: {message}")]
    Parse { location: String, message: String },

    #[error("Source error: {message}")]
    Source { status: Option<u16>, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Load error: {message}")]
    Load { message: String, transient: bool },

    #[error("Quality check failed: {0}")]
    QualityViolation(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

impl EtlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    pub fn parse(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient_load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Only network faults, transient load faults and a narrow set of
    /// database conditions qualify; everything else is structural.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Network(_) => true,
            EtlError::Load { transient, .. } => *transient,
            EtlError::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, EtlError::Config(_))
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}
