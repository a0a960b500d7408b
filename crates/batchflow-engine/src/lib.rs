//! Batchflow Engine
//!
//! Configuration-driven batch ETL: extract a bounded batch from a file or
//! HTTP source, transform it through declarative steps, load it in committed
//! chunks and record run metadata and data-quality metrics.
//!
//! # Overview
//!
//! - [`jobs`]: job descriptors loaded from YAML or TOML
//! - [`extract`], [`transform`], [`load`], [`quality`]: the pipeline stages
//! - [`joblog`]: per-run lifecycle records
//! - [`orchestrator`]: runs jobs to a [`RunSummary`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use batchflow_engine::{
//!     EngineConfig, JobConfigSet, MemoryRunStore, MemoryTableStore, PipelineOrchestrator,
//! };
//!
//! # async fn example() -> batchflow_engine::EtlResult<()> {
//! let jobs = JobConfigSet::from_path("jobs.yaml")?;
//! let orchestrator = PipelineOrchestrator::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryTableStore::auto_create()),
//!     Arc::new(MemoryRunStore::new()),
//! );
//! let summary = orchestrator.run(&jobs).await?;
//! println!("success: {}", summary.success);
//! # Ok(())
//! # }
//! ```
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod joblog;
pub mod jobs;
pub mod load;
pub mod orchestrator;
pub mod quality;
pub mod retry;
pub mod schema;
pub mod transform;

pub use archive::{MemoryObjectStore, ObjectStore, S3ObjectStore, StorageConfig};
pub use config::EngineConfig;
pub use error::{EtlError, EtlResult};
pub use joblog::{JobLogger, JobRun, JobStatus, MemoryRunStore, PgRunStore, RunStore};
pub use jobs::{JobConfigSet, JobDescriptor, SourceSpec};
pub use load::{LoadResult, LoadStrategy, Loader, MemoryTableStore, PgTableStore, TableStore};
pub use orchestrator::{JobSummary, PipelineOrchestrator, RunSummary};
pub use retry::RetryPolicy;
