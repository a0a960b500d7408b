//! `batchflow run` command implementation
//!
//! Builds an orchestrator over Postgres (or in-memory stores with
//! `--dry-run`), runs the selected jobs and prints the summary. Ctrl-C
//! cancels the run; the summary still reports every job.

use batchflow_engine::{
    JobConfigSet, MemoryRunStore, MemoryTableStore, PgRunStore, PgTableStore,
    PipelineOrchestrator, RunSummary, S3ObjectStore, StorageConfig,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands::{connect, engine_config};
use crate::error::{CliError, Result};
use crate::output;
use crate::RunArgs;

pub async fn run(args: &RunArgs) -> Result<RunSummary> {
    let mut jobs = JobConfigSet::from_path(&args.jobs)?;
    if !args.only.is_empty() {
        jobs = jobs.select(&args.only)?;
    }

    let mut config = engine_config()?;
    if let Some(concurrency) = args.concurrency {
        config = config.with_max_concurrent_jobs(concurrency);
        config.validate().map_err(|e| CliError::config(e.to_string()))?;
    }

    let orchestrator = if args.dry_run {
        info!(jobs = jobs.len(), "Dry run with in-memory stores");
        PipelineOrchestrator::new(
            config,
            Arc::new(MemoryTableStore::auto_create()),
            Arc::new(MemoryRunStore::new()),
        )
    } else {
        let pool = connect().await?;
        let run_store =
            PgRunStore::with_tables(pool.clone(), &config.job_log_table, &config.metrics_table)?;
        run_store.ensure_tables().await?;

        let archive_enabled = config.archive_enabled;
        let orchestrator =
            PipelineOrchestrator::new(config, Arc::new(PgTableStore::new(pool)), Arc::new(run_store));

        if archive_enabled {
            let storage = StorageConfig::from_env().map_err(|e| CliError::config(e.to_string()))?;
            info!(bucket = %storage.bucket, "Archiving raw batches");
            orchestrator.with_archive(Arc::new(S3ObjectStore::new(storage)))
        } else {
            orchestrator
        }
    };

    cancel_on_ctrl_c(orchestrator.cancellation_token());

    let summary = orchestrator.run(&jobs).await?;

    if args.json {
        output::print_json(&summary)?;
    } else {
        output::print_summary(&summary);
    }

    Ok(summary)
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    token.cancel();
                }
            }
            _ = token.cancelled() => {}
        }
    });
}
