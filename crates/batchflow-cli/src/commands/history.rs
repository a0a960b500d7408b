//! `batchflow history` command implementation

use batchflow_engine::{PgRunStore, RunStore};

use crate::commands::{connect, engine_config};
use crate::error::Result;
use crate::output;

/// Show the most recent runs of `job`, newest first
pub async fn run(job: &str, limit: usize, json: bool) -> Result<()> {
    let config = engine_config()?;
    let pool = connect().await?;
    let store = PgRunStore::with_tables(pool, &config.job_log_table, &config.metrics_table)?;

    let runs = store.recent_runs(job, limit).await?;

    if json {
        return output::print_json(&runs);
    }

    if runs.is_empty() {
        println!("No runs recorded for job '{}'.", job);
        return Ok(());
    }

    println!("{}", output::history_table(&runs));
    Ok(())
}
