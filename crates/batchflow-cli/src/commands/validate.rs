//! `batchflow validate` command implementation
//!
//! Parses a job file and reports every problem at once without touching any
//! source or database.

use batchflow_engine::JobConfigSet;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use std::path::Path;
use tracing::info;

use crate::error::Result;

pub async fn run(jobs: &Path) -> Result<()> {
    let set = JobConfigSet::from_path(jobs)?;
    info!(path = %jobs.display(), jobs = set.len(), "Job file is valid");

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Job", "Source", "Target table", "Strategy", "Steps"]);

    for job in set.iter() {
        table.add_row(vec![
            job.job_name.clone(),
            job.source.kind().to_string(),
            job.target_table.clone(),
            job.load_strategy.to_string(),
            job.transform_spec.len().to_string(),
        ]);
    }

    println!("{}", table);
    println!("{}: {} job(s) valid", jobs.display(), set.len());
    Ok(())
}
