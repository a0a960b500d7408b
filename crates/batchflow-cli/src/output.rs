//! Table and JSON rendering for command output

use batchflow_engine::{JobRun, RunSummary};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

const ERROR_WIDTH: usize = 80;

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= ERROR_WIDTH {
        message.to_string()
    } else {
        let head: String = message.chars().take(ERROR_WIDTH - 3).collect();
        format!("{}...", head)
    }
}

/// One row per job, in declaration order
pub fn summary_table(summary: &RunSummary) -> Table {
    let mut table = new_table(vec!["Job", "Status", "Processed", "Loaded", "Run ID", "Error"]);

    for job in &summary.jobs {
        let status = if job.skipped {
            format!("{} (skipped)", job.status)
        } else {
            job.status.to_string()
        };
        table.add_row(vec![
            job.job_name.clone(),
            status,
            job.records_processed.to_string(),
            job.records_loaded.to_string(),
            job.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            job.error_message.as_deref().map(truncate).unwrap_or_default(),
        ]);
    }

    table
}

pub fn print_summary(summary: &RunSummary) {
    println!("{}", summary_table(summary));
    let elapsed = summary.run_finished_at - summary.run_started_at;
    println!(
        "{} job(s) in {:.1}s: {}",
        summary.jobs.len(),
        elapsed.num_milliseconds() as f64 / 1000.0,
        if summary.success { "success" } else { "failed" }
    );
}

pub fn history_table(runs: &[JobRun]) -> Table {
    let mut table = new_table(vec![
        "Run ID", "Status", "Started", "Finished", "Processed", "Loaded", "Error",
    ]);

    for run in runs {
        table.add_row(vec![
            run.run_id.to_string(),
            run.status.to_string(),
            run.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.end_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.records_processed.to_string(),
            run.records_loaded.to_string(),
            run.error_message.as_deref().map(truncate).unwrap_or_default(),
        ]);
    }

    table
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> crate::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
