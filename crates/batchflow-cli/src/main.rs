//! Batchflow CLI - Main entry point

use batchflow_cli::error::EXIT_JOB_FAILED;
use batchflow_cli::{commands, Cli, Commands};
use batchflow_common::logging::{init_logging, LogConfig, LogLevel};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Environment configures logging; -v raises the level on top of it
    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose > 0 {
        log_config.level = LogLevel::from_verbosity(cli.verbose);
    }
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let code = match execute_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            e.exit_code()
        },
    };

    drop(guard);
    process::exit(code);
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: &Cli) -> batchflow_cli::Result<i32> {
    match &cli.command {
        Commands::Run(args) => {
            let summary = commands::run::run(args).await?;
            Ok(if summary.success { 0 } else { EXIT_JOB_FAILED })
        },

        Commands::Validate { jobs } => commands::validate::run(jobs).await.map(|_| 0),

        Commands::History { job, limit, json } => {
            commands::history::run(job, *limit, *json).await.map(|_| 0)
        },
    }
}
