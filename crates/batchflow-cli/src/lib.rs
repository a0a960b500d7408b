//! Batchflow CLI Library
//!
//! Command-line front end for the batch ETL engine.
//!
//! - **Run**: execute the jobs of a job file (`batchflow run`)
//! - **Validate**: check a job file without touching any source (`batchflow validate`)
//! - **History**: show recent runs of a job from the run log (`batchflow history`)
//!
//! Exit codes: 0 when every job succeeded (or was partial/skipped), 1 when a
//! job failed, 2 for configuration errors.
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod error;
pub mod output;

pub use error::{CliError, Result};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Batchflow - configuration-driven batch ETL
#[derive(Parser, Debug)]
#[command(name = "batchflow")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the jobs of a job file
    Run(RunArgs),

    /// Parse and validate a job file
    Validate {
        /// Job file (.yaml, .yml or .toml)
        #[arg(short, long, env = "BATCHFLOW_JOBS")]
        jobs: PathBuf,
    },

    /// Show recent runs of a job
    History {
        /// Job name
        #[arg(short, long)]
        job: String,

        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Print runs as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Job file (.yaml, .yml or .toml)
    #[arg(short, long, env = "BATCHFLOW_JOBS")]
    pub jobs: PathBuf,

    /// Run only these jobs (repeatable)
    #[arg(long = "only", value_name = "JOB")]
    pub only: Vec<String>,

    /// Use in-memory stores: tables are created from the batch columns and nothing is archived
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum number of jobs running at once (overrides ETL_MAX_CONCURRENT_JOBS)
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "batchflow", "-vv", "run", "--jobs", "jobs.yaml", "--only", "users", "--only",
            "orders", "--dry-run", "--concurrency", "4",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.jobs, PathBuf::from("jobs.yaml"));
        assert_eq!(args.only, vec!["users".to_string(), "orders".to_string()]);
        assert!(args.dry_run);
        assert_eq!(args.concurrency, Some(4));
        assert!(!args.json);
    }

    #[test]
    fn test_history_default_limit() {
        let cli = Cli::try_parse_from(["batchflow", "history", "--job", "orders"]).unwrap();
        match cli.command {
            Commands::History { job, limit, json } => {
                assert_eq!(job, "orders");
                assert_eq!(limit, 10);
                assert!(!json);
            },
            other => panic!("unexpected command {other:?}"),
        }
    }
}
