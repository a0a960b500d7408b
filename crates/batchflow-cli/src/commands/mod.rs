//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod history;
pub mod run;
pub mod validate;

use batchflow_engine::db::{create_pool, DbConfig};
use batchflow_engine::EngineConfig;
use sqlx::PgPool;

use crate::error::{CliError, Result};

/// Engine settings from `ETL_*` variables
pub(crate) fn engine_config() -> Result<EngineConfig> {
    EngineConfig::from_env().map_err(|e| CliError::config(e.to_string()))
}

/// Connect using `DATABASE_URL` and the `DB_*` pool settings
pub(crate) async fn connect() -> Result<PgPool> {
    let config = DbConfig::from_env()?;
    Ok(create_pool(&config).await?)
}
