//! Postgres connection pool

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::{EtlError, EtlResult};

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
        }
    }

    /// Read `DATABASE_URL` and the `DB_*` pool settings
    pub fn from_env() -> EtlResult<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| EtlError::config("DATABASE_URL not set"))?;

        let mut config = Self::new(url);

        if let Some(max) = env_parse("DB_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(min) = env_parse("DB_MIN_CONNECTIONS") {
            config.min_connections = min;
        }
        if let Some(timeout) = env_parse("DB_CONNECT_TIMEOUT") {
            config.connect_timeout_secs = timeout;
        }
        if let Some(idle) = env_parse("DB_IDLE_TIMEOUT") {
            config.idle_timeout_secs = Some(idle);
        }
        if let Some(lifetime) = env_parse("DB_MAX_LIFETIME") {
            config.max_lifetime_secs = Some(lifetime);
        }

        if config.min_connections > config.max_connections {
            return Err(EtlError::config(format!(
                "DB_MIN_CONNECTIONS ({}) cannot exceed DB_MAX_CONNECTIONS ({})",
                config.min_connections, config.max_connections
            )));
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

pub async fn create_pool(config: &DbConfig) -> EtlResult<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    if let Some(max_lifetime) = config.max_lifetime_secs {
        options = options.max_lifetime(Duration::from_secs(max_lifetime));
    }

    let pool = options.connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> EtlResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
