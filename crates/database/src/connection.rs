//! Database connection management

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use quadlink_config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::fs;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a pool with foreign keys, WAL and a busy timeout applied to every connection.
pub async fn prepare_database(config: &DatabaseConfig) -> Result<SqlitePool> {
    ensure_sqlite_dir(&config.url).await?;

    let in_memory = is_in_memory(&config.url);
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("invalid database url {}", config.url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every in-memory connection is its own database.
    let max_connections = if in_memory { 1 } else { config.max_connections.max(1) };

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to database {}", config.url))?;

    info!(url = %config.url, max_connections, "database connection established");
    Ok(pool)
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

async fn ensure_sqlite_dir(url: &str) -> Result<()> {
    if is_in_memory(url) {
        return Ok(());
    }
    let Some(rest) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or(rest);

    if let Some(parent) = Path::new(file).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create sqlite directory {}", parent.display())
            })?;
        }
    }
    Ok(())
}
