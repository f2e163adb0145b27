//! Database migrations

use anyhow::Context;
use sqlx::migrate::Migrator;
use sqlx::SqlitePool;
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("database migrations failed")?;
    info!(count = MIGRATOR.iter().count(), "database migrations applied");
    Ok(())
}
