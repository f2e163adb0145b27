//! Quadlink Database Crate
//!
//! SQLite persistence for the Quadlink backend: connection management,
//! embedded migrations, repositories, and the [`SqliteStore`] that the
//! real-time core uses as its persistence service.

use quadlink_config::DatabaseConfig;
use sqlx::SqlitePool;

pub mod connection;
pub mod migrations;
pub mod repos;
pub mod store;
pub mod types;

pub use connection::prepare_database;
pub use migrations::run_migrations;
pub use repos::{CallRepository, ChatRepository, MessageRepository};
pub use store::SqliteStore;
pub use types::{DatabaseError, DatabaseResult};

/// Open the pool and bring the schema up to date.
pub async fn initialize_database(config: &DatabaseConfig) -> DatabaseResult<SqlitePool> {
    let pool = prepare_database(config)
        .await
        .map_err(|e| DatabaseError::ConnectionError(format!("{e:#}")))?;

    run_migrations(&pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("{e:#}")))?;

    Ok(pool)
}
