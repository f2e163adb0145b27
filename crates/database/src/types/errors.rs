//! Error types for the database layer

use quadlink_realtime::repositories::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    #[error("Database query error: {0}")]
    QueryError(String),

    #[error("Database migration error: {0}")]
    MigrationError(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Duplicate entity: {0}")]
    Duplicate(String),

    /// A stored value could not be mapped back into a domain type.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DatabaseError::Duplicate(db.message().to_string())
            }
            sqlx::Error::RowNotFound => DatabaseError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Duplicate(what) => StoreError::Duplicate(what),
            DatabaseError::NotFound(what) => StoreError::NotFound(what),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
