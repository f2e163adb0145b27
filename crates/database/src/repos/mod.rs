//! Database repository implementations

pub mod call_repository;
pub mod chat_repository;
pub mod message_repository;

pub use call_repository::CallRepository;
pub use chat_repository::ChatRepository;
pub use message_repository::MessageRepository;

use crate::types::DatabaseError;

fn invalid(what: &str, value: &str) -> DatabaseError {
    DatabaseError::InvalidData(format!("unknown {what} {value:?}"))
}
