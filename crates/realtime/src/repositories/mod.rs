//! Collaborator contracts consumed by the real-time core.
//!
//! The core never talks to a database or an identity provider directly; it
//! goes through these traits. `quadlink-database` and `quadlink-auth` provide
//! the SQLite implementations, [`memory`] provides in-process ones.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::types::{
    CallLogEntry, Chat, ChatId, ChatSettings, Member, Message, MessageId, UserId,
};

pub use memory::{InMemoryStore, RecordingNotifier, StaticDirectory};

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait PersistenceService: Send + Sync + 'static {
    /// Chat metadata without members; see [`PersistenceService::load_members`].
    async fn load_chat(&self, chat_id: &str) -> StoreResult<Option<Chat>>;

    /// Members ordered by join time.
    async fn load_members(&self, chat_id: &str) -> StoreResult<Vec<Member>>;

    async fn chats_for_member(&self, user_id: UserId) -> StoreResult<Vec<ChatId>>;

    async fn find_direct_chat(&self, a: UserId, b: UserId) -> StoreResult<Option<ChatId>>;

    /// Fails with [`StoreError::Duplicate`] when a direct chat for the pair already exists.
    async fn create_chat(&self, chat: &Chat, members: &[Member]) -> StoreResult<()>;

    async fn add_member(&self, chat_id: &str, member: &Member) -> StoreResult<()>;

    async fn remove_member(&self, chat_id: &str, user_id: UserId) -> StoreResult<()>;

    async fn update_settings(&self, chat_id: &str, settings: &ChatSettings) -> StoreResult<()>;

    async fn save_message(&self, message: &Message) -> StoreResult<()>;

    async fn upsert_last_message(
        &self,
        chat_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn load_message(&self, message_id: &str) -> StoreResult<Option<Message>>;

    /// Messages with a sequence strictly greater than `after_sequence`, oldest first.
    /// Without a cursor the newest `limit` messages are returned, still oldest first.
    async fn load_messages(
        &self,
        chat_id: &str,
        after_sequence: Option<u64>,
        limit: u32,
    ) -> StoreResult<Vec<Message>>;

    /// Highest sequence stored for the chat, zero when empty.
    async fn last_sequence(&self, chat_id: &str) -> StoreResult<u64>;

    /// Records `user_id` as having read the given messages and returns the ids
    /// that were not already marked. The reader's own messages and ids that do
    /// not belong to the chat are ignored.
    async fn mark_read(
        &self,
        chat_id: &str,
        user_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> StoreResult<Vec<MessageId>>;

    async fn record_call(&self, entry: &CallLogEntry) -> StoreResult<()>;
}

#[async_trait]
pub trait DirectoryService: Send + Sync + 'static {
    /// `Ok(None)` means the credential is invalid or expired.
    async fn verify_credential(&self, token: &str) -> StoreResult<Option<UserId>>;

    async fn contacts_of(&self, user_id: UserId) -> StoreResult<Vec<UserId>>;
}

/// Told about recipients that had no live connection when a message landed.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notification_warranted(&self, recipient: UserId, message: &Message);
}

/// Default notifier: records the decision in the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notification_warranted(&self, recipient: UserId, message: &Message) {
        info!(
            recipient,
            chat_id = %message.chat_id,
            message_id = %message.id,
            "Notification warranted for offline member"
        );
    }
}
