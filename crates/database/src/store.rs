//! [`PersistenceService`] backed by SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quadlink_realtime::repositories::{PersistenceService, StoreResult};
use quadlink_realtime::types::{
    CallLogEntry, Chat, ChatId, ChatSettings, Member, Message, MessageId, UserId,
};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::repos::{CallRepository, ChatRepository, MessageRepository};
use crate::types::DatabaseError;

#[derive(Clone)]
pub struct SqliteStore {
    pub chats: ChatRepository,
    pub messages: MessageRepository,
    pub calls: CallRepository,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            chats: ChatRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            calls: CallRepository::new(pool),
        }
    }
}

fn logged(operation: &'static str) -> impl FnOnce(DatabaseError) -> quadlink_realtime::StoreError {
    move |err| {
        match &err {
            DatabaseError::Duplicate(_) | DatabaseError::NotFound(_) => {
                debug!(operation, error = %err, "Store rejected write")
            }
            _ => warn!(operation, error = %err, "Store operation failed"),
        }
        err.into()
    }
}

#[async_trait]
impl PersistenceService for SqliteStore {
    async fn load_chat(&self, chat_id: &str) -> StoreResult<Option<Chat>> {
        self.chats.find(chat_id).await.map_err(logged("load_chat"))
    }

    async fn load_members(&self, chat_id: &str) -> StoreResult<Vec<Member>> {
        self.chats.members(chat_id).await.map_err(logged("load_members"))
    }

    async fn chats_for_member(&self, user_id: UserId) -> StoreResult<Vec<ChatId>> {
        self.chats
            .chats_for_member(user_id)
            .await
            .map_err(logged("chats_for_member"))
    }

    async fn find_direct_chat(&self, a: UserId, b: UserId) -> StoreResult<Option<ChatId>> {
        self.chats
            .find_direct(a, b)
            .await
            .map_err(logged("find_direct_chat"))
    }

    async fn create_chat(&self, chat: &Chat, members: &[Member]) -> StoreResult<()> {
        self.chats
            .create(chat, members)
            .await
            .map_err(logged("create_chat"))
    }

    async fn add_member(&self, chat_id: &str, member: &Member) -> StoreResult<()> {
        self.chats
            .add_member(chat_id, member)
            .await
            .map_err(logged("add_member"))
    }

    async fn remove_member(&self, chat_id: &str, user_id: UserId) -> StoreResult<()> {
        self.chats
            .remove_member(chat_id, user_id)
            .await
            .map_err(logged("remove_member"))
    }

    async fn update_settings(&self, chat_id: &str, settings: &ChatSettings) -> StoreResult<()> {
        self.chats
            .update_settings(chat_id, settings)
            .await
            .map_err(logged("update_settings"))
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        self.messages
            .insert(message)
            .await
            .map_err(logged("save_message"))
    }

    async fn upsert_last_message(
        &self,
        chat_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.chats
            .set_last_message(chat_id, message_id, at)
            .await
            .map_err(logged("upsert_last_message"))
    }

    async fn load_message(&self, message_id: &str) -> StoreResult<Option<Message>> {
        self.messages
            .find(message_id)
            .await
            .map_err(logged("load_message"))
    }

    async fn load_messages(
        &self,
        chat_id: &str,
        after_sequence: Option<u64>,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        self.messages
            .page(chat_id, after_sequence, limit)
            .await
            .map_err(logged("load_messages"))
    }

    async fn last_sequence(&self, chat_id: &str) -> StoreResult<u64> {
        self.messages
            .last_sequence(chat_id)
            .await
            .map_err(logged("last_sequence"))
    }

    async fn mark_read(
        &self,
        chat_id: &str,
        user_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> StoreResult<Vec<MessageId>> {
        self.messages
            .mark_read(chat_id, user_id, message_ids, read_at)
            .await
            .map_err(logged("mark_read"))
    }

    async fn record_call(&self, entry: &CallLogEntry) -> StoreResult<()> {
        self.calls.record(entry).await.map_err(logged("record_call"))
    }
}
