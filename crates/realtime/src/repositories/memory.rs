//! In-process collaborator implementations.
//!
//! Used by the test-suite and by embedders that do not need durability.
//! `InMemoryStore` can be switched into an unavailable state to exercise the
//! failure paths of the pipeline.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::{DirectoryService, Notifier, PersistenceService, StoreError, StoreResult};
use crate::types::{
    CallLogEntry, Chat, ChatId, ChatKind, ChatSettings, Member, Message, MessageId, ReadReceipt,
    UserId,
};

#[derive(Default)]
struct MemoryState {
    chats: HashMap<ChatId, Chat>,
    members: HashMap<ChatId, Vec<Member>>,
    direct_index: HashMap<String, ChatId>,
    messages: HashMap<MessageId, Message>,
    chat_messages: HashMap<ChatId, Vec<MessageId>>,
    calls: Vec<CallLogEntry>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    fail_last_message: AtomicBool,
    save_latency_ms: AtomicU64,
    member_load_latency_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle every operation into returning [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make only `upsert_last_message` fail.
    pub fn fail_last_message_updates(&self, fail: bool) {
        self.fail_last_message.store(fail, Ordering::SeqCst);
    }

    /// Delay every `save_message` call, widening race windows in tests.
    pub fn set_save_latency(&self, latency: Duration) {
        self.save_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay `chats_for_member` after it has read the state, so a caller can
    /// observe a result that is already stale.
    pub fn set_member_load_latency(&self, latency: Duration) {
        self.member_load_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn recorded_calls(&self) -> Vec<CallLogEntry> {
        self.state.read().await.calls.clone()
    }

    pub async fn stored_chat(&self, chat_id: &str) -> Option<Chat> {
        self.state.read().await.chats.get(chat_id).cloned()
    }

    pub async fn message_count(&self, chat_id: &str) -> usize {
        self.state
            .read()
            .await
            .chat_messages
            .get(chat_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for InMemoryStore {
    async fn load_chat(&self, chat_id: &str) -> StoreResult<Option<Chat>> {
        self.check_available()?;
        Ok(self.state.read().await.chats.get(chat_id).cloned())
    }

    async fn load_members(&self, chat_id: &str) -> StoreResult<Vec<Member>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .members
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn chats_for_member(&self, user_id: UserId) -> StoreResult<Vec<ChatId>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut chats: Vec<ChatId> = state
            .members
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m.user_id == user_id))
            .map(|(chat_id, _)| chat_id.clone())
            .collect();
        drop(state);
        chats.sort();

        let latency = self.member_load_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(chats)
    }

    async fn find_direct_chat(&self, a: UserId, b: UserId) -> StoreResult<Option<ChatId>> {
        self.check_available()?;
        let key = Chat::direct_key(a, b);
        Ok(self.state.read().await.direct_index.get(&key).cloned())
    }

    async fn create_chat(&self, chat: &Chat, members: &[Member]) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;

        if state.chats.contains_key(&chat.id) {
            return Err(StoreError::Duplicate(format!("chat {}", chat.id)));
        }

        if chat.kind == ChatKind::Direct {
            let [first, second] = members else {
                return Err(StoreError::Unavailable(
                    "direct chats require exactly two members".into(),
                ));
            };
            let key = Chat::direct_key(first.user_id, second.user_id);
            if state.direct_index.contains_key(&key) {
                return Err(StoreError::Duplicate(format!("direct chat {key}")));
            }
            state.direct_index.insert(key, chat.id.clone());
        }

        state.chats.insert(chat.id.clone(), chat.clone());
        state.members.insert(chat.id.clone(), members.to_vec());
        Ok(())
    }

    async fn add_member(&self, chat_id: &str, member: &Member) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let members = state
            .members
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        if members.iter().any(|m| m.user_id == member.user_id) {
            return Err(StoreError::Duplicate(format!("member {}", member.user_id)));
        }
        members.push(member.clone());
        Ok(())
    }

    async fn remove_member(&self, chat_id: &str, user_id: UserId) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(members) = state.members.get_mut(chat_id) {
            members.retain(|m| m.user_id != user_id);
        }
        Ok(())
    }

    async fn update_settings(&self, chat_id: &str, settings: &ChatSettings) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        chat.settings = *settings;
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        let latency = self.save_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_available()?;

        let mut state = self.state.write().await;
        let taken = state
            .chat_messages
            .get(&message.chat_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.messages.get(id))
            .is_some_and(|last| last.sequence >= message.sequence);
        if taken || state.messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(format!(
                "message {} (sequence {})",
                message.id, message.sequence
            )));
        }

        state
            .chat_messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message.id.clone());
        state.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn upsert_last_message(
        &self,
        chat_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        if self.fail_last_message.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("last-message update rejected".into()));
        }
        let mut state = self.state.write().await;
        if let Some(chat) = state.chats.get_mut(chat_id) {
            chat.last_message_id = Some(message_id.to_string());
            chat.last_message_at = Some(at);
        }
        Ok(())
    }

    async fn load_message(&self, message_id: &str) -> StoreResult<Option<Message>> {
        self.check_available()?;
        Ok(self.state.read().await.messages.get(message_id).cloned())
    }

    async fn load_messages(
        &self,
        chat_id: &str,
        after_sequence: Option<u64>,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        self.check_available()?;
        let state = self.state.read().await;
        let ordered: Vec<&Message> = state
            .chat_messages
            .get(chat_id)
            .map(|ids| ids.iter().filter_map(|id| state.messages.get(id)).collect())
            .unwrap_or_default();

        let limit = limit as usize;
        let page: Vec<Message> = match after_sequence {
            Some(after) => ordered
                .into_iter()
                .filter(|m| m.sequence > after)
                .take(limit)
                .cloned()
                .collect(),
            None => {
                let skip = ordered.len().saturating_sub(limit);
                ordered.into_iter().skip(skip).cloned().collect()
            }
        };
        Ok(page)
    }

    async fn last_sequence(&self, chat_id: &str) -> StoreResult<u64> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .chat_messages
            .get(chat_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.messages.get(id))
            .map(|m| m.sequence)
            .unwrap_or(0))
    }

    async fn mark_read(
        &self,
        chat_id: &str,
        user_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> StoreResult<Vec<MessageId>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let mut newly = Vec::new();

        for id in message_ids {
            let Some(message) = state.messages.get_mut(id) else {
                continue;
            };
            if message.chat_id != chat_id || message.sender_id == user_id {
                continue;
            }
            if message.read_by.iter().any(|r| r.user_id == user_id) {
                continue;
            }
            message.read_by.push(ReadReceipt { user_id, read_at });
            newly.push(id.clone());
        }

        Ok(newly)
    }

    async fn record_call(&self, entry: &CallLogEntry) -> StoreResult<()> {
        self.check_available()?;
        self.state.write().await.calls.push(entry.clone());
        Ok(())
    }
}

/// Token table plus contact graph.
#[derive(Default)]
pub struct StaticDirectory {
    tokens: RwLock<HashMap<String, UserId>>,
    contacts: RwLock<HashMap<UserId, BTreeSet<UserId>>>,
    unavailable: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue_token(&self, token: impl Into<String>, user_id: UserId) {
        self.tokens.write().await.insert(token.into(), user_id);
    }

    pub async fn revoke_token(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Make two identities mutual contacts.
    pub async fn connect(&self, a: UserId, b: UserId) {
        let mut contacts = self.contacts.write().await;
        contacts.entry(a).or_default().insert(b);
        contacts.entry(b).or_default().insert(a);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("directory switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn verify_credential(&self, token: &str) -> StoreResult<Option<UserId>> {
        self.check_available()?;
        Ok(self.tokens.read().await.get(token).copied())
    }

    async fn contacts_of(&self, user_id: UserId) -> StoreResult<Vec<UserId>> {
        self.check_available()?;
        Ok(self
            .contacts
            .read()
            .await
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}

/// Notifier that remembers every decision.
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<(UserId, MessageId)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notified(&self) -> Vec<(UserId, MessageId)> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notification_warranted(&self, recipient: UserId, message: &Message) {
        self.notified
            .lock()
            .await
            .push((recipient, message.id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberRole, MessageKind};

    fn message(chat_id: &str, id: &str, sequence: u64, sender_id: UserId) -> Message {
        Message {
            id: id.into(),
            chat_id: chat_id.into(),
            sequence,
            sender_id,
            content: format!("message {sequence}"),
            kind: MessageKind::Text,
            reply_to: None,
            attachment: None,
            read_by: Vec::new(),
            edited: false,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    fn group(id: &str) -> Chat {
        Chat {
            id: id.into(),
            kind: ChatKind::Group,
            name: Some("group".into()),
            settings: ChatSettings::default(),
            created_by: 1,
            created_at: Utc::now(),
            last_message_id: None,
            last_message_at: None,
        }
    }

    #[tokio::test]
    async fn mark_read_skips_own_foreign_and_repeated_ids() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .create_chat(&group("c1"), &[Member::new(1, MemberRole::Owner, now)])
            .await
            .unwrap();
        store.create_chat(&group("c2"), &[]).await.unwrap();
        store.save_message(&message("c1", "m1", 1, 2)).await.unwrap();
        store.save_message(&message("c1", "m2", 2, 1)).await.unwrap();
        store.save_message(&message("c2", "m3", 1, 2)).await.unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let first = store.mark_read("c1", 1, &ids, now).await.unwrap();
        assert_eq!(first, vec!["m1".to_string()]);

        let second = store.mark_read("c1", 1, &ids, now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn load_messages_without_cursor_returns_latest_page() {
        let store = InMemoryStore::new();
        for seq in 1..=5 {
            store
                .save_message(&message("c", &format!("m{seq}"), seq, 1))
                .await
                .unwrap();
        }

        let latest = store.load_messages("c", None, 2).await.unwrap();
        let seqs: Vec<u64> = latest.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);

        let after = store.load_messages("c", Some(2), 10).await.unwrap();
        let seqs: Vec<u64> = after.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(store.last_sequence("c").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let err = store.save_message(&message("c", "m1", 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        store.set_available(true);
        assert_eq!(store.message_count("c").await, 0);
    }

    #[tokio::test]
    async fn directory_contacts_are_mutual() {
        let directory = StaticDirectory::new();
        directory.connect(1, 2).await;
        directory.issue_token("t", 1).await;

        assert_eq!(directory.contacts_of(2).await.unwrap(), vec![1]);
        assert_eq!(directory.verify_credential("t").await.unwrap(), Some(1));
        assert_eq!(directory.verify_credential("x").await.unwrap(), None);
    }
}
