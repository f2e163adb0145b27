//! Membership index.
//!
//! Caches chat metadata and member lists loaded from persistence. Reads take
//! the per-chat read lock; writes are authorized against the cached member
//! list, committed to persistence, and only then applied in memory.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::repositories::{DirectoryService, PersistenceService, StoreError};
use crate::types::{
    Chat, ChatId, ChatKind, ChatSettings, ChatSnapshot, Member, MemberRole, RealtimeError,
    RealtimeResult, UserId,
};
use crate::utils::Validator;

#[derive(Debug)]
struct ChatEntry {
    chat: Chat,
    members: Vec<Member>,
}

impl ChatEntry {
    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            chat: self.chat.clone(),
            members: self.members.clone(),
        }
    }

    fn member(&self, user_id: UserId) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    fn require_admin(&self, actor: UserId) -> RealtimeResult<()> {
        match self.member(actor) {
            Some(member) if member.role.is_admin() => Ok(()),
            Some(_) => Err(RealtimeError::forbidden("only admins can manage this chat")),
            None => Err(RealtimeError::forbidden("not a member of this chat")),
        }
    }
}

/// Chat set of one identity. `chats` is `None` until loaded from persistence;
/// `version` moves on every local change so a load that raced one is discarded.
#[derive(Debug, Default)]
struct MemberChats {
    version: u64,
    chats: Option<HashSet<ChatId>>,
}

const MEMBER_CHATS_LOAD_ATTEMPTS: usize = 3;

type PairKey = (UserId, UserId);

fn pair_key(a: UserId, b: UserId) -> PairKey {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct MembershipIndex {
    store: Arc<dyn PersistenceService>,
    directory: Arc<dyn DirectoryService>,
    chats: DashMap<ChatId, Arc<RwLock<ChatEntry>>>,
    member_chats: DashMap<UserId, MemberChats>,
    direct_pairs: DashMap<PairKey, ChatId>,
    pair_locks: DashMap<PairKey, Arc<Mutex<()>>>,
}

impl MembershipIndex {
    pub fn new(store: Arc<dyn PersistenceService>, directory: Arc<dyn DirectoryService>) -> Self {
        Self {
            store,
            directory,
            chats: DashMap::new(),
            member_chats: DashMap::new(),
            direct_pairs: DashMap::new(),
            pair_locks: DashMap::new(),
        }
    }

    async fn entry(&self, chat_id: &str) -> RealtimeResult<Arc<RwLock<ChatEntry>>> {
        if let Some(entry) = self.chats.get(chat_id) {
            return Ok(entry.value().clone());
        }

        let chat = self
            .store
            .load_chat(chat_id)
            .await?
            .ok_or_else(|| RealtimeError::not_found(format!("chat {chat_id}")))?;
        let members = self.store.load_members(chat_id).await?;
        debug!(chat_id, members = members.len(), "Loaded chat into membership index");

        // A concurrent loader may have won; keep whichever landed first.
        let entry = self
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ChatEntry { chat, members })))
            .value()
            .clone();
        Ok(entry)
    }

    fn insert_entry(&self, chat: Chat, members: Vec<Member>) -> ChatSnapshot {
        for member in &members {
            self.remember_chat(member.user_id, &chat.id);
        }
        let entry = ChatEntry { chat, members };
        let snapshot = entry.snapshot();
        self.chats
            .insert(snapshot.chat.id.clone(), Arc::new(RwLock::new(entry)));
        snapshot
    }

    fn remember_chat(&self, user_id: UserId, chat_id: &str) {
        let mut cached = self.member_chats.entry(user_id).or_default();
        cached.version += 1;
        if let Some(chats) = cached.chats.as_mut() {
            chats.insert(chat_id.to_string());
        }
    }

    fn forget_chat(&self, user_id: UserId, chat_id: &str) {
        let mut cached = self.member_chats.entry(user_id).or_default();
        cached.version += 1;
        if let Some(chats) = cached.chats.as_mut() {
            chats.remove(chat_id);
        }
    }

    pub async fn chat(&self, chat_id: &str) -> RealtimeResult<ChatSnapshot> {
        let entry = self.entry(chat_id).await?;
        let guard = entry.read().await;
        Ok(guard.snapshot())
    }

    pub async fn members_of(&self, chat_id: &str) -> RealtimeResult<Vec<Member>> {
        let entry = self.entry(chat_id).await?;
        let guard = entry.read().await;
        Ok(guard.members.clone())
    }

    pub async fn member_ids(&self, chat_id: &str) -> RealtimeResult<Vec<UserId>> {
        let entry = self.entry(chat_id).await?;
        let guard = entry.read().await;
        Ok(guard.members.iter().map(|m| m.user_id).collect())
    }

    pub async fn member(&self, chat_id: &str, user_id: UserId) -> RealtimeResult<Option<Member>> {
        let entry = self.entry(chat_id).await?;
        let guard = entry.read().await;
        Ok(guard.member(user_id).cloned())
    }

    /// The chat plus the caller's membership; `Forbidden` for non-members.
    pub async fn require_member(
        &self,
        chat_id: &str,
        user_id: UserId,
    ) -> RealtimeResult<(ChatSnapshot, Member)> {
        let snapshot = self.chat(chat_id).await?;
        let member = snapshot
            .member(user_id)
            .cloned()
            .ok_or_else(|| RealtimeError::forbidden("not a member of this chat"))?;
        Ok((snapshot, member))
    }

    pub async fn chats_of(&self, user_id: UserId) -> RealtimeResult<Vec<ChatId>> {
        for _ in 0..MEMBER_CHATS_LOAD_ATTEMPTS {
            let version = {
                let cached = self.member_chats.entry(user_id).or_default();
                if let Some(chats) = &cached.chats {
                    return Ok(chats.iter().cloned().collect());
                }
                cached.version
            };

            let loaded: HashSet<ChatId> = self
                .store
                .chats_for_member(user_id)
                .await?
                .into_iter()
                .collect();

            let mut cached = self.member_chats.entry(user_id).or_default();
            if let Some(chats) = &cached.chats {
                return Ok(chats.iter().cloned().collect());
            }
            if cached.version == version {
                let chats = loaded.iter().cloned().collect();
                cached.chats = Some(loaded);
                return Ok(chats);
            }
            debug!(user_id, "Chat set changed during load, reloading");
        }

        // Still contended: answer from persistence without caching.
        Ok(self.store.chats_for_member(user_id).await?)
    }

    /// Every identity sharing at least one chat with `user_id`, excluding itself.
    pub async fn co_members(&self, user_id: UserId) -> RealtimeResult<HashSet<UserId>> {
        let mut peers = HashSet::new();
        for chat_id in self.chats_of(user_id).await? {
            match self.member_ids(&chat_id).await {
                Ok(ids) => peers.extend(ids),
                Err(RealtimeError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        peers.remove(&user_id);
        Ok(peers)
    }

    pub async fn create_group(
        &self,
        creator: UserId,
        name: &str,
        members: &[UserId],
        settings: ChatSettings,
    ) -> RealtimeResult<ChatSnapshot> {
        let name = Validator::group_name(name)?;
        let now = Utc::now();

        let mut roster = vec![Member::new(creator, MemberRole::Owner, now)];
        let mut seen = HashSet::from([creator]);
        for &user_id in members {
            if seen.insert(user_id) {
                roster.push(Member::new(user_id, MemberRole::Member, now));
            }
        }
        Validator::group_size(roster.len())?;

        let chat = Chat {
            id: cuid2::create_id(),
            kind: ChatKind::Group,
            name: Some(name),
            settings,
            created_by: creator,
            created_at: now,
            last_message_id: None,
            last_message_at: None,
        };

        self.store.create_chat(&chat, &roster).await?;
        info!(
            chat_id = %chat.id,
            creator,
            members = roster.len(),
            "Group chat created"
        );
        Ok(self.insert_entry(chat, roster))
    }

    /// Returns the chat for the unordered pair and whether it was created now.
    pub async fn create_direct(
        &self,
        requester: UserId,
        counterpart: UserId,
    ) -> RealtimeResult<(ChatSnapshot, bool)> {
        if requester == counterpart {
            return Err(RealtimeError::invalid_argument(
                "cannot open a direct chat with yourself",
            ));
        }

        let contacts = self.directory.contacts_of(requester).await?;
        if !contacts.contains(&counterpart) {
            return Err(RealtimeError::forbidden(
                "direct chats require an accepted contact",
            ));
        }

        let key = pair_key(requester, counterpart);
        let lock = self
            .pair_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.open_direct(key, requester, counterpart).await
        };
        drop(lock);
        // Only the map holds the lock now unless another creator is queued on it.
        self.pair_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Runs under the pair lock.
    async fn open_direct(
        &self,
        key: PairKey,
        requester: UserId,
        counterpart: UserId,
    ) -> RealtimeResult<(ChatSnapshot, bool)> {
        if let Some(existing) = self.existing_direct(key).await? {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let roster = vec![
            Member::new(requester, MemberRole::Member, now),
            Member::new(counterpart, MemberRole::Member, now),
        ];
        let chat = Chat {
            id: cuid2::create_id(),
            kind: ChatKind::Direct,
            name: None,
            settings: ChatSettings::default(),
            created_by: requester,
            created_at: now,
            last_message_id: None,
            last_message_at: None,
        };

        match self.store.create_chat(&chat, &roster).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(reason)) => {
                // Another node created the pair first.
                debug!(requester, counterpart, reason = %reason, "Direct chat already persisted");
                return match self.existing_direct(key).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(RealtimeError::conflict(reason)),
                };
            }
            Err(err) => return Err(err.into()),
        }

        self.direct_pairs.insert(key, chat.id.clone());
        info!(chat_id = %chat.id, requester, counterpart, "Direct chat created");
        Ok((self.insert_entry(chat, roster), true))
    }

    async fn existing_direct(&self, key: PairKey) -> RealtimeResult<Option<ChatSnapshot>> {
        let cached = self.direct_pairs.get(&key).map(|id| id.value().clone());
        let chat_id = match cached {
            Some(chat_id) => chat_id,
            None => match self.store.find_direct_chat(key.0, key.1).await? {
                Some(chat_id) => {
                    self.direct_pairs.insert(key, chat_id.clone());
                    chat_id
                }
                None => return Ok(None),
            },
        };
        self.chat(&chat_id).await.map(Some)
    }

    pub async fn add_member(
        &self,
        actor: UserId,
        chat_id: &str,
        user_id: UserId,
        role: MemberRole,
    ) -> RealtimeResult<Member> {
        if role == MemberRole::Owner {
            return Err(RealtimeError::invalid_argument(
                "the owner role cannot be granted",
            ));
        }

        let entry = self.entry(chat_id).await?;
        let mut guard = entry.write().await;
        guard.require_admin(actor)?;
        if guard.chat.kind == ChatKind::Direct {
            return Err(RealtimeError::forbidden("direct chats have fixed membership"));
        }
        if guard.member(user_id).is_some() {
            return Err(RealtimeError::conflict("already a member of this chat"));
        }
        Validator::group_size(guard.members.len() + 1)?;

        let member = Member::new(user_id, role, Utc::now());
        self.store.add_member(chat_id, &member).await?;
        guard.members.push(member.clone());
        self.remember_chat(user_id, chat_id);

        info!(chat_id, actor, user_id, role = role.as_str(), "Member added");
        Ok(member)
    }

    /// Removes `user_id`; an identity may always remove itself.
    pub async fn remove_member(
        &self,
        actor: UserId,
        chat_id: &str,
        user_id: UserId,
    ) -> RealtimeResult<Member> {
        let entry = self.entry(chat_id).await?;
        let mut guard = entry.write().await;

        if guard.chat.kind == ChatKind::Direct {
            return Err(RealtimeError::forbidden("direct chats have fixed membership"));
        }
        let target = guard
            .member(user_id)
            .cloned()
            .ok_or_else(|| RealtimeError::not_found(format!("member {user_id}")))?;
        if actor != user_id {
            guard.require_admin(actor)?;
            if target.role == MemberRole::Owner {
                return Err(RealtimeError::forbidden("the owner cannot be removed"));
            }
        }

        self.store.remove_member(chat_id, user_id).await?;
        guard.members.retain(|m| m.user_id != user_id);
        self.forget_chat(user_id, chat_id);

        info!(chat_id, actor, user_id, "Member removed");
        Ok(target)
    }

    pub async fn update_settings(
        &self,
        actor: UserId,
        chat_id: &str,
        settings: ChatSettings,
    ) -> RealtimeResult<ChatSettings> {
        let entry = self.entry(chat_id).await?;
        let mut guard = entry.write().await;
        guard.require_admin(actor)?;
        if guard.chat.kind == ChatKind::Direct {
            return Err(RealtimeError::forbidden("direct chats have no settings"));
        }

        self.store.update_settings(chat_id, &settings).await?;
        guard.chat.settings = settings;
        info!(
            chat_id,
            actor,
            only_admins_can_post = settings.only_admins_can_post,
            "Chat settings updated"
        );
        Ok(settings)
    }

    /// Moves the cached last-read marker forward; never backwards.
    pub async fn record_read(&self, chat_id: &str, user_id: UserId, at: DateTime<Utc>) {
        let entry = match self.entry(chat_id).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(chat_id, user_id, error = %err, "Could not record last-read marker");
                return;
            }
        };
        let mut guard = entry.write().await;
        if let Some(member) = guard.members.iter_mut().find(|m| m.user_id == user_id) {
            if member.last_read_at.map_or(true, |previous| previous < at) {
                member.last_read_at = Some(at);
            }
        }
    }

    /// Refresh the cached last-message pointer after a successful upsert.
    pub async fn record_last_message(&self, chat_id: &str, message_id: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.chats.get(chat_id).map(|e| e.value().clone()) {
            let mut guard = entry.write().await;
            guard.chat.last_message_id = Some(message_id.to_string());
            guard.chat.last_message_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::repositories::{InMemoryStore, StaticDirectory};

    async fn index_with_contacts(
        pairs: &[(UserId, UserId)],
    ) -> (MembershipIndex, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(StaticDirectory::new());
        for &(a, b) in pairs {
            directory.connect(a, b).await;
        }
        (MembershipIndex::new(store.clone(), directory), store)
    }

    #[tokio::test]
    async fn direct_chat_is_idempotent_per_pair() {
        let (index, _) = index_with_contacts(&[(1, 2)]).await;

        let (first, created) = index.create_direct(1, 2).await.unwrap();
        assert!(created);
        let (second, created) = index.create_direct(2, 1).await.unwrap();
        assert!(!created);
        assert_eq!(first.chat.id, second.chat.id);
        assert_eq!(second.members.len(), 2);
        assert_eq!(index.pair_locks.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_direct_creation_yields_one_chat() {
        let (index, _) = index_with_contacts(&[(1, 2)]).await;
        let index = Arc::new(index);

        let a = tokio::spawn({
            let index = index.clone();
            async move { index.create_direct(1, 2).await }
        });
        let b = tokio::spawn({
            let index = index.clone();
            async move { index.create_direct(2, 1).await }
        });

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.0.chat.id, b.0.chat.id);
        assert!(a.1 ^ b.1);
        assert_eq!(index.pair_locks.len(), 0);
    }

    #[tokio::test]
    async fn failed_direct_creation_releases_pair_lock() {
        let (index, store) = index_with_contacts(&[(1, 2)]).await;
        store.set_available(false);
        let err = index.create_direct(1, 2).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
        assert_eq!(index.pair_locks.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_created_during_load_is_not_lost() {
        let (index, store) = index_with_contacts(&[]).await;
        let index = Arc::new(index);
        store.set_member_load_latency(Duration::from_millis(50));

        let loading = tokio::spawn({
            let index = index.clone();
            async move { index.chats_of(2).await }
        });
        // Let the load read the empty state before the group exists.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let group = index
            .create_group(1, "Late", &[2], ChatSettings::default())
            .await
            .unwrap();

        let loaded = loading.await.unwrap().unwrap();
        assert_eq!(loaded, vec![group.chat.id.clone()]);
        assert_eq!(index.chats_of(2).await.unwrap(), vec![group.chat.id]);
    }

    #[tokio::test]
    async fn leaving_updates_a_cached_chat_set() {
        let (index, _) = index_with_contacts(&[]).await;
        let group = index
            .create_group(1, "Club", &[2], ChatSettings::default())
            .await
            .unwrap();
        assert_eq!(index.chats_of(2).await.unwrap(), vec![group.chat.id.clone()]);

        index.remove_member(2, &group.chat.id, 2).await.unwrap();
        assert!(index.chats_of(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_chat_requires_contact() {
        let (index, _) = index_with_contacts(&[]).await;
        let err = index.create_direct(1, 2).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let err = index.create_direct(1, 1).await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn index_reloads_direct_chat_from_store() {
        let (index, store) = index_with_contacts(&[(1, 2)]).await;
        let (created, _) = index.create_direct(1, 2).await.unwrap();

        let directory = Arc::new(StaticDirectory::new());
        directory.connect(1, 2).await;
        let fresh = MembershipIndex::new(store, directory);
        let (found, created_now) = fresh.create_direct(2, 1).await.unwrap();
        assert!(!created_now);
        assert_eq!(found.chat.id, created.chat.id);
    }

    #[tokio::test]
    async fn admin_rules_for_group_membership() {
        let (index, _) = index_with_contacts(&[]).await;
        let group = index
            .create_group(1, "Study", &[2, 3, 2], ChatSettings::default())
            .await
            .unwrap();
        let chat_id = group.chat.id.clone();
        assert_eq!(group.members.len(), 3);
        assert_eq!(group.member(1).unwrap().role, MemberRole::Owner);

        let err = index
            .add_member(2, &chat_id, 4, MemberRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        index.add_member(1, &chat_id, 4, MemberRole::Admin).await.unwrap();
        let err = index
            .add_member(1, &chat_id, 4, MemberRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");

        // Admins cannot remove the owner, members can leave on their own.
        let err = index.remove_member(4, &chat_id, 1).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        index.remove_member(3, &chat_id, 3).await.unwrap();
        index.remove_member(4, &chat_id, 2).await.unwrap();

        let ids = index.member_ids(&chat_id).await.unwrap();
        assert_eq!(ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn failed_commit_leaves_cache_untouched() {
        let (index, store) = index_with_contacts(&[]).await;
        let group = index
            .create_group(1, "Study", &[2], ChatSettings::default())
            .await
            .unwrap();

        store.set_available(false);
        let err = index
            .add_member(1, &group.chat.id, 3, MemberRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unavailable");
        store.set_available(true);

        assert!(index.member(&group.chat.id, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn co_members_span_all_chats() {
        let (index, _) = index_with_contacts(&[]).await;
        index
            .create_group(1, "A", &[2], ChatSettings::default())
            .await
            .unwrap();
        index
            .create_group(3, "B", &[1], ChatSettings::default())
            .await
            .unwrap();

        let peers = index.co_members(1).await.unwrap();
        assert_eq!(peers, HashSet::from([2, 3]));
    }

    #[tokio::test]
    async fn unknown_chat_is_not_found() {
        let (index, _) = index_with_contacts(&[]).await;
        let err = index.chat("missing").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
