//! Typing coordinator.
//!
//! Pure state over `(chat, user)` keys; the hub owns the timers. One timer
//! runs per active entry: refreshing only moves the deadline, and the timer
//! re-arms itself until the deadline passes or the entry is superseded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::{ChatId, UserId};

#[derive(Debug, Clone, Copy)]
struct TypingEntry {
    deadline: Instant,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingStart {
    /// Became active; a timer for `generation` must be armed.
    Started { generation: u64, deadline: Instant },
    /// Already active; the deadline moved forward.
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingExpiry {
    Expired,
    /// Still active; sleep until the new deadline.
    Pending(Instant),
    /// Stopped or restarted under a different generation.
    Superseded,
}

pub struct TypingCoordinator {
    entries: DashMap<(ChatId, UserId), TypingEntry>,
    ttl: Duration,
    generations: AtomicU64,
}

impl TypingCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            generations: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn start(&self, chat_id: &str, user_id: UserId, now: Instant) -> TypingStart {
        let deadline = now + self.ttl;
        let key = (chat_id.to_string(), user_id);
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.deadline = deadline;
            return TypingStart::Refreshed;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut started = TypingStart::Refreshed;
        self.entries.entry(key).or_insert_with(|| {
            started = TypingStart::Started {
                generation,
                deadline,
            };
            TypingEntry {
                deadline,
                generation,
            }
        });
        started
    }

    /// Returns whether the user was typing.
    pub fn stop(&self, chat_id: &str, user_id: UserId) -> bool {
        self.entries
            .remove(&(chat_id.to_string(), user_id))
            .is_some()
    }

    pub fn expire(
        &self,
        chat_id: &str,
        user_id: UserId,
        generation: u64,
        now: Instant,
    ) -> TypingExpiry {
        let key = (chat_id.to_string(), user_id);
        let removed = self.entries.remove_if(&key, |_, entry| {
            entry.generation == generation && entry.deadline <= now
        });
        if removed.is_some() {
            return TypingExpiry::Expired;
        }
        match self.entries.get(&key) {
            Some(entry) if entry.generation == generation => TypingExpiry::Pending(entry.deadline),
            _ => TypingExpiry::Superseded,
        }
    }

    pub fn is_typing(&self, chat_id: &str, user_id: UserId) -> bool {
        self.entries.contains_key(&(chat_id.to_string(), user_id))
    }

    /// Clears every entry of `user_id`, returning the affected chats.
    pub fn clear_user(&self, user_id: UserId) -> Vec<ChatId> {
        let keys: Vec<(ChatId, UserId)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| entry.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|((chat_id, _), _)| chat_id))
            .collect()
    }
}
