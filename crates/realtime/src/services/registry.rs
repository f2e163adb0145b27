//! Connection registry: identity → live connections.
//!
//! Each connection owns a bounded broadcast queue. Senders never block: when
//! a slow reader falls behind, the oldest pending events are dropped and the
//! writer observes a lag. Recently delivered `message.new` ids are remembered
//! per connection so the same message is never queued twice.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::{ChatId, ConnectionId, ServerEvent, UserId};

pub type OutboundEvent = Arc<ServerEvent>;
pub type OutboundReceiver = broadcast::Receiver<OutboundEvent>;

/// Bounded memory of recently delivered event ids.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
            capacity,
        }
    }

    /// Returns false when the id was already delivered.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    outbound: broadcast::Sender<OutboundEvent>,
    joined: DashSet<ChatId>,
    recent: Mutex<RecentIds>,
    opened: Instant,
    /// Milliseconds after `opened` of the last inbound frame.
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl ConnectionHandle {
    fn new(
        id: ConnectionId,
        user_id: UserId,
        capacity: usize,
        dedup_window: usize,
    ) -> (Self, OutboundReceiver) {
        let (outbound, receiver) = broadcast::channel(capacity.max(1));
        let (close_signal, _) = watch::channel(false);
        let handle = Self {
            id,
            user_id,
            connected_at: Utc::now(),
            outbound,
            joined: DashSet::new(),
            recent: Mutex::new(RecentIds::new(dedup_window)),
            opened: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_signal,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue an event for this connection. Returns whether it was queued.
    pub fn deliver(&self, event: OutboundEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        if let Some(key) = event.dedup_key() {
            if !self.recent().insert(key) {
                debug!(connection_id = self.id, event_id = key, "Suppressed duplicate delivery");
                return false;
            }
        }
        match self.outbound.send(event) {
            Ok(_) => true,
            Err(_) => {
                debug!(connection_id = self.id, "Dropped event for connection without a writer");
                false
            }
        }
    }

    pub fn join(&self, chat_id: &str) -> bool {
        self.joined.insert(chat_id.to_string())
    }

    pub fn leave(&self, chat_id: &str) -> bool {
        self.joined.remove(chat_id).is_some()
    }

    pub fn has_joined(&self, chat_id: &str) -> bool {
        self.joined.contains(chat_id)
    }

    pub fn joined_chats(&self) -> Vec<ChatId> {
        self.joined.iter().map(|chat| chat.key().clone()).collect()
    }

    pub fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis();
        self.last_activity_ms
            .fetch_max(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Time since the last inbound frame, or since admission without one.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }

    /// Ask the transport to shut down. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.send_replace(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    pub async fn closed(&self) {
        let mut receiver = self.close_signal.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    fn recent(&self) -> MutexGuard<'_, RecentIds> {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct Admission {
    pub handle: Arc<ConnectionHandle>,
    pub events: OutboundReceiver,
    /// True when this is the identity's only live connection.
    pub first_for_identity: bool,
}

pub struct Removal {
    pub handle: Arc<ConnectionHandle>,
    /// Connections the identity still has after this removal.
    pub remaining: usize,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_identity: DashMap<UserId, HashSet<ConnectionId>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    dedup_window: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, dedup_window: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_identity: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
            dedup_window,
        }
    }

    pub fn admit(&self, user_id: UserId) -> Admission {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, events) =
            ConnectionHandle::new(id, user_id, self.queue_capacity, self.dedup_window);
        let handle = Arc::new(handle);

        self.connections.insert(id, handle.clone());
        let first_for_identity = {
            let mut set = self.by_identity.entry(user_id).or_default();
            set.insert(id);
            set.len() == 1
        };

        info!(connection_id = id, user_id, first_for_identity, "Connection admitted");
        Admission {
            handle,
            events,
            first_for_identity,
        }
    }

    pub fn remove(&self, connection_id: ConnectionId) -> Option<Removal> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        handle.close();

        let remaining = match self.by_identity.entry(handle.user_id()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().remove(&connection_id);
                let remaining = entry.get().len();
                if remaining == 0 {
                    entry.remove();
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        };

        info!(
            connection_id,
            user_id = handle.user_id(),
            remaining,
            "Connection removed"
        );
        Some(Removal { handle, remaining })
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    pub fn connection_ids_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.by_identity
            .get(&user_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn connections_for(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        let ids = self.connection_ids_for(user_id);
        let mut handles: Vec<_> = ids.into_iter().filter_map(|id| self.get(id)).collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_identity
            .get(&user_id)
            .is_some_and(|set| !set.is_empty())
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.by_identity.get(&user_id).map(|set| set.len()).unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn online_identities(&self) -> usize {
        self.by_identity.len()
    }

    /// Connections without inbound activity for longer than `max_idle`.
    pub fn idle_connections(&self, max_idle: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Deliver to every connection of `user_id`, optionally skipping one.
    pub fn deliver_to_user(
        &self,
        user_id: UserId,
        event: &OutboundEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        self.connections_for(user_id)
            .into_iter()
            .filter(|handle| Some(handle.id()) != except)
            .filter(|handle| handle.deliver(event.clone()))
            .count()
    }

    pub fn deliver_to_connection(
        &self,
        connection_id: ConnectionId,
        event: &OutboundEvent,
    ) -> bool {
        self.get(connection_id)
            .is_some_and(|handle| handle.deliver(event.clone()))
    }

    /// Deliver to the connections of every listed identity. When `joined_chat`
    /// is set only connections that joined that chat receive the event.
    pub fn deliver_to_users<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
        event: &OutboundEvent,
        skip_user: Option<UserId>,
        joined_chat: Option<&str>,
    ) -> usize {
        let mut delivered = 0;
        for &user_id in users {
            if Some(user_id) == skip_user {
                continue;
            }
            for handle in self.connections_for(user_id) {
                if joined_chat.is_some_and(|chat| !handle.has_joined(chat)) {
                    continue;
                }
                if handle.deliver(event.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
