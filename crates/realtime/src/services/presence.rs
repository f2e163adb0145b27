//! Presence tracking.
//!
//! Presence is derived from the registry: the first connection of an identity
//! makes it online, and the last disconnect starts a grace period after which
//! it goes offline. Every connect or disconnect bumps a generation so that a
//! grace timer which outlived a reconnect can tell it is stale. Entries are
//! dropped once an identity goes offline, so only the offline transition
//! event carries its last-seen time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::types::{PresenceRecord, PresenceStatus, RealtimeError, RealtimeResult, UserId};

#[derive(Debug, Clone, Copy)]
struct PresenceEntry {
    status: PresenceStatus,
    last_seen: Option<DateTime<Utc>>,
    generation: u64,
}

impl PresenceEntry {
    fn record(&self, user_id: UserId) -> PresenceRecord {
        PresenceRecord {
            user_id,
            status: self.status,
            last_seen: self.last_seen,
        }
    }
}

pub struct PresenceTracker {
    entries: DashMap<UserId, PresenceEntry>,
    grace: Duration,
}

impl PresenceTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// A connection was admitted. Returns the new record when the identity
    /// transitioned from offline to online.
    pub fn connected(&self, user_id: UserId) -> Option<PresenceRecord> {
        let mut entry = self.entries.entry(user_id).or_insert(PresenceEntry {
            status: PresenceStatus::Offline,
            last_seen: None,
            generation: 0,
        });
        entry.generation += 1;

        if entry.status == PresenceStatus::Offline {
            entry.status = PresenceStatus::Online;
            entry.last_seen = None;
            debug!(user_id, "Presence offline -> online");
            return Some(entry.record(user_id));
        }
        None
    }

    /// A connection went away. When it was the last one, returns the
    /// generation the grace timer must present to [`Self::confirm_offline`].
    pub fn disconnected(&self, user_id: UserId, remaining: usize) -> Option<u64> {
        if remaining > 0 {
            return None;
        }
        let mut entry = self.entries.get_mut(&user_id)?;
        entry.generation += 1;
        entry.last_seen = Some(Utc::now());
        Some(entry.generation)
    }

    /// Called when the grace period elapsed. Goes offline only if nothing
    /// happened in between and the identity is still without connections.
    pub fn confirm_offline(
        &self,
        user_id: UserId,
        generation: u64,
        still_connected: bool,
    ) -> Option<PresenceRecord> {
        if still_connected {
            return None;
        }
        let removed = self.entries.remove_if(&user_id, |_, entry| {
            entry.generation == generation && entry.status != PresenceStatus::Offline
        });
        let Some((_, mut entry)) = removed else {
            debug!(user_id, generation, "Stale presence grace timer ignored");
            return None;
        };
        entry.status = PresenceStatus::Offline;
        debug!(user_id, "Presence online -> offline");
        Some(entry.record(user_id))
    }

    /// Client-declared status. Only `online` and `away` can be declared.
    pub fn declare(
        &self,
        user_id: UserId,
        status: PresenceStatus,
    ) -> RealtimeResult<Option<PresenceRecord>> {
        if status == PresenceStatus::Offline {
            return Err(RealtimeError::invalid_argument(
                "offline cannot be declared, it follows from disconnecting",
            ));
        }
        let mut entry = self
            .entries
            .get_mut(&user_id)
            .ok_or_else(|| RealtimeError::not_found("presence"))?;
        if entry.status == PresenceStatus::Offline || entry.status == status {
            return Ok(None);
        }
        entry.status = status;
        Ok(Some(entry.record(user_id)))
    }

    pub fn record_of(&self, user_id: UserId) -> PresenceRecord {
        self.entries
            .get(&user_id)
            .map(|entry| entry.record(user_id))
            .unwrap_or(PresenceRecord {
                user_id,
                status: PresenceStatus::Offline,
                last_seen: None,
            })
    }

    pub fn status_of(&self, user_id: UserId) -> PresenceStatus {
        self.record_of(user_id).status
    }

    pub fn snapshot(&self, users: &[UserId]) -> Vec<PresenceRecord> {
        users.iter().map(|&user_id| self.record_of(user_id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_secs(5))
    }

    #[test]
    fn first_connection_goes_online_once() {
        let presence = tracker();
        let record = presence.connected(1).unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
        assert!(presence.connected(1).is_none());
    }

    #[test]
    fn reconnect_within_grace_cancels_offline() {
        let presence = tracker();
        presence.connected(1);
        let generation = presence.disconnected(1, 0).unwrap();
        presence.connected(1);

        assert!(presence.confirm_offline(1, generation, false).is_none());
        assert_eq!(presence.status_of(1), PresenceStatus::Online);
    }

    #[test]
    fn grace_expiry_goes_offline_with_last_seen() {
        let presence = tracker();
        presence.connected(1);
        let generation = presence.disconnected(1, 0).unwrap();

        let record = presence.confirm_offline(1, generation, false).unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert!(record.last_seen.is_some());
        assert!(presence.confirm_offline(1, generation, false).is_none());
    }

    #[test]
    fn offline_identities_leave_no_entry() {
        let presence = tracker();
        for user_id in 1..=3 {
            presence.connected(user_id);
            let generation = presence.disconnected(user_id, 0).unwrap();
            presence.confirm_offline(user_id, generation, false).unwrap();
        }
        assert_eq!(presence.entries.len(), 0);
        assert_eq!(presence.status_of(2), PresenceStatus::Offline);

        // A stale timer must not drop a reconnected identity.
        presence.connected(1);
        let generation = presence.disconnected(1, 0).unwrap();
        presence.connected(1);
        assert!(presence.confirm_offline(1, generation, false).is_none());
        assert_eq!(presence.entries.len(), 1);

        let record = presence.connected(2).unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
    }

    #[test]
    fn remaining_connections_keep_identity_online() {
        let presence = tracker();
        presence.connected(1);
        presence.connected(1);
        assert!(presence.disconnected(1, 1).is_none());
    }

    #[test]
    fn away_is_a_substate_of_online() {
        let presence = tracker();
        assert!(presence.declare(1, PresenceStatus::Away).is_err());

        presence.connected(1);
        let record = presence.declare(1, PresenceStatus::Away).unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Away);
        assert!(presence.declare(1, PresenceStatus::Away).unwrap().is_none());
        assert!(presence.declare(1, PresenceStatus::Offline).is_err());

        // A second device does not reset the declared status.
        assert!(presence.connected(1).is_none());
        assert_eq!(presence.status_of(1), PresenceStatus::Away);
    }

    #[test]
    fn unknown_identity_is_offline() {
        let presence = tracker();
        let snapshot = presence.snapshot(&[4, 5]);
        assert!(snapshot.iter().all(|r| r.status == PresenceStatus::Offline));
    }
}
