//! Read-receipt aggregation.
//!
//! Reads are persisted immediately; the broadcast is batched per chat so a
//! client scrolling through a backlog produces one `message.read` per reader
//! instead of one per message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::membership::MembershipIndex;
use crate::repositories::PersistenceService;
use crate::types::{ChatId, MessageId, RealtimeError, RealtimeResult, UserId};
use crate::utils::Validator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub message_ids: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MarkReadOutcome {
    pub newly_marked: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
    /// True for the call that opened a new flush window for the chat.
    pub schedule_flush: bool,
}

#[derive(Debug, Default)]
struct PendingReads {
    by_user: BTreeMap<UserId, (Vec<MessageId>, DateTime<Utc>)>,
}

pub struct ReadReceiptAggregator {
    store: Arc<dyn PersistenceService>,
    index: Arc<MembershipIndex>,
    pending: DashMap<ChatId, PendingReads>,
    flush_interval: Duration,
}

impl ReadReceiptAggregator {
    pub fn new(
        store: Arc<dyn PersistenceService>,
        index: Arc<MembershipIndex>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            index,
            pending: DashMap::new(),
            flush_interval,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub async fn mark_read(
        &self,
        chat_id: &str,
        user_id: UserId,
        message_ids: &[MessageId],
    ) -> RealtimeResult<MarkReadOutcome> {
        Validator::read_batch(message_ids.len())?;
        if self.index.member(chat_id, user_id).await?.is_none() {
            return Err(RealtimeError::forbidden("not a member of this chat"));
        }

        let mut unique: Vec<MessageId> = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        let read_at = Utc::now();
        if unique.is_empty() {
            return Ok(MarkReadOutcome {
                newly_marked: Vec::new(),
                read_at,
                schedule_flush: false,
            });
        }

        let newly_marked = self
            .store
            .mark_read(chat_id, user_id, &unique, read_at)
            .await?;
        if newly_marked.is_empty() {
            debug!(chat_id, user_id, "Read receipt changed nothing");
            return Ok(MarkReadOutcome {
                newly_marked,
                read_at,
                schedule_flush: false,
            });
        }

        self.index.record_read(chat_id, user_id, read_at).await;

        let mut schedule_flush = false;
        let mut pending = self.pending.entry(chat_id.to_string()).or_insert_with(|| {
            schedule_flush = true;
            PendingReads::default()
        });
        let (ids, at) = pending
            .by_user
            .entry(user_id)
            .or_insert_with(|| (Vec::new(), read_at));
        for id in &newly_marked {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        *at = read_at;
        drop(pending);

        Ok(MarkReadOutcome {
            newly_marked,
            read_at,
            schedule_flush,
        })
    }

    /// Drains the pending window of a chat into one batch per reader.
    pub fn take_pending(&self, chat_id: &str) -> Vec<ReadBatch> {
        let Some((chat_id, pending)) = self.pending.remove(chat_id) else {
            return Vec::new();
        };
        pending
            .by_user
            .into_iter()
            .map(|(user_id, (message_ids, read_at))| ReadBatch {
                chat_id: chat_id.clone(),
                user_id,
                message_ids,
                read_at,
            })
            .collect()
    }
}
