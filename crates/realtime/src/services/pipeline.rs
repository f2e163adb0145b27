//! Message pipeline: validate, sequence, persist, fan out.
//!
//! Each chat has a sequencer guarded by its own lock. The lock is held from
//! sequence allocation until every recipient connection has the event queued,
//! so all recipients observe one total order per chat. Sequencers are evicted
//! once no send holds them and are re-seeded from persistence on next use.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::membership::MembershipIndex;
use super::registry::ConnectionRegistry;
use crate::repositories::PersistenceService;
use crate::types::{
    Attachment, ChatId, Message, MessageId, MessageKind, RealtimeError, RealtimeResult,
    ServerEvent, UserId,
};
use crate::utils::Validator;

#[derive(Debug, Default)]
struct Sequencer {
    /// `None` until seeded from persistence.
    last_sequence: Option<u64>,
    last_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<MessageId>,
    pub attachment: Option<Attachment>,
}

impl SendRequest {
    pub fn text(chat_id: impl Into<ChatId>, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            sender_id,
            content: content.into(),
            kind: MessageKind::Text,
            reply_to: None,
            attachment: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// Connections the `message.new` event was queued on.
    pub delivered: usize,
    /// Members other than the sender without any live connection.
    pub offline_recipients: Vec<UserId>,
}

/// One page of backfill, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    /// With a cursor, newer messages follow the page; without one, older
    /// messages precede it.
    pub has_more: bool,
}

pub struct MessagePipeline {
    store: Arc<dyn PersistenceService>,
    index: Arc<MembershipIndex>,
    registry: Arc<ConnectionRegistry>,
    sequencers: DashMap<ChatId, Arc<Mutex<Sequencer>>>,
    max_message_length: usize,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn PersistenceService>,
        index: Arc<MembershipIndex>,
        registry: Arc<ConnectionRegistry>,
        max_message_length: usize,
    ) -> Self {
        Self {
            store,
            index,
            registry,
            sequencers: DashMap::new(),
            max_message_length,
        }
    }

    fn sequencer(&self, chat_id: &str) -> Arc<Mutex<Sequencer>> {
        self.sequencers
            .entry(chat_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn release_sequencer(&self, chat_id: &str, sequencer: Arc<Mutex<Sequencer>>) {
        drop(sequencer);
        self.sequencers
            .remove_if(chat_id, |_, sequencer| Arc::strong_count(sequencer) == 1);
    }

    pub async fn send(&self, request: SendRequest) -> RealtimeResult<SendOutcome> {
        Validator::chat_id(&request.chat_id)?;
        Validator::message_content(
            &request.content,
            request.attachment.as_ref(),
            self.max_message_length,
        )?;

        let (chat, sender) = self
            .index
            .require_member(&request.chat_id, request.sender_id)
            .await?;
        if chat.chat.settings.only_admins_can_post && !sender.role.is_admin() {
            return Err(RealtimeError::forbidden("only admins can post in this chat"));
        }

        if let Some(reply_to) = &request.reply_to {
            let target = self.store.load_message(reply_to).await?;
            if !target.is_some_and(|m| m.chat_id == request.chat_id) {
                return Err(RealtimeError::not_found(format!("message {reply_to}")));
            }
        }

        let chat_id = request.chat_id.clone();
        let sequencer = self.sequencer(&chat_id);
        let committed = self.commit(&sequencer, request).await;
        self.release_sequencer(&chat_id, sequencer);
        let outcome = committed?;
        let message = &outcome.message;

        if let Err(err) = self
            .store
            .upsert_last_message(&message.chat_id, &message.id, message.created_at)
            .await
        {
            warn!(
                chat_id = %message.chat_id,
                message_id = %message.id,
                error = %err,
                "Failed to update last-message pointer"
            );
        } else {
            self.index
                .record_last_message(&message.chat_id, &message.id, message.created_at)
                .await;
        }

        info!(
            chat_id = %message.chat_id,
            message_id = %message.id,
            sequence = message.sequence,
            sender_id = message.sender_id,
            delivered = outcome.delivered,
            "Message delivered"
        );
        Ok(outcome)
    }

    /// Sequences, persists and fans out under the chat's sequencer lock.
    async fn commit(
        &self,
        sequencer: &Mutex<Sequencer>,
        request: SendRequest,
    ) -> RealtimeResult<SendOutcome> {
        let mut state = sequencer.lock().await;

        let last_sequence = match state.last_sequence {
            Some(sequence) => sequence,
            None => self.store.last_sequence(&request.chat_id).await?,
        };
        let now = Utc::now();
        let created_at = match state.last_created_at {
            Some(previous) if previous > now => previous,
            _ => now,
        };

        let message = Message {
            id: Uuid::now_v7().to_string(),
            chat_id: request.chat_id.clone(),
            sequence: last_sequence + 1,
            sender_id: request.sender_id,
            content: request.content,
            kind: request.kind,
            reply_to: request.reply_to,
            attachment: request.attachment,
            read_by: Vec::new(),
            edited: false,
            deleted: false,
            created_at,
        };

        if let Err(err) = self.store.save_message(&message).await {
            warn!(
                chat_id = %message.chat_id,
                sequence = message.sequence,
                error = %err,
                "Failed to persist message"
            );
            // Keep the seed so the next attempt reuses this sequence.
            state.last_sequence = Some(last_sequence);
            return Err(RealtimeError::unavailable(format!(
                "message could not be stored: {err}"
            )));
        }
        state.last_sequence = Some(message.sequence);
        state.last_created_at = Some(message.created_at);

        // Re-read members so a concurrent removal is honoured.
        let members = self.index.member_ids(&message.chat_id).await?;
        let event = Arc::new(ServerEvent::MessageNew {
            message: message.clone(),
        });
        let mut delivered = 0;
        let mut offline_recipients = Vec::new();
        for &member in &members {
            let count = self.registry.deliver_to_user(member, &event, None);
            delivered += count;
            if member != message.sender_id && !self.registry.is_online(member) {
                offline_recipients.push(member);
            }
        }

        Ok(SendOutcome {
            message,
            delivered,
            offline_recipients,
        })
    }

    /// Backfill for a member: the page after `after_sequence`, or the latest
    /// page without a cursor.
    pub async fn history(
        &self,
        chat_id: &str,
        user_id: UserId,
        after_sequence: Option<u64>,
        limit: u32,
    ) -> RealtimeResult<HistoryPage> {
        self.index.require_member(chat_id, user_id).await?;
        if limit == 0 {
            return Err(RealtimeError::invalid_argument("limit must be positive"));
        }
        // One extra row tells whether the page is the last.
        let mut messages = self
            .store
            .load_messages(chat_id, after_sequence, limit.saturating_add(1))
            .await?;
        let has_more = messages.len() > limit as usize;
        if has_more {
            match after_sequence {
                Some(_) => messages.truncate(limit as usize),
                None => {
                    messages.remove(0);
                }
            }
        }
        debug!(
            chat_id,
            user_id,
            ?after_sequence,
            count = messages.len(),
            has_more,
            "History served"
        );
        Ok(HistoryPage { messages, has_more })
    }

    /// Highest sequence known for the chat, preferring the live sequencer.
    pub async fn last_sequence(&self, chat_id: &str) -> RealtimeResult<u64> {
        let sequencer = self.sequencer(chat_id);
        let known = sequencer.lock().await.last_sequence;
        self.release_sequencer(chat_id, sequencer);
        match known {
            Some(sequence) => Ok(sequence),
            None => Ok(self.store.last_sequence(chat_id).await?),
        }
    }
}
