//! Server → client events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    CallId, ChatId, ChatSettings, ChatSnapshot, ConnectionId, EndReason, MediaKind, Member,
    Message, MessageId, PresenceRecord, PresenceStatus, UserId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// First event on every admitted connection.
    #[serde(rename = "hello")]
    Hello {
        user_id: UserId,
        connection_id: ConnectionId,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    #[serde(rename = "ack")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },

    #[serde(rename = "chat.joined")]
    ChatJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chat: ChatSnapshot,
        last_sequence: u64,
        presence: Vec<PresenceRecord>,
    },

    #[serde(rename = "chat.left")]
    ChatLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chat_id: ChatId,
    },

    #[serde(rename = "chat.created")]
    ChatCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chat: ChatSnapshot,
        created: bool,
    },

    #[serde(rename = "chat.memberAdded")]
    MemberAdded { chat_id: ChatId, member: Member },

    #[serde(rename = "chat.memberRemoved")]
    MemberRemoved { chat_id: ChatId, user_id: UserId },

    #[serde(rename = "chat.updated")]
    ChatUpdated {
        chat_id: ChatId,
        settings: ChatSettings,
    },

    #[serde(rename = "message.new")]
    MessageNew { message: Message },

    /// Direct reply to `message.send` once the message is durable.
    #[serde(rename = "message.ack")]
    MessageAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message_id: MessageId,
        chat_id: ChatId,
        sequence: u64,
    },

    /// `has_more` asks the client to page again from the last sequence it got
    /// (with a cursor) or notes older messages exist (without one).
    #[serde(rename = "message.history")]
    MessageHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chat_id: ChatId,
        messages: Vec<Message>,
        has_more: bool,
    },

    /// Direct reply to `message.read` listing the ids this call newly marked.
    #[serde(rename = "message.readAck")]
    ReadAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },

    #[serde(rename = "message.read")]
    MessageRead {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        user_id: UserId,
        read_at: DateTime<Utc>,
    },

    #[serde(rename = "typing.update")]
    TypingUpdate {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },

    #[serde(rename = "presence.changed")]
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },

    #[serde(rename = "call.outgoing")]
    CallOutgoing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        call_id: CallId,
        to_identity: UserId,
        media_kind: MediaKind,
    },

    #[serde(rename = "call.incoming")]
    CallIncoming {
        call_id: CallId,
        from_identity: UserId,
        offer: Value,
        media_kind: MediaKind,
    },

    #[serde(rename = "call.accepted")]
    CallAccepted {
        call_id: CallId,
        from_identity: UserId,
        answer: Value,
    },

    #[serde(rename = "call.ice")]
    CallIce {
        call_id: CallId,
        from_identity: UserId,
        candidate: Value,
    },

    #[serde(rename = "call.ended")]
    CallEnded {
        call_id: CallId,
        peer_identity: UserId,
        reason: EndReason,
    },
}

impl ServerEvent {
    pub fn error(
        request_id: Option<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerEvent::Error {
            request_id,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn presence(record: PresenceRecord) -> Self {
        ServerEvent::PresenceChanged {
            user_id: record.user_id,
            status: record.status,
            last_seen: record.last_seen,
        }
    }

    /// Stable id used to suppress redelivery of the same event on a connection.
    pub fn dedup_key(&self) -> Option<&str> {
        match self {
            ServerEvent::MessageNew { message } => Some(message.id.as_str()),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Hello { .. } => "hello",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::Error { .. } => "error",
            ServerEvent::ChatJoined { .. } => "chat.joined",
            ServerEvent::ChatLeft { .. } => "chat.left",
            ServerEvent::ChatCreated { .. } => "chat.created",
            ServerEvent::MemberAdded { .. } => "chat.memberAdded",
            ServerEvent::MemberRemoved { .. } => "chat.memberRemoved",
            ServerEvent::ChatUpdated { .. } => "chat.updated",
            ServerEvent::MessageNew { .. } => "message.new",
            ServerEvent::MessageAck { .. } => "message.ack",
            ServerEvent::MessageHistory { .. } => "message.history",
            ServerEvent::ReadAck { .. } => "message.readAck",
            ServerEvent::MessageRead { .. } => "message.read",
            ServerEvent::TypingUpdate { .. } => "typing.update",
            ServerEvent::PresenceChanged { .. } => "presence.changed",
            ServerEvent::CallOutgoing { .. } => "call.outgoing",
            ServerEvent::CallIncoming { .. } => "call.incoming",
            ServerEvent::CallAccepted { .. } => "call.accepted",
            ServerEvent::CallIce { .. } => "call.ice",
            ServerEvent::CallEnded { .. } => "call.ended",
        }
    }
}
