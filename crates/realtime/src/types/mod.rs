//! Shared domain types for the real-time core.
//!
//! Chats, members and messages are the persistent records the core reads and
//! writes through the persistence contract; presence and call types are
//! ephemeral and only ever live in memory.

pub mod commands;
pub mod errors;
pub mod events;

pub use commands::{ClientCommand, ClientFrame};
pub use errors::{RealtimeError, RealtimeResult};
pub use events::ServerEvent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Common type aliases
pub type UserId = i64;
pub type ChatId = String;
pub type MessageId = String;
pub type CallId = String;
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(ChatKind::Direct),
            "group" => Some(ChatKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(MemberRole::Owner),
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }

    /// Owners count as admins for every authorization check.
    pub fn is_admin(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Code,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Code => "code",
            MessageKind::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "code" => Some(MessageKind::Code),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Voice,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "voice" => Some(MediaKind::Voice),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Why a call session terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Hangup,
    Declined,
    Cancelled,
    NoAnswer,
    Unreachable,
    AnsweredElsewhere,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Declined => "declined",
            EndReason::Cancelled => "cancelled",
            EndReason::NoAnswer => "no-answer",
            EndReason::Unreachable => "unreachable",
            EndReason::AnsweredElsewhere => "answered-elsewhere",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            EndReason::Hangup,
            EndReason::Declined,
            EndReason::Cancelled,
            EndReason::NoAnswer,
            EndReason::Unreachable,
            EndReason::AnsweredElsewhere,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub only_admins_can_post: bool,
}

/// Persistent chat metadata. Members are tracked separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub settings: ChatSettings,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message_id: Option<MessageId>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Chat {
    /// Canonical key for the unordered identity pair of a direct chat.
    pub fn direct_key(a: UserId, b: UserId) -> String {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("{low}:{high}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: UserId,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(user_id: UserId, role: MemberRole, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            role,
            joined_at,
            last_read_at: None,
        }
    }
}

/// A chat together with its ordered member list, as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    #[serde(flatten)]
    pub chat: Chat,
    pub members: Vec<Member>,
}

impl ChatSnapshot {
    pub fn member(&self, user_id: UserId) -> Option<&Member> {
        self.members.iter().find(|member| member.user_id == user_id)
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.member(user_id).is_some()
    }

    pub fn member_ids(&self) -> Vec<UserId> {
        self.members.iter().map(|member| member.user_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sequence: u64,
    pub sender_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Activity-log entry handed to persistence once a call session terminates.
#[derive(Debug, Clone, PartialEq)]
pub struct CallLogEntry {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub media_kind: MediaKind,
    pub outcome: EndReason,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_ignores_argument_order() {
        assert_eq!(Chat::direct_key(7, 3), Chat::direct_key(3, 7));
        assert_eq!(Chat::direct_key(3, 7), "3:7");
    }

    #[test]
    fn owner_counts_as_admin() {
        assert!(MemberRole::Owner.is_admin());
        assert!(MemberRole::Admin.is_admin());
        assert!(!MemberRole::Member.is_admin());
    }

    #[test]
    fn end_reason_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&EndReason::AnsweredElsewhere).unwrap();
        assert_eq!(json, "\"answered-elsewhere\"");
        assert_eq!(EndReason::NoAnswer.as_str(), "no-answer");
    }

    #[test]
    fn message_serializes_kind_as_type() {
        let message = Message {
            id: "m1".into(),
            chat_id: "c1".into(),
            sequence: 1,
            sender_id: 1,
            content: "hi".into(),
            kind: MessageKind::Code,
            reply_to: None,
            attachment: None,
            read_by: Vec::new(),
            edited: false,
            deleted: false,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "code");
        assert_eq!(value["chatId"], "c1");
        assert!(value.get("replyTo").is_none());
    }
}
