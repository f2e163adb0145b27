//! Client → server commands.
//!
//! Every frame is a JSON object tagged by `type` with camelCase fields and an
//! optional `requestId` that is echoed on the direct reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Attachment, ChatId, MediaKind, MemberRole, MessageId, MessageKind, PresenceStatus, UserId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

impl ClientFrame {
    pub fn new(command: ClientCommand) -> Self {
        Self {
            request_id: None,
            command,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "chat.join")]
    JoinChat {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_sequence: Option<u64>,
    },

    #[serde(rename = "chat.leave")]
    LeaveChat { chat_id: ChatId },

    #[serde(rename = "chat.createDirect")]
    CreateDirectChat { with_identity: UserId },

    #[serde(rename = "chat.createGroup")]
    CreateGroupChat {
        name: String,
        #[serde(default)]
        members: Vec<UserId>,
        #[serde(default)]
        only_admins_can_post: bool,
    },

    #[serde(rename = "chat.addMember")]
    AddMember {
        chat_id: ChatId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<MemberRole>,
    },

    #[serde(rename = "chat.removeMember")]
    RemoveMember { chat_id: ChatId, user_id: UserId },

    #[serde(rename = "chat.updateSettings")]
    UpdateSettings {
        chat_id: ChatId,
        only_admins_can_post: bool,
    },

    /// `messageType` rather than `type`, which is taken by the frame tag.
    #[serde(rename = "message.send")]
    SendMessage {
        chat_id: ChatId,
        #[serde(default)]
        content: String,
        #[serde(default)]
        message_type: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
    },

    #[serde(rename = "message.history")]
    FetchHistory {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    #[serde(rename = "message.read")]
    MarkRead {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },

    #[serde(rename = "typing.start")]
    StartTyping { chat_id: ChatId },

    #[serde(rename = "typing.stop")]
    StopTyping { chat_id: ChatId },

    #[serde(rename = "presence.set")]
    SetPresence { status: PresenceStatus },

    #[serde(rename = "call.start")]
    StartCall {
        to_identity: UserId,
        offer: Value,
        #[serde(default)]
        media_kind: MediaKind,
    },

    #[serde(rename = "call.answer")]
    AnswerCall { to_identity: UserId, answer: Value },

    #[serde(rename = "call.ice")]
    IceCandidate { to_identity: UserId, candidate: Value },

    #[serde(rename = "call.end")]
    EndCall { to_identity: UserId },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Ping => "ping",
            ClientCommand::JoinChat { .. } => "chat.join",
            ClientCommand::LeaveChat { .. } => "chat.leave",
            ClientCommand::CreateDirectChat { .. } => "chat.createDirect",
            ClientCommand::CreateGroupChat { .. } => "chat.createGroup",
            ClientCommand::AddMember { .. } => "chat.addMember",
            ClientCommand::RemoveMember { .. } => "chat.removeMember",
            ClientCommand::UpdateSettings { .. } => "chat.updateSettings",
            ClientCommand::SendMessage { .. } => "message.send",
            ClientCommand::FetchHistory { .. } => "message.history",
            ClientCommand::MarkRead { .. } => "message.read",
            ClientCommand::StartTyping { .. } => "typing.start",
            ClientCommand::StopTyping { .. } => "typing.stop",
            ClientCommand::SetPresence { .. } => "presence.set",
            ClientCommand::StartCall { .. } => "call.start",
            ClientCommand::AnswerCall { .. } => "call.answer",
            ClientCommand::IceCandidate { .. } => "call.ice",
            ClientCommand::EndCall { .. } => "call.end",
        }
    }
}
