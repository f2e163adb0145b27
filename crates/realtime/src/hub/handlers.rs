//! Command handlers.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::Hub;
use crate::services::{ConnectionHandle, SendRequest, TypingStart};
use crate::types::{
    Attachment, ChatId, ChatSettings, ChatSnapshot, ClientCommand, MediaKind, MemberRole,
    MessageId, MessageKind, PresenceStatus, RealtimeResult, ServerEvent, UserId,
};
use crate::utils::Validator;

const MAX_HISTORY_PAGE: u32 = 200;

type Connection = Arc<ConnectionHandle>;

impl Hub {
    pub(super) async fn dispatch(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        command: ClientCommand,
    ) -> RealtimeResult<()> {
        match command {
            ClientCommand::Ping => {
                reply(connection, ServerEvent::Pong { request_id });
                Ok(())
            }
            ClientCommand::JoinChat {
                chat_id,
                after_sequence,
            } => self.join_chat(connection, request_id, chat_id, after_sequence).await,
            ClientCommand::LeaveChat { chat_id } => {
                self.leave_chat(connection, request_id, chat_id).await
            }
            ClientCommand::CreateDirectChat { with_identity } => {
                let (chat, created) = self
                    .inner
                    .index
                    .create_direct(connection.user_id(), with_identity)
                    .await?;
                self.announce_chat(connection, request_id, chat, created);
                Ok(())
            }
            ClientCommand::CreateGroupChat {
                name,
                members,
                only_admins_can_post,
            } => {
                let chat = self
                    .inner
                    .index
                    .create_group(
                        connection.user_id(),
                        &name,
                        &members,
                        ChatSettings {
                            only_admins_can_post,
                        },
                    )
                    .await?;
                self.announce_chat(connection, request_id, chat, true);
                Ok(())
            }
            ClientCommand::AddMember {
                chat_id,
                user_id,
                role,
            } => {
                self.add_member(connection, request_id, chat_id, user_id, role)
                    .await
            }
            ClientCommand::RemoveMember { chat_id, user_id } => {
                self.remove_member(connection, request_id, chat_id, user_id)
                    .await
            }
            ClientCommand::UpdateSettings {
                chat_id,
                only_admins_can_post,
            } => {
                let settings = self
                    .inner
                    .index
                    .update_settings(
                        connection.user_id(),
                        &chat_id,
                        ChatSettings {
                            only_admins_can_post,
                        },
                    )
                    .await?;
                let members = self.inner.index.member_ids(&chat_id).await?;
                let event = Arc::new(ServerEvent::ChatUpdated { chat_id, settings });
                self.inner
                    .registry
                    .deliver_to_users(&members, &event, None, None);
                reply(connection, ServerEvent::Ack { request_id });
                Ok(())
            }
            ClientCommand::SendMessage {
                chat_id,
                content,
                message_type,
                reply_to,
                attachment,
            } => {
                self.send_message(
                    connection,
                    request_id,
                    chat_id,
                    content,
                    message_type,
                    reply_to,
                    attachment,
                )
                .await
            }
            ClientCommand::FetchHistory {
                chat_id,
                after_sequence,
                limit,
            } => {
                let limit = limit
                    .unwrap_or(self.inner.config.history_page_size)
                    .clamp(1, MAX_HISTORY_PAGE);
                let page = self
                    .inner
                    .pipeline
                    .history(&chat_id, connection.user_id(), after_sequence, limit)
                    .await?;
                reply(
                    connection,
                    ServerEvent::MessageHistory {
                        request_id,
                        chat_id,
                        messages: page.messages,
                        has_more: page.has_more,
                    },
                );
                Ok(())
            }
            ClientCommand::MarkRead {
                chat_id,
                message_ids,
            } => self.mark_read(connection, request_id, chat_id, message_ids).await,
            ClientCommand::StartTyping { chat_id } => self.start_typing(connection, chat_id).await,
            ClientCommand::StopTyping { chat_id } => {
                if self.inner.typing.stop(&chat_id, connection.user_id()) {
                    self.broadcast_typing(&chat_id, connection.user_id(), false)
                        .await;
                }
                Ok(())
            }
            ClientCommand::SetPresence { status } => {
                self.set_presence(connection, request_id, status).await
            }
            ClientCommand::StartCall {
                to_identity,
                offer,
                media_kind,
            } => {
                self.start_call(connection, request_id, to_identity, offer, media_kind)
                    .await
            }
            ClientCommand::AnswerCall {
                to_identity,
                answer,
            } => {
                let outcome = self.inner.calls.answer(
                    connection.id(),
                    connection.user_id(),
                    to_identity,
                    answer,
                    &self.inner.registry,
                )?;
                self.apply_relay(outcome).await;
                Ok(())
            }
            ClientCommand::IceCandidate {
                to_identity,
                candidate,
            } => {
                let outcome = self.inner.calls.ice(
                    connection.id(),
                    connection.user_id(),
                    to_identity,
                    candidate,
                    &self.inner.registry,
                );
                self.apply_relay(outcome).await;
                Ok(())
            }
            ClientCommand::EndCall { to_identity } => {
                let outcome = self.inner.calls.end(connection.user_id(), to_identity);
                self.apply_relay(outcome).await;
                Ok(())
            }
        }
    }

    async fn join_chat(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat_id: ChatId,
        after_sequence: Option<u64>,
    ) -> RealtimeResult<()> {
        Validator::chat_id(&chat_id)?;
        let (chat, _) = self
            .inner
            .index
            .require_member(&chat_id, connection.user_id())
            .await?;
        let last_sequence = self.inner.pipeline.last_sequence(&chat_id).await?;
        let presence = self.inner.presence.snapshot(&chat.member_ids());

        connection.join(&chat_id);
        reply(
            connection,
            ServerEvent::ChatJoined {
                request_id: request_id.clone(),
                chat,
                last_sequence,
                presence,
            },
        );

        if let Some(after) = after_sequence.filter(|after| *after < last_sequence) {
            let page = self
                .inner
                .pipeline
                .history(
                    &chat_id,
                    connection.user_id(),
                    Some(after),
                    MAX_HISTORY_PAGE,
                )
                .await?;
            if page.has_more {
                debug!(chat_id = %chat_id, after, "Join backfill truncated, client must page");
            }
            reply(
                connection,
                ServerEvent::MessageHistory {
                    request_id,
                    chat_id,
                    messages: page.messages,
                    has_more: page.has_more,
                },
            );
        }
        Ok(())
    }

    async fn leave_chat(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat_id: ChatId,
    ) -> RealtimeResult<()> {
        connection.leave(&chat_id);
        if self.inner.typing.stop(&chat_id, connection.user_id()) {
            self.broadcast_typing(&chat_id, connection.user_id(), false)
                .await;
        }
        reply(connection, ServerEvent::ChatLeft { request_id, chat_id });
        Ok(())
    }

    /// Joins members' live connections to a chat and tells them about it.
    fn announce_chat(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat: ChatSnapshot,
        created: bool,
    ) {
        connection.join(&chat.chat.id);
        if created {
            let event = Arc::new(ServerEvent::ChatCreated {
                request_id: None,
                chat: chat.clone(),
                created,
            });
            for member in chat.member_ids() {
                for handle in self.inner.registry.connections_for(member) {
                    handle.join(&chat.chat.id);
                    if handle.id() != connection.id() {
                        handle.deliver(event.clone());
                    }
                }
            }
        }
        reply(
            connection,
            ServerEvent::ChatCreated {
                request_id,
                chat,
                created,
            },
        );
    }

    async fn add_member(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat_id: ChatId,
        user_id: UserId,
        role: Option<MemberRole>,
    ) -> RealtimeResult<()> {
        let member = self
            .inner
            .index
            .add_member(
                connection.user_id(),
                &chat_id,
                user_id,
                role.unwrap_or(MemberRole::Member),
            )
            .await?;

        for handle in self.inner.registry.connections_for(user_id) {
            handle.join(&chat_id);
        }
        let members = self.inner.index.member_ids(&chat_id).await?;
        let event = Arc::new(ServerEvent::MemberAdded {
            chat_id: chat_id.clone(),
            member,
        });
        self.inner
            .registry
            .deliver_to_users(&members, &event, None, None);
        reply(connection, ServerEvent::Ack { request_id });
        Ok(())
    }

    async fn remove_member(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat_id: ChatId,
        user_id: UserId,
    ) -> RealtimeResult<()> {
        self.inner
            .index
            .remove_member(connection.user_id(), &chat_id, user_id)
            .await?;

        for handle in self.inner.registry.connections_for(user_id) {
            handle.leave(&chat_id);
        }
        if self.inner.typing.stop(&chat_id, user_id) {
            self.broadcast_typing(&chat_id, user_id, false).await;
        }

        let mut audience = self.inner.index.member_ids(&chat_id).await?;
        audience.push(user_id);
        let event = Arc::new(ServerEvent::MemberRemoved {
            chat_id: chat_id.clone(),
            user_id,
        });
        self.inner
            .registry
            .deliver_to_users(&audience, &event, None, None);
        reply(connection, ServerEvent::Ack { request_id });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_message(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat_id: ChatId,
        content: String,
        kind: MessageKind,
        reply_to: Option<MessageId>,
        attachment: Option<Attachment>,
    ) -> RealtimeResult<()> {
        let sender_id = connection.user_id();
        let outcome = self
            .inner
            .pipeline
            .send(SendRequest {
                chat_id,
                sender_id,
                content,
                kind,
                reply_to,
                attachment,
            })
            .await?;
        let message = outcome.message;

        reply(
            connection,
            ServerEvent::MessageAck {
                request_id,
                message_id: message.id.clone(),
                chat_id: message.chat_id.clone(),
                sequence: message.sequence,
            },
        );

        if self.inner.typing.stop(&message.chat_id, sender_id) {
            self.broadcast_typing(&message.chat_id, sender_id, false)
                .await;
        }

        for recipient in outcome.offline_recipients {
            self.inner
                .notifier
                .notification_warranted(recipient, &message)
                .await;
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    ) -> RealtimeResult<()> {
        let outcome = self
            .inner
            .receipts
            .mark_read(&chat_id, connection.user_id(), &message_ids)
            .await?;

        reply(
            connection,
            ServerEvent::ReadAck {
                request_id,
                chat_id: chat_id.clone(),
                message_ids: outcome.newly_marked,
            },
        );

        if outcome.schedule_flush {
            self.schedule_receipt_flush(chat_id).await;
        }
        Ok(())
    }

    async fn start_typing(&self, connection: &Connection, chat_id: ChatId) -> RealtimeResult<()> {
        let user_id = connection.user_id();
        self.inner.index.require_member(&chat_id, user_id).await?;

        match self.inner.typing.start(&chat_id, user_id, Instant::now()) {
            TypingStart::Started {
                generation,
                deadline,
            } => {
                self.broadcast_typing(&chat_id, user_id, true).await;
                self.schedule_typing_expiry(chat_id, user_id, generation, deadline);
            }
            TypingStart::Refreshed => {
                debug!(chat_id = %chat_id, user_id, "Typing deadline refreshed");
            }
        }
        Ok(())
    }

    async fn set_presence(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        status: PresenceStatus,
    ) -> RealtimeResult<()> {
        if let Some(record) = self
            .inner
            .presence
            .declare(connection.user_id(), status)?
        {
            self.broadcast_presence(record).await;
        }
        reply(connection, ServerEvent::Ack { request_id });
        Ok(())
    }

    async fn start_call(
        &self,
        connection: &Connection,
        request_id: Option<String>,
        to_identity: UserId,
        offer: Value,
        media_kind: MediaKind,
    ) -> RealtimeResult<()> {
        let outcome = self.inner.calls.start(
            connection.id(),
            connection.user_id(),
            to_identity,
            offer,
            media_kind,
            request_id,
            &self.inner.registry,
        )?;
        self.apply_relay(outcome).await;
        Ok(())
    }
}

fn reply(connection: &ConnectionHandle, event: ServerEvent) {
    connection.deliver(Arc::new(event));
}
