//! The hub ties the components together.
//!
//! It admits connections, routes client commands to the owning component,
//! resolves deliveries against the registry, and runs every timer the core
//! needs: presence grace, typing expiry, receipt flush, ringing timeout and
//! the optional idle sweep.

mod handlers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use quadlink_config::RealtimeConfig;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::repositories::{DirectoryService, Notifier, PersistenceService};
use crate::services::{
    Audience, CallRelay, ConnectionHandle, ConnectionRegistry, Delivery, MembershipIndex,
    MessagePipeline, OutboundReceiver, PresenceTracker, ReadReceiptAggregator, RelayOutcome,
    TypingCoordinator, TypingExpiry,
};
use crate::types::{
    ChatId, ClientFrame, ConnectionId, PresenceRecord, RealtimeError, RealtimeResult, ServerEvent,
    UserId,
};

/// A live connection as seen by the transport: the handle for inbound
/// commands and the receiver its writer drains.
pub struct Session {
    pub handle: Arc<ConnectionHandle>,
    pub events: OutboundReceiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub online_identities: usize,
    pub active_calls: usize,
}

struct HubInner {
    config: RealtimeConfig,
    store: Arc<dyn PersistenceService>,
    directory: Arc<dyn DirectoryService>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceTracker,
    index: Arc<MembershipIndex>,
    pipeline: MessagePipeline,
    typing: TypingCoordinator,
    receipts: ReadReceiptAggregator,
    calls: CallRelay,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(
        config: RealtimeConfig,
        store: Arc<dyn PersistenceService>,
        directory: Arc<dyn DirectoryService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.outbound_queue_capacity,
            config.dedup_window,
        ));
        let index = Arc::new(MembershipIndex::new(store.clone(), directory.clone()));
        let pipeline = MessagePipeline::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            config.max_message_length,
        );
        let receipts =
            ReadReceiptAggregator::new(store.clone(), index.clone(), config.receipt_flush());

        let inner = HubInner {
            presence: PresenceTracker::new(config.presence_grace()),
            typing: TypingCoordinator::new(config.typing_ttl()),
            calls: CallRelay::new(config.ringing_timeout()),
            config,
            store,
            directory,
            notifier,
            registry,
            index,
            pipeline,
            receipts,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn membership(&self) -> &MembershipIndex {
        &self.inner.index
    }

    pub fn calls(&self) -> &CallRelay {
        &self.inner.calls
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.inner.typing
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.inner.registry.total_connections(),
            online_identities: self.inner.registry.online_identities(),
            active_calls: self.inner.calls.active_sessions(),
        }
    }

    /// Resolve a bearer credential to an identity.
    pub async fn authenticate(&self, token: &str) -> RealtimeResult<UserId> {
        let token = token.trim();
        if token.is_empty() {
            return Err(RealtimeError::unauthorized("missing credential"));
        }
        self.inner
            .directory
            .verify_credential(token)
            .await?
            .ok_or_else(|| RealtimeError::unauthorized("invalid or expired credential"))
    }

    pub async fn connect(&self, token: &str) -> RealtimeResult<Session> {
        let user_id = self.authenticate(token).await?;
        Ok(self.admit(user_id).await)
    }

    /// Register a connection for an already authenticated identity.
    pub async fn admit(&self, user_id: UserId) -> Session {
        let admission = self.inner.registry.admit(user_id);
        let handle = admission.handle;
        handle.deliver(Arc::new(ServerEvent::Hello {
            user_id,
            connection_id: handle.id(),
        }));

        if let Some(record) = self.inner.presence.connected(user_id) {
            self.broadcast_presence(record).await;
        }

        Session {
            handle,
            events: admission.events,
        }
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(removal) = self.inner.registry.remove(connection_id) else {
            return;
        };
        let user_id = removal.handle.user_id();

        let outcome = self
            .inner
            .calls
            .connection_lost(connection_id, user_id, removal.remaining);
        self.apply_relay(outcome).await;

        if removal.remaining > 0 {
            return;
        }
        for chat_id in self.inner.typing.clear_user(user_id) {
            self.broadcast_typing(&chat_id, user_id, false).await;
        }
        if let Some(generation) = self.inner.presence.disconnected(user_id, 0) {
            self.schedule_offline(user_id, generation);
        }
    }

    /// Parse and handle one inbound text frame.
    pub async fn handle_text(&self, connection: &Arc<ConnectionHandle>, text: &str) {
        connection.touch();
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(connection, frame).await,
            Err(err) => {
                debug!(connection_id = connection.id(), error = %err, "Malformed client frame");
                let err = RealtimeError::invalid_argument(format!("malformed command: {err}"));
                connection.deliver(Arc::new(ServerEvent::error(None, err.code(), err.to_string())));
            }
        }
    }

    pub async fn handle_frame(&self, connection: &Arc<ConnectionHandle>, frame: ClientFrame) {
        connection.touch();
        let ClientFrame {
            request_id,
            command,
        } = frame;
        let name = command.name();

        if let Err(err) = self.dispatch(connection, request_id.clone(), command).await {
            debug!(
                connection_id = connection.id(),
                user_id = connection.user_id(),
                command = name,
                error = %err,
                "Command rejected"
            );
            connection.deliver(Arc::new(ServerEvent::error(
                request_id,
                err.code(),
                err.to_string(),
            )));
        }
    }

    /// Disconnects connections idle for longer than the configured timeout.
    /// Returns `None` when the idle timeout is disabled.
    pub fn spawn_idle_sweeper(&self) -> Option<JoinHandle<()>> {
        let max_idle = self.inner.config.idle_timeout()?;
        let period = (max_idle / 2).max(Duration::from_secs(1));
        let hub = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for connection_id in hub.inner.registry.idle_connections(max_idle) {
                    info!(connection_id, "Closing idle connection");
                    hub.disconnect(connection_id).await;
                }
            }
        }))
    }

    fn deliver(&self, delivery: Delivery) {
        let event = Arc::new(delivery.event);
        let delivered = match delivery.audience {
            Audience::Connection(connection_id) => {
                usize::from(self.inner.registry.deliver_to_connection(connection_id, &event))
            }
            Audience::User { user_id, except } => {
                self.inner.registry.deliver_to_user(user_id, &event, except)
            }
        };
        if delivered == 0 {
            debug!(event = event.event_type(), "Event had no live recipient");
        }
    }

    fn deliver_all(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.deliver(delivery);
        }
    }

    async fn apply_relay(&self, outcome: RelayOutcome) {
        self.deliver_all(outcome.deliveries);
        if let Some(call_id) = outcome.ringing {
            self.schedule_ringing_timeout(call_id);
        }
        for entry in outcome.ended {
            if let Err(err) = self.inner.store.record_call(&entry).await {
                warn!(call_id = %entry.call_id, error = %err, "Failed to record call log entry");
            }
        }
    }

    async fn presence_audience(&self, user_id: UserId) -> HashSet<UserId> {
        let mut audience = match self.inner.index.co_members(user_id).await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(user_id, error = %err, "Could not resolve co-members for presence");
                HashSet::new()
            }
        };
        match self.inner.directory.contacts_of(user_id).await {
            Ok(contacts) => audience.extend(contacts),
            Err(err) => warn!(user_id, error = %err, "Could not resolve contacts for presence"),
        }
        audience.remove(&user_id);
        audience
    }

    async fn broadcast_presence(&self, record: PresenceRecord) {
        let audience = self.presence_audience(record.user_id).await;
        let event = Arc::new(ServerEvent::presence(record));
        let delivered =
            self.inner
                .registry
                .deliver_to_users(&audience, &event, Some(record.user_id), None);
        debug!(
            user_id = record.user_id,
            status = ?record.status,
            delivered,
            "Presence broadcast"
        );
    }

    fn schedule_offline(&self, user_id: UserId, generation: u64) {
        let hub = self.clone();
        let grace = self.inner.presence.grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_connected = hub.inner.registry.is_online(user_id);
            if let Some(record) =
                hub.inner
                    .presence
                    .confirm_offline(user_id, generation, still_connected)
            {
                hub.broadcast_presence(record).await;
            }
        });
    }

    async fn broadcast_typing(&self, chat_id: &str, user_id: UserId, is_typing: bool) {
        let members = match self.inner.index.member_ids(chat_id).await {
            Ok(members) => members,
            Err(err) => {
                warn!(
                    chat_id,
                    user_id,
                    error = %err,
                    "Could not resolve members for typing update"
                );
                return;
            }
        };
        let event = Arc::new(ServerEvent::TypingUpdate {
            chat_id: chat_id.to_string(),
            user_id,
            is_typing,
        });
        self.inner
            .registry
            .deliver_to_users(&members, &event, Some(user_id), Some(chat_id));
    }

    fn schedule_typing_expiry(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        generation: u64,
        deadline: Instant,
    ) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut deadline = deadline;
            loop {
                tokio::time::sleep_until(deadline).await;
                match hub
                    .inner
                    .typing
                    .expire(&chat_id, user_id, generation, Instant::now())
                {
                    TypingExpiry::Expired => {
                        hub.broadcast_typing(&chat_id, user_id, false).await;
                        break;
                    }
                    TypingExpiry::Pending(next) => deadline = next,
                    TypingExpiry::Superseded => break,
                }
            }
        });
    }

    async fn schedule_receipt_flush(&self, chat_id: ChatId) {
        let interval = self.inner.receipts.flush_interval();
        if interval.is_zero() {
            self.flush_receipts(&chat_id).await;
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            hub.flush_receipts(&chat_id).await;
        });
    }

    async fn flush_receipts(&self, chat_id: &str) {
        let batches = self.inner.receipts.take_pending(chat_id);
        if batches.is_empty() {
            return;
        }
        let members = match self.inner.index.member_ids(chat_id).await {
            Ok(members) => members,
            Err(err) => {
                warn!(chat_id, error = %err, "Could not resolve members for read receipts");
                return;
            }
        };
        for batch in batches {
            let reader = batch.user_id;
            let event = Arc::new(ServerEvent::MessageRead {
                chat_id: batch.chat_id,
                message_ids: batch.message_ids,
                user_id: reader,
                read_at: batch.read_at,
            });
            self.inner
                .registry
                .deliver_to_users(&members, &event, Some(reader), Some(chat_id));
        }
    }

    fn schedule_ringing_timeout(&self, call_id: String) {
        let hub = self.clone();
        let timeout = self.inner.calls.ringing_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let outcome = hub.inner.calls.expire_ringing(&call_id);
            hub.apply_relay(outcome).await;
        });
    }
}
