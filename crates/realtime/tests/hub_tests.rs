//! Behavioural tests for the hub, driven through client frames with the
//! in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use quadlink_config::RealtimeConfig;
use quadlink_realtime::repositories::{InMemoryStore, RecordingNotifier, StaticDirectory};
use quadlink_realtime::services::{ConnectionHandle, OutboundReceiver};
use quadlink_realtime::types::{
    ChatKind, EndReason, MediaKind, MessageKind, PresenceStatus, UserId,
};
use quadlink_realtime::{ClientCommand, ClientFrame, Hub, RealtimeError, ServerEvent};

struct TestHub {
    hub: Hub,
    store: Arc<InMemoryStore>,
    directory: Arc<StaticDirectory>,
    notifier: Arc<RecordingNotifier>,
}

impl TestHub {
    fn new() -> Self {
        Self::with_config(RealtimeConfig {
            receipt_flush_ms: 0,
            ..RealtimeConfig::default()
        })
    }

    fn with_config(config: RealtimeConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(StaticDirectory::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let hub = Hub::new(config, store.clone(), directory.clone(), notifier.clone());
        Self {
            hub,
            store,
            directory,
            notifier,
        }
    }

    async fn connect(&self, user_id: UserId) -> Client {
        let token = format!("token-{user_id}");
        self.directory.issue_token(token.clone(), user_id).await;
        let session = self.hub.connect(&token).await.expect("connect");
        let mut client = Client {
            hub: self.hub.clone(),
            handle: session.handle,
            events: session.events,
        };
        client.drain();
        client
    }

    async fn group(&self, owner: &Client, name: &str, members: &[UserId]) -> String {
        owner
            .send(ClientCommand::CreateGroupChat {
                name: name.into(),
                members: members.to_vec(),
                only_admins_can_post: false,
            })
            .await;
        let chat_id = self
            .hub
            .membership()
            .chats_of(owner.handle.user_id())
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("group created");
        chat_id
    }
}

struct Client {
    hub: Hub,
    handle: Arc<ConnectionHandle>,
    events: OutboundReceiver,
}

impl Client {
    async fn send(&self, command: ClientCommand) {
        self.hub
            .handle_frame(&self.handle, ClientFrame::new(command))
            .await;
    }

    async fn request(&self, request_id: &str, command: ClientCommand) {
        self.hub
            .handle_frame(&self.handle, ClientFrame::new(command).with_request_id(request_id))
            .await;
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push((*event).clone()),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    fn drain_messages(&mut self) -> Vec<(String, u64)> {
        self.drain()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::MessageNew { message } => Some((message.id, message.sequence)),
                _ => None,
            })
            .collect()
    }

    async fn join(&mut self, chat_id: &str) {
        self.send(ClientCommand::JoinChat {
            chat_id: chat_id.into(),
            after_sequence: None,
        })
        .await;
        self.drain();
    }
}

fn text(chat_id: &str, content: &str) -> ClientCommand {
    ClientCommand::SendMessage {
        chat_id: chat_id.into(),
        content: content.into(),
        message_type: MessageKind::Text,
        reply_to: None,
        attachment: None,
    }
}

fn error_code(events: &[ServerEvent]) -> Option<String> {
    events.iter().find_map(|event| match event {
        ServerEvent::Error { code, .. } => Some(code.clone()),
        _ => None,
    })
}

fn typing_updates(events: &[ServerEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::TypingUpdate { is_typing, .. } => Some(*is_typing),
            _ => None,
        })
        .collect()
}

fn history_of(events: &[ServerEvent]) -> Option<(Vec<u64>, bool)> {
    events.iter().find_map(|event| match event {
        ServerEvent::MessageHistory {
            messages, has_more, ..
        } => Some((messages.iter().map(|m| m.sequence).collect(), *has_more)),
        _ => None,
    })
}

fn call_endings(events: &[ServerEvent]) -> Vec<EndReason> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::CallEnded { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn invalid_credential_is_rejected() {
    let test = TestHub::new();
    let err = test.hub.connect("nope").await.err().unwrap();
    assert!(matches!(err, RealtimeError::Unauthorized { .. }));
    assert_eq!(test.hub.stats().connections, 0);
}

#[tokio::test]
async fn hello_is_the_first_event() {
    let test = TestHub::new();
    test.directory.issue_token("t", 7).await;
    let mut session = test.hub.connect("t").await.unwrap();
    let first = session.events.try_recv().unwrap();
    assert_eq!(
        *first,
        ServerEvent::Hello {
            user_id: 7,
            connection_id: session.handle.id()
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_are_observed_in_one_order() {
    let test = TestHub::new();
    test.store.set_save_latency(Duration::from_millis(1));
    let mut alice_phone = test.connect(1).await;
    let mut alice_laptop = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let mut carol = test.connect(3).await;
    let chat_id = test.group(&alice_phone, "order", &[2, 3]).await;

    let mut tasks = Vec::new();
    for n in 0..30 {
        let sender = match n % 3 {
            0 => alice_phone.handle.clone(),
            1 => bob.handle.clone(),
            _ => carol.handle.clone(),
        };
        let hub = test.hub.clone();
        let command = text(&chat_id, &format!("message {n}"));
        tasks.push(tokio::spawn(async move {
            hub.handle_frame(&sender, ClientFrame::new(command)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let reference = alice_phone.drain_messages();
    assert_eq!(reference.len(), 30);
    let sequences: Vec<u64> = reference.iter().map(|(_, seq)| *seq).collect();
    assert_eq!(sequences, (1..=30).collect::<Vec<u64>>());

    assert_eq!(alice_laptop.drain_messages(), reference);
    assert_eq!(bob.drain_messages(), reference);
    assert_eq!(carol.drain_messages(), reference);
}

#[tokio::test]
async fn each_device_receives_a_message_exactly_once() {
    let test = TestHub::new();
    let mut phone = test.connect(1).await;
    let mut laptop = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&phone, "devices", &[2]).await;
    laptop.drain();
    bob.drain();

    phone.request("send-1", text(&chat_id, "hi")).await;

    let phone_events = phone.drain();
    let ack_id = phone_events
        .iter()
        .find_map(|event| match event {
            ServerEvent::MessageAck {
                request_id,
                message_id,
                sequence,
                ..
            } => {
                assert_eq!(request_id.as_deref(), Some("send-1"));
                assert_eq!(*sequence, 1);
                Some(message_id.clone())
            }
            _ => None,
        })
        .expect("sender gets an ack");

    let phone_messages: Vec<_> = phone_events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageNew { message } => Some(message.id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(phone_messages, vec![ack_id.clone()]);
    assert_eq!(laptop.drain_messages(), vec![(ack_id.clone(), 1)]);
    assert_eq!(bob.drain_messages(), vec![(ack_id, 1)]);
}

#[tokio::test]
async fn redelivery_of_the_same_message_is_suppressed() {
    let test = TestHub::new();
    let mut phone = test.connect(1).await;
    let chat_id = test.group(&phone, "dedup", &[]).await;
    phone.send(text(&chat_id, "once")).await;
    let events = phone.drain();
    let message = events
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::MessageNew { message } => Some(message),
            _ => None,
        })
        .unwrap();

    let replay = Arc::new(ServerEvent::MessageNew { message });
    let delivered = test.hub.registry().deliver_to_user(1, &replay, None);
    assert_eq!(delivered, 0);
    assert!(phone.drain().is_empty());
}

#[tokio::test]
async fn failed_persist_reports_unavailable_to_sender_only() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "flaky", &[2]).await;
    bob.drain();

    test.store.set_available(false);
    alice.request("r1", text(&chat_id, "lost")).await;
    test.store.set_available(true);

    let events = alice.drain();
    assert_eq!(error_code(&events).as_deref(), Some("unavailable"));
    assert!(bob.drain().is_empty());
}

#[tokio::test]
async fn offline_members_warrant_notifications() {
    let test = TestHub::new();
    let alice = test.connect(1).await;
    let chat_id = test.group(&alice, "notify", &[2, 3]).await;
    let _carol = test.connect(3).await;

    alice.send(text(&chat_id, "ping")).await;

    let notified = test.notifier.notified().await;
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].0, 2);
}

#[tokio::test]
async fn mark_read_is_idempotent_and_broadcast_once() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "reads", &[2]).await;
    alice.join(&chat_id).await;
    bob.join(&chat_id).await;

    alice.send(text(&chat_id, "read me")).await;
    let (message_id, _) = bob.drain_messages().remove(0);
    alice.drain();

    let read = ClientCommand::MarkRead {
        chat_id: chat_id.clone(),
        message_ids: vec![message_id.clone(), message_id.clone()],
    };
    bob.send(read.clone()).await;
    bob.send(read).await;

    let acks: Vec<Vec<String>> = bob
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::ReadAck { message_ids, .. } => Some(message_ids),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![vec![message_id.clone()], Vec::new()]);

    let broadcasts: Vec<_> = alice
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::MessageRead {
                message_ids,
                user_id,
                ..
            } => Some((message_ids, user_id)),
            _ => None,
        })
        .collect();
    assert_eq!(broadcasts, vec![(vec![message_id], 2)]);
}

#[tokio::test(start_paused = true)]
async fn reads_within_the_flush_window_are_merged() {
    let test = TestHub::with_config(RealtimeConfig {
        receipt_flush_ms: 150,
        ..RealtimeConfig::default()
    });
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "batch", &[2]).await;
    alice.join(&chat_id).await;
    bob.join(&chat_id).await;

    alice.send(text(&chat_id, "one")).await;
    alice.send(text(&chat_id, "two")).await;
    let ids: Vec<String> = bob.drain_messages().into_iter().map(|(id, _)| id).collect();
    alice.drain();

    for id in &ids {
        bob.send(ClientCommand::MarkRead {
            chat_id: chat_id.clone(),
            message_ids: vec![id.clone()],
        })
        .await;
    }
    assert!(alice.drain().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let batches: Vec<Vec<String>> = alice
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::MessageRead { message_ids, .. } => Some(message_ids),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![ids]);
}

#[tokio::test(start_paused = true)]
async fn typing_expires_without_stop() {
    let test = TestHub::new();
    let alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "typing", &[2]).await;
    bob.join(&chat_id).await;

    alice
        .send(ClientCommand::StartTyping {
            chat_id: chat_id.clone(),
        })
        .await;
    assert_eq!(typing_updates(&bob.drain()), vec![true]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    alice
        .send(ClientCommand::StartTyping {
            chat_id: chat_id.clone(),
        })
        .await;

    // Refreshed at t=2s, so still typing at t=4.5s.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(typing_updates(&bob.drain()).is_empty());
    assert!(test.hub.typing().is_typing(&chat_id, 1));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(typing_updates(&bob.drain()), vec![false]);
    assert!(!test.hub.typing().is_typing(&chat_id, 1));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(typing_updates(&bob.drain()).is_empty());
}

#[tokio::test]
async fn typing_is_not_echoed_and_stops_on_send() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "typing", &[2]).await;
    alice.join(&chat_id).await;
    bob.join(&chat_id).await;

    alice
        .send(ClientCommand::StartTyping {
            chat_id: chat_id.clone(),
        })
        .await;
    alice.send(text(&chat_id, "done typing")).await;

    assert!(typing_updates(&alice.drain()).is_empty());
    assert_eq!(typing_updates(&bob.drain()), vec![true, false]);
}

#[tokio::test]
async fn left_connection_still_gets_messages_but_not_typing_or_reads() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "leaving", &[2]).await;
    alice.join(&chat_id).await;
    bob.join(&chat_id).await;

    alice.send(text(&chat_id, "before")).await;
    let (message_id, _) = bob.drain_messages().remove(0);

    alice
        .request(
            "bye",
            ClientCommand::LeaveChat {
                chat_id: chat_id.clone(),
            },
        )
        .await;
    assert!(alice.drain().iter().any(|event| matches!(
        event,
        ServerEvent::ChatLeft { request_id: Some(id), .. } if id == "bye"
    )));
    assert!(!alice.handle.has_joined(&chat_id));

    bob.send(ClientCommand::StartTyping {
        chat_id: chat_id.clone(),
    })
    .await;
    bob.send(ClientCommand::MarkRead {
        chat_id: chat_id.clone(),
        message_ids: vec![message_id],
    })
    .await;
    bob.send(text(&chat_id, "after")).await;

    let events = alice.drain();
    assert!(typing_updates(&events).is_empty());
    assert!(!events
        .iter()
        .any(|event| matches!(event, ServerEvent::MessageRead { .. })));
    let delivered: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageNew { message } => Some(message.content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec!["after".to_string()]);
}

#[tokio::test]
async fn direct_chat_is_shared_by_both_initiators() {
    let test = TestHub::new();
    test.directory.connect(1, 2).await;
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;

    alice
        .send(ClientCommand::CreateDirectChat { with_identity: 2 })
        .await;
    bob.send(ClientCommand::CreateDirectChat { with_identity: 1 })
        .await;

    let created = |events: Vec<ServerEvent>| -> Vec<(String, bool)> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::ChatCreated { chat, created, .. } => {
                    assert_eq!(chat.chat.kind, ChatKind::Direct);
                    Some((chat.chat.id, created))
                }
                _ => None,
            })
            .collect()
    };
    let alice_view = created(alice.drain());
    let bob_view = created(bob.drain());

    assert_eq!(alice_view.len(), 1);
    assert!(alice_view[0].1);
    // Bob heard about the new chat, then got it back from his own request.
    assert_eq!(bob_view.len(), 2);
    assert!(bob_view.iter().all(|(id, _)| *id == alice_view[0].0));
    assert!(!bob_view[1].1);
}

#[tokio::test]
async fn direct_chat_requires_a_contact() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    alice
        .request("d1", ClientCommand::CreateDirectChat { with_identity: 2 })
        .await;
    assert_eq!(error_code(&alice.drain()).as_deref(), Some("forbidden"));
}

#[tokio::test]
async fn removed_member_loses_fan_out_and_access() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "club", &[2]).await;
    bob.join(&chat_id).await;

    alice
        .send(ClientCommand::RemoveMember {
            chat_id: chat_id.clone(),
            user_id: 2,
        })
        .await;
    let removed = bob.drain();
    assert!(removed.iter().any(|event| matches!(
        event,
        ServerEvent::MemberRemoved { user_id: 2, .. }
    )));

    alice.send(text(&chat_id, "after removal")).await;
    assert!(bob.drain_messages().is_empty());
    assert_eq!(alice.drain_messages().len(), 1);

    bob.request(
        "join",
        ClientCommand::JoinChat {
            chat_id: chat_id.clone(),
            after_sequence: None,
        },
    )
    .await;
    let events = bob.drain();
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::Error { request_id: Some(id), code, .. } if id == "join" && code == "forbidden"
    )));
}

#[tokio::test]
async fn join_with_cursor_backfills_history() {
    let test = TestHub::new();
    let alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "history", &[2]).await;
    for n in 0..4 {
        alice.send(text(&chat_id, &format!("m{n}"))).await;
    }
    bob.drain();

    bob.request(
        "j",
        ClientCommand::JoinChat {
            chat_id: chat_id.clone(),
            after_sequence: Some(2),
        },
    )
    .await;
    let events = bob.drain();

    let joined = events.iter().find_map(|event| match event {
        ServerEvent::ChatJoined {
            last_sequence,
            presence,
            ..
        } => Some((*last_sequence, presence.clone())),
        _ => None,
    });
    let (last_sequence, presence) = joined.expect("chat.joined reply");
    assert_eq!(last_sequence, 4);
    assert!(presence
        .iter()
        .any(|record| record.user_id == 1 && record.status == PresenceStatus::Online));

    let (history, has_more) = history_of(&events).expect("history reply");
    assert_eq!(history, vec![3, 4]);
    assert!(!has_more);
}

#[tokio::test]
async fn join_backfill_reports_truncation() {
    let test = TestHub::new();
    let alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "busy", &[2]).await;
    for n in 0..205 {
        alice.send(text(&chat_id, &format!("m{n}"))).await;
    }
    bob.drain();

    bob.send(ClientCommand::JoinChat {
        chat_id: chat_id.clone(),
        after_sequence: Some(0),
    })
    .await;
    let (page, has_more) = history_of(&bob.drain()).expect("history reply");
    assert_eq!(page.len(), 200);
    assert_eq!(page.first(), Some(&1));
    assert_eq!(page.last(), Some(&200));
    assert!(has_more);

    bob.send(ClientCommand::FetchHistory {
        chat_id: chat_id.clone(),
        after_sequence: Some(200),
        limit: None,
    })
    .await;
    let (rest, has_more) = history_of(&bob.drain()).expect("history reply");
    assert_eq!(rest, vec![201, 202, 203, 204, 205]);
    assert!(!has_more);
}

#[tokio::test]
async fn fetch_history_flags_further_pages() {
    let test = TestHub::new();
    let alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "pages", &[2]).await;
    for n in 0..3 {
        alice.send(text(&chat_id, &format!("m{n}"))).await;
    }
    bob.drain();

    bob.send(ClientCommand::FetchHistory {
        chat_id: chat_id.clone(),
        after_sequence: Some(0),
        limit: Some(2),
    })
    .await;
    assert_eq!(history_of(&bob.drain()), Some((vec![1, 2], true)));

    bob.send(ClientCommand::FetchHistory {
        chat_id,
        after_sequence: Some(2),
        limit: Some(2),
    })
    .await;
    assert_eq!(history_of(&bob.drain()), Some((vec![3], false)));
}

#[tokio::test]
async fn only_admins_can_post_when_restricted() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;
    let chat_id = test.group(&alice, "news", &[2]).await;

    alice
        .request(
            "s",
            ClientCommand::UpdateSettings {
                chat_id: chat_id.clone(),
                only_admins_can_post: true,
            },
        )
        .await;
    assert!(alice
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::Ack { request_id: Some(id) } if id == "s")));
    assert!(bob
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::ChatUpdated { .. })));

    bob.send(text(&chat_id, "can I?")).await;
    assert_eq!(error_code(&bob.drain()).as_deref(), Some("forbidden"));
}

#[tokio::test(start_paused = true)]
async fn presence_survives_reconnect_within_grace() {
    let test = TestHub::new();
    test.directory.connect(1, 2).await;
    let mut bob = test.connect(2).await;

    let alice = test.connect(1).await;
    let online: Vec<_> = bob
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::PresenceChanged { user_id: 1, status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(online, vec![PresenceStatus::Online]);

    test.hub.disconnect(alice.handle.id()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let alice_again = test.connect(1).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(bob.drain().is_empty());

    test.hub.disconnect(alice_again.handle.id()).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    let offline: Vec<_> = bob
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::PresenceChanged {
                user_id: 1,
                status,
                last_seen,
            } => Some((status, last_seen.is_some())),
            _ => None,
        })
        .collect();
    assert_eq!(offline, vec![(PresenceStatus::Offline, true)]);
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_closed_and_goes_offline() {
    let test = TestHub::with_config(RealtimeConfig {
        receipt_flush_ms: 0,
        idle_timeout_seconds: 60,
        ..RealtimeConfig::default()
    });
    test.directory.connect(1, 2).await;
    let mut bob = test.connect(2).await;
    let alice = test.connect(1).await;
    bob.drain();
    let sweeper = test.hub.spawn_idle_sweeper().expect("idle timeout is set");

    // Bob stays active; Alice never sends a frame.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        bob.send(ClientCommand::Ping).await;
    }
    sweeper.abort();

    assert!(alice.handle.is_closed());
    assert!(!bob.handle.is_closed());
    assert_eq!(test.hub.registry().connection_count(1), 0);
    assert_eq!(test.hub.presence().status_of(1), PresenceStatus::Offline);

    let offline: Vec<_> = bob
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::PresenceChanged { user_id: 1, status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(offline, vec![PresenceStatus::Offline]);

    let Client {
        handle, mut events, ..
    } = alice;
    drop(handle);
    loop {
        match events.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(err) => {
                assert_eq!(err, TryRecvError::Closed);
                break;
            }
        }
    }
}

#[tokio::test]
async fn declared_away_reaches_contacts() {
    let test = TestHub::new();
    test.directory.connect(1, 2).await;
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;

    alice
        .send(ClientCommand::SetPresence {
            status: PresenceStatus::Away,
        })
        .await;
    assert!(bob.drain().iter().any(|event| matches!(
        event,
        ServerEvent::PresenceChanged {
            user_id: 1,
            status: PresenceStatus::Away,
            ..
        }
    )));
    // Never echoed to the identity itself.
    assert!(!alice
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::PresenceChanged { .. })));
}

#[tokio::test]
async fn call_to_offline_identity_ends_unreachable() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;

    alice
        .send(ClientCommand::StartCall {
            to_identity: 2,
            offer: json!({"sdp": "offer"}),
            media_kind: MediaKind::Voice,
        })
        .await;

    assert_eq!(call_endings(&alice.drain()), vec![EndReason::Unreachable]);
    assert_eq!(test.hub.calls().active_sessions(), 0);
    let log = test.store.recorded_calls().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, EndReason::Unreachable);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_ends_with_no_answer_once() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut bob = test.connect(2).await;

    alice
        .request(
            "call",
            ClientCommand::StartCall {
                to_identity: 2,
                offer: json!({"sdp": "offer"}),
                media_kind: MediaKind::Video,
            },
        )
        .await;
    assert!(alice.drain().iter().any(|event| matches!(
        event,
        ServerEvent::CallOutgoing { request_id: Some(id), to_identity: 2, .. } if id == "call"
    )));
    assert!(bob
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::CallIncoming { from_identity: 1, .. })));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(call_endings(&alice.drain()), vec![EndReason::NoAnswer]);
    assert_eq!(call_endings(&bob.drain()), vec![EndReason::NoAnswer]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(alice.drain().is_empty());
    assert!(bob.drain().is_empty());
    assert_eq!(test.hub.calls().active_sessions(), 0);
    assert_eq!(test.store.recorded_calls().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn first_answering_device_wins() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let mut phone = test.connect(2).await;
    let mut laptop = test.connect(2).await;

    alice
        .send(ClientCommand::StartCall {
            to_identity: 2,
            offer: json!({"sdp": "offer"}),
            media_kind: MediaKind::Voice,
        })
        .await;
    assert_eq!(phone.drain().len(), 1);
    assert_eq!(laptop.drain().len(), 1);

    phone
        .send(ClientCommand::AnswerCall {
            to_identity: 1,
            answer: json!({"sdp": "answer"}),
        })
        .await;
    assert!(alice
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::CallAccepted { from_identity: 2, .. })));
    assert_eq!(call_endings(&laptop.drain()), vec![EndReason::AnsweredElsewhere]);
    assert!(phone.drain().is_empty());

    laptop
        .request(
            "late",
            ClientCommand::AnswerCall {
                to_identity: 1,
                answer: json!({}),
            },
        )
        .await;
    assert_eq!(error_code(&laptop.drain()).as_deref(), Some("conflict"));

    alice
        .send(ClientCommand::IceCandidate {
            to_identity: 2,
            candidate: json!({"candidate": "udp 1"}),
        })
        .await;
    assert!(phone
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::CallIce { from_identity: 1, .. })));
    assert!(laptop.drain().is_empty());

    // The ringing timer must not end an answered call.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(test.hub.calls().active_sessions(), 1);

    alice.send(ClientCommand::EndCall { to_identity: 2 }).await;
    assert_eq!(call_endings(&phone.drain()), vec![EndReason::Hangup]);
    // The laptop already saw answered-elsewhere.
    assert!(laptop.drain().is_empty());
    assert_eq!(test.hub.calls().active_sessions(), 0);
}

#[tokio::test]
async fn losing_the_answering_device_ends_the_call() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let bob = test.connect(2).await;

    alice
        .send(ClientCommand::StartCall {
            to_identity: 2,
            offer: json!({}),
            media_kind: MediaKind::Voice,
        })
        .await;
    bob.send(ClientCommand::AnswerCall {
        to_identity: 1,
        answer: json!({}),
    })
    .await;
    alice.drain();

    test.hub.disconnect(bob.handle.id()).await;
    assert_eq!(call_endings(&alice.drain()), vec![EndReason::Unreachable]);
    assert_eq!(test.hub.calls().active_sessions(), 0);
}

#[tokio::test]
async fn malformed_frames_get_an_error() {
    let test = TestHub::new();
    let mut alice = test.connect(1).await;
    let handle = alice.handle.clone();
    test.hub.handle_text(&handle, "{not json").await;
    test.hub.handle_text(&handle, r#"{"type":"ping","requestId":"p"}"#).await;

    let events = alice.drain();
    assert_eq!(error_code(&events).as_deref(), Some("invalid_argument"));
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::Pong { request_id: Some(id) } if id == "p")));
}
