use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quadlink_realtime::services::{ConnectionHandle, OutboundReceiver};
use quadlink_realtime::types::UserId;
use quadlink_realtime::Hub;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Drives one socket until either side goes away, then deregisters it.
pub(super) async fn serve(socket: WebSocket, hub: Hub, user_id: UserId) {
    let session = hub.admit(user_id).await;
    let handle = session.handle;
    let connection_id = handle.id();
    info!(connection_id, user_id, "WebSocket connected");

    let (sender, receiver) = socket.split();
    let mut send_task = tokio::spawn(write_events(sender, session.events, handle.clone()));
    let mut receive_task = tokio::spawn(read_commands(receiver, hub.clone(), handle.clone()));

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => {}
    }

    hub.disconnect(connection_id).await;
    handle.close();
    let _ = send_task.await;
    info!(connection_id, user_id, "WebSocket disconnected");
}

async fn read_commands(
    mut receiver: SplitStream<WebSocket>,
    hub: Hub,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = handle.closed() => break,
        };
        match frame {
            Some(Ok(Message::Text(text))) => hub.handle_text(&handle, &text).await,
            Some(Ok(Message::Binary(_))) => {
                debug!(connection_id = handle.id(), "Ignoring binary frame");
                handle.touch();
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => handle.touch(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(err)) => {
                debug!(connection_id = handle.id(), error = %err, "WebSocket read failed");
                break;
            }
        }
    }
}

async fn write_events(
    mut sender: SplitSink<WebSocket, Message>,
    mut events: OutboundReceiver,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = handle.closed() => break,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    connection_id = handle.id(),
                    skipped,
                    "Outbound queue overflowed, oldest events dropped"
                );
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let text = match serde_json::to_string(&*event) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = event.event_type(), error = %err, "Failed to encode event");
                continue;
            }
        };
        if let Err(err) = sender.send(Message::Text(text)).await {
            debug!(connection_id = handle.id(), error = %err, "WebSocket write failed");
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}
