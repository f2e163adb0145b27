//! WebSocket endpoint: credential check before upgrade, then one session per socket.

mod connection;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::middleware::bearer_token;
use crate::state::GatewayState;

#[derive(Debug, Default, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

pub fn create_websocket_routes() -> Router<Arc<GatewayState>> {
    Router::new().route("/ws", get(websocket_handler))
}

/// Credentials are checked before the upgrade is resolved: a bad credential
/// answers 401 whether or not the request could be upgraded.
pub async fn websocket_handler(
    Query(query): Query<WebSocketQuery>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> GatewayResult<Response> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| GatewayError::AuthenticationFailed("missing credential".to_string()))?;

    let user_id = state.hub.authenticate(token).await?;
    debug!(user_id, "WebSocket credential accepted");

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| connection::serve(socket, hub, user_id)))
}
