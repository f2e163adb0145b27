//! # Quadlink Gateway Crate
//!
//! The transport layer in front of the real-time hub: a WebSocket endpoint
//! that authenticates before upgrading and pumps JSON frames between the
//! socket and the hub, plus a health route reporting live counts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use quadlink_gateway::{create_router, GatewayState};
//! # async fn run(hub: quadlink_realtime::Hub) -> std::io::Result<()> {
//! let app = create_router(GatewayState::new(hub));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7070").await?;
//! axum::serve(listener, app).await
//! # }
//! ```

pub mod error;
pub mod middleware;
pub mod rest;
pub mod state;
pub mod websocket;

pub use error::{GatewayError, GatewayResult};
pub use state::GatewayState;

use std::sync::Arc;

use axum::Router;

pub fn create_router(state: GatewayState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(rest::create_rest_routes())
        .merge(websocket::create_websocket_routes())
        .with_state(state)
        .layer(middleware::create_cors_layer())
        .layer(middleware::create_trace_layer())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use quadlink_config::RealtimeConfig;
    use quadlink_realtime::repositories::{InMemoryStore, LogNotifier, StaticDirectory};
    use quadlink_realtime::Hub;
    use tower::ServiceExt;

    async fn test_router() -> (Router, Hub) {
        let directory = Arc::new(StaticDirectory::new());
        directory.issue_token("good", 1).await;
        let hub = Hub::new(
            RealtimeConfig::default(),
            Arc::new(InMemoryStore::new()),
            directory,
            Arc::new(LogNotifier),
        );
        (create_router(GatewayState::new(hub.clone())), hub)
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_hub_stats() {
        let (router, hub) = test_router().await;
        let _session = hub.connect("good").await.unwrap();

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 1);
        assert_eq!(json["onlineIdentities"], 1);
        assert_eq!(json["activeCalls"], 0);
    }

    #[tokio::test]
    async fn websocket_without_credential_is_unauthorized() {
        let (router, _hub) = test_router().await;
        let response = router.oneshot(upgrade_request("/ws")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn websocket_with_bad_credential_is_unauthorized() {
        let (router, hub) = test_router().await;
        let response = router
            .oneshot(upgrade_request("/ws?token=wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hub.stats().connections, 0);
    }
}
