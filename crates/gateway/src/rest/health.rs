use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use quadlink_realtime::HubStats;
use serde::Serialize;

use crate::state::GatewayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    #[serde(flatten)]
    pub stats: HubStats,
}

pub async fn health_check(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        stats: state.hub.stats(),
    })
}
