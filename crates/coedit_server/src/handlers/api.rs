use crate::sync::RoomRegistry;
use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub rooms: Arc<RoomRegistry>,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(state)
}

/// GET /api/status - Get server status (public endpoint)
async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let stats = state.rooms.stats().await;

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
    })
}
