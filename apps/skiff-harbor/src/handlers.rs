use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use skiff_protocol::signal::RoomStatus;
use tracing::error;

use crate::registry::RoomRegistry;

pub type SharedRegistry = Arc<RoomRegistry>;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub code: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Allocate a fresh room code. The room itself comes into being on the first
/// websocket join with this code.
pub async fn create_room(
    State(state): State<AppState>,
) -> Result<Json<CreateRoomResponse>, Response> {
    match state.registry.allocate_code() {
        Ok(code) => Ok(Json(CreateRoomResponse {
            code,
            ttl_seconds: state.room_ttl_seconds,
        })),
        Err(err) => {
            error!(error = %err, "room code allocation failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RoomStatusResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn room_status(
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Json<RoomStatusResponse> {
    match state.registry.status(&code) {
        Some(snapshot) => Json(RoomStatusResponse {
            exists: true,
            status: Some(snapshot.status),
            created_at: Some(snapshot.created_at),
            expires_at: Some(snapshot.expires_at),
        }),
        None => Json(RoomStatusResponse {
            exists: false,
            status: None,
            created_at: None,
            expires_at: None,
        }),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub room_ttl_seconds: u64,
}
