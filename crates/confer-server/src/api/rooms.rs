use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use confer_protocol::RoomSummary;

pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.signaling.room_summaries().await)
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomSummary>> {
    let summary = state
        .signaling
        .room_summary(&name)
        .await
        .ok_or_else(|| AppError::NotFound(format!("room {}", name)))?;
    Ok(Json(summary))
}
