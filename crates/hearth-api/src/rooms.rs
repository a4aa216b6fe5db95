use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;

use hearth_db::models::RoomRow;
use hearth_types::api::{CreateRoomRequest, RoomResponse};
use hearth_types::{DEFAULT_ROOM, normalize_room_name};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn room_response(row: RoomRow) -> RoomResponse {
    RoomResponse {
        name: row.name,
        encrypted: row.encrypted,
        created_at: row.created_at,
    }
}

pub async fn list_rooms(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rooms: Vec<RoomResponse> = state
        .db
        .list_rooms()?
        .into_iter()
        .map(room_response)
        .collect();
    Ok(Json(rooms))
}

pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = normalize_room_name(&req.name).ok_or_else(|| {
        ApiError::bad_request(
            "Room name must be 2-20 characters of letters, numbers, and hyphens",
        )
    })?;

    if !state.db.create_room(&name)? {
        return Err(ApiError::Conflict("Room already exists".into()));
    }
    info!("Room '{}' created", name);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "room": name })),
    ))
}

/// Remove a room and its history. The default room cannot be deleted.
pub async fn delete_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if name == DEFAULT_ROOM {
        return Err(ApiError::Forbidden(
            "The general room cannot be deleted".into(),
        ));
    }
    let history = state.db.count_messages(&name)?;
    if !state.db.delete_room(&name)? {
        return Err(ApiError::NotFound("Room not found".into()));
    }
    info!("Room '{}' deleted with {} messages", name, history);

    Ok(Json(json!({ "success": true })))
}
