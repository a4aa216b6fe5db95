use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use hearth_crypto::StoredContent;
use hearth_db::models::MessageRow;
use hearth_types::api::{Claims, MessageQuery, MessageResponse};
use hearth_types::events::ServerEvent;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Upper bound on one history page.
pub const MAX_HISTORY: u32 = 200;

fn join_error(e: tokio::task::JoinError) -> ApiError {
    error!("spawn_blocking join error: {}", e);
    ApiError::Internal(e.into())
}

/// Recent history of one room, oldest first, decrypted for the caller.
pub async fn get_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    let room = query.room.trim().to_string();
    if room.is_empty() {
        return Err(ApiError::bad_request("Room is required"));
    }
    let limit = query.limit.clamp(1, MAX_HISTORY);

    let db = state.db.clone();
    let cipher = state.cipher.clone();
    let messages = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<MessageResponse>> {
        let rows = db.get_messages(&room, limit)?;
        // One key derivation per page, not per message.
        let room_cipher = cipher.for_room(&room);
        Ok(rows
            .into_iter()
            .filter_map(|row| message_response(row, |c| room_cipher.open(c)))
            .collect())
    })
    .await
    .map_err(join_error)??;

    Ok(Json(messages))
}

fn message_response(row: MessageRow, open: impl Fn(&StoredContent) -> String) -> Option<MessageResponse> {
    let user_id = match Uuid::parse_str(&row.user_id) {
        Ok(id) => id,
        Err(e) => {
            warn!("Skipping message {} with bad author id: {}", row.id, e);
            return None;
        }
    };
    let content = open(&StoredContent::from_row(row.content, row.encrypted));
    Some(MessageResponse {
        id: row.id,
        username: row.username,
        content,
        room: row.room,
        timestamp: row.timestamp,
        user_id,
    })
}

/// Delete one of the caller's own messages and tell the room.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let id = message_id.clone();
    let owner = claims.sub.to_string();
    let room = tokio::task::spawn_blocking(move || -> ApiResult<String> {
        let (author, room) = db
            .message_origin(&id)?
            .ok_or_else(|| ApiError::NotFound("Message not found".into()))?;
        if author != owner {
            return Err(ApiError::Forbidden(
                "You can only delete your own messages".into(),
            ));
        }
        if !db.delete_message(&id)? {
            return Err(ApiError::NotFound("Message not found".into()));
        }
        Ok(room)
    })
    .await
    .map_err(join_error)??;

    state
        .sessions
        .announce(ServerEvent::MessageDeleted {
            message_id: message_id.clone(),
            room,
        })
        .await;
    info!("{} deleted message {}", claims.username, message_id);

    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user_id: &str) -> MessageRow {
        MessageRow {
            id: "m1".into(),
            user_id: user_id.into(),
            username: "alice".into(),
            content: "hello".into(),
            room: "general".into(),
            timestamp: "2030-01-01T00:00:00.000Z".into(),
            encrypted: false,
        }
    }

    #[test]
    fn plain_rows_pass_through() {
        let id = Uuid::new_v4();
        let msg = message_response(row(&id.to_string()), |c| match c {
            StoredContent::Plain(t) => t.clone(),
            StoredContent::Encrypted(_) => unreachable!(),
        })
        .unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.user_id, id);
    }

    #[test]
    fn rows_with_broken_author_ids_are_skipped() {
        assert!(message_response(row("not-a-uuid"), |_| String::new()).is_none());
    }
}
