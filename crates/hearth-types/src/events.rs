use serde::{Deserialize, Serialize};

use crate::DEFAULT_ROOM;

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

/// Events sent FROM client TO server over the socket.
///
/// Event names are kept stable for existing clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind an access token to this connection
    Authenticate { token: String },

    Join {
        #[serde(default = "default_room")]
        room: String,
    },

    Leave {
        #[serde(default = "default_room")]
        room: String,
    },

    /// Post a chat message to a room
    Message {
        #[serde(default = "default_room")]
        room: String,
        #[serde(default)]
        content: String,
    },

    Typing {
        #[serde(default = "default_room")]
        room: String,
    },

    DeleteMessage {
        #[serde(alias = "messageId")]
        message_id: String,
        #[serde(default = "default_room")]
        room: String,
    },
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Result of an `authenticate` event
    Authenticated {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Confirmation sent only to the joining connection
    RoomJoined { room: String, username: String },

    UserJoined { username: String, room: String },

    UserLeft { username: String, room: String },

    NewMessage {
        id: String,
        username: String,
        content: String,
        room: String,
        timestamp: String,
    },

    UserTyping { username: String, room: String },

    MessageDeleted { message_id: String, room: String },

    /// The action was throttled; retry after the given number of seconds
    RateLimited { action: String, retry_after: u64 },

    Error { message: String },
}

impl ServerEvent {
    /// Returns the room if this event is scoped to one.
    /// Events that return `None` are addressed to a single connection.
    pub fn room(&self) -> Option<&str> {
        match self {
            Self::UserJoined { room, .. }
            | Self::UserLeft { room, .. }
            | Self::NewMessage { room, .. }
            | Self::UserTyping { room, .. }
            | Self::MessageDeleted { room, .. } => Some(room),
            _ => None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
