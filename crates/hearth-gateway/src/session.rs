use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hearth_auth::{TokenError, TokenService};
use hearth_crypto::MessageCipher;
use hearth_db::Database;
use hearth_db::models::MessageRow;
use hearth_ratelimit::{Decision, RateLimiter, actions};
use hearth_types::events::{ClientEvent, ServerEvent};
use hearth_types::models::Identity;
use hearth_types::normalize_room_name;

pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("{0}")]
    InvalidToken(#[from] TokenError),

    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message too long (max {max} characters)")]
    MessageTooLong { max: usize },

    #[error("Room name must be 2-20 letters, numbers or hyphens")]
    InvalidRoom,

    #[error("Not in room '{0}'")]
    NotInRoom(String),

    #[error("Message not found")]
    NotFound,

    #[error("You can only delete your own messages")]
    Forbidden,

    #[error("Unknown connection")]
    UnknownConnection,

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest accepted message body, in characters.
    pub max_message_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_len: 2000,
        }
    }
}

/// Per-connection state. `identity` is `None` until a token is bound.
struct Session {
    tx: mpsc::UnboundedSender<ServerEvent>,
    identity: Option<Identity>,
    room: Option<String>,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<ConnectionId, Session>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl SessionTable {
    fn send(&self, conn: ConnectionId, event: ServerEvent) {
        if let Some(session) = self.sessions.get(&conn) {
            let _ = session.tx.send(event);
        }
    }

    /// Deliver to every member of `room`, optionally skipping one.
    fn broadcast(&self, room: &str, event: &ServerEvent, except: Option<ConnectionId>) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        for conn in members {
            if Some(*conn) == except {
                continue;
            }
            self.send(*conn, event.clone());
        }
    }

    fn identity(&self, conn: ConnectionId) -> Result<&Identity, SessionError> {
        self.sessions
            .get(&conn)
            .ok_or(SessionError::UnknownConnection)?
            .identity
            .as_ref()
            .ok_or(SessionError::NotAuthenticated)
    }

    /// The connection's identity and the canonical room name, provided it
    /// currently sits in `room`. Names are compared after the same
    /// normalization `join` applies.
    fn member(&self, conn: ConnectionId, room: &str) -> Result<(Identity, String), SessionError> {
        let identity = self.identity(conn)?.clone();
        let canonical = normalize_room_name(room);
        let in_room = self
            .sessions
            .get(&conn)
            .is_some_and(|s| s.room.is_some() && s.room == canonical);
        match canonical {
            Some(room) if in_room => Ok((identity, room)),
            _ => Err(SessionError::NotInRoom(room.to_string())),
        }
    }

    /// Drop `conn` from its current room and tell the remaining members.
    fn vacate(&mut self, conn: ConnectionId) -> Option<String> {
        let session = self.sessions.get_mut(&conn)?;
        let room = session.room.take()?;
        let username = session.identity.as_ref().map(|i| i.username.clone());

        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
        if let Some(username) = username {
            self.broadcast(
                &room,
                &ServerEvent::UserLeft {
                    username,
                    room: room.clone(),
                },
                None,
            );
        }
        Some(room)
    }
}

/// Binds live connections to identities and rooms, and fans room events out
/// to subscribers.
///
/// All table mutation and fan-out happen under one lock. Sends go into
/// unbounded channels, so nothing inside the lock waits on I/O; the
/// per-room delivery order is the order in which the lock was taken.
/// Encryption and persistence run on the blocking pool with the lock
/// released.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    tokens: TokenService,
    limiter: Arc<RateLimiter>,
    cipher: MessageCipher,
    db: Arc<Database>,
    config: SessionConfig,
    table: Mutex<SessionTable>,
}

impl SessionManager {
    pub fn new(
        tokens: TokenService,
        limiter: Arc<RateLimiter>,
        cipher: MessageCipher,
        db: Arc<Database>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokens,
                limiter,
                cipher,
                db,
                config,
                table: Mutex::new(SessionTable::default()),
            }),
        }
    }

    async fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.inner.table.lock().await
    }

    /// Register a new, unauthenticated connection. Events addressed to it
    /// arrive on the returned receiver.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.table().await.sessions.insert(
            conn,
            Session {
                tx,
                identity: None,
                room: None,
            },
        );
        debug!("Connection {} opened", conn);
        (conn, rx)
    }

    /// Push an event to one connection, if it is still registered.
    pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) {
        self.table().await.send(conn, event);
    }

    /// Route one inbound client event. Failures have already been reported
    /// to the connection by the time this returns.
    pub async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) {
        let _ = match event {
            ClientEvent::Authenticate { token } => self.authenticate(conn, &token).await.map(drop),
            ClientEvent::Join { room } => self.join(conn, &room).await,
            ClientEvent::Leave { room } => self.leave(conn, &room).await,
            ClientEvent::Message { room, content } => {
                self.publish(conn, &room, &content).await.map(drop)
            }
            ClientEvent::Typing { room } => self.typing(conn, &room).await,
            ClientEvent::DeleteMessage { message_id, room } => {
                self.delete_message(conn, &message_id, &room).await
            }
        };
    }

    /// Tell the connection why its last event was refused.
    async fn report(&self, conn: ConnectionId, err: &SessionError) {
        let event = match err {
            SessionError::UnknownConnection => return,
            SessionError::InvalidToken(e) => ServerEvent::Authenticated {
                success: false,
                username: None,
                error: Some(e.to_string()),
            },
            SessionError::RateLimited { retry_after_secs } => ServerEvent::RateLimited {
                action: actions::MESSAGE.to_string(),
                retry_after: *retry_after_secs,
            },
            SessionError::Storage(_) => ServerEvent::error("Internal error"),
            other => ServerEvent::error(other.to_string()),
        };
        self.send_to(conn, event).await;
    }

    async fn reported<T>(&self, conn: ConnectionId, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            self.report(conn, e).await;
        }
        result
    }

    /// Bind the identity in an access token to `conn`. A connection that
    /// fails re-authentication loses its previous binding and room.
    pub async fn authenticate(&self, conn: ConnectionId, token: &str) -> Result<Identity, SessionError> {
        let verified = self.inner.tokens.verify_access(token);
        let result = self.bind(conn, verified).await;
        self.reported(conn, result).await
    }

    async fn bind(
        &self,
        conn: ConnectionId,
        verified: Result<hearth_types::api::Claims, TokenError>,
    ) -> Result<Identity, SessionError> {
        let mut table = self.table().await;
        let previous = table
            .sessions
            .get(&conn)
            .ok_or(SessionError::UnknownConnection)?
            .identity
            .clone();

        let claims = match verified {
            Ok(claims) => claims,
            Err(e) => {
                if let Some(previous) = previous {
                    table.vacate(conn);
                    if let Some(session) = table.sessions.get_mut(&conn) {
                        session.identity = None;
                    }
                    warn!("{} lost its binding on {} after a failed re-authentication", previous.username, conn);
                } else {
                    debug!("Authentication failed on {}: {}", conn, e);
                }
                return Err(e.into());
            }
        };

        let identity = Identity::from(claims);
        if previous.as_ref().is_some_and(|p| p != &identity) {
            table.vacate(conn);
        }
        if let Some(session) = table.sessions.get_mut(&conn) {
            session.identity = Some(identity.clone());
        }
        table.send(
            conn,
            ServerEvent::Authenticated {
                success: true,
                username: Some(identity.username.clone()),
                error: None,
            },
        );
        info!("{} ({}) authenticated on {}", identity.username, identity.user_id, conn);
        Ok(identity)
    }

    /// Move `conn` into `room`, leaving its previous room first.
    pub async fn join(&self, conn: ConnectionId, room: &str) -> Result<(), SessionError> {
        let result = self.join_inner(conn, room).await;
        self.reported(conn, result).await
    }

    async fn join_inner(&self, conn: ConnectionId, room: &str) -> Result<(), SessionError> {
        let mut table = self.table().await;
        let username = table.identity(conn)?.username.clone();
        let room = normalize_room_name(room).ok_or(SessionError::InvalidRoom)?;

        let current = table.sessions.get(&conn).and_then(|s| s.room.clone());
        if current.as_deref() != Some(room.as_str()) {
            table.vacate(conn);
            table.rooms.entry(room.clone()).or_default().insert(conn);
            if let Some(session) = table.sessions.get_mut(&conn) {
                session.room = Some(room.clone());
            }
            table.broadcast(
                &room,
                &ServerEvent::UserJoined {
                    username: username.clone(),
                    room: room.clone(),
                },
                None,
            );
            debug!("{} joined '{}'", username, room);
        }

        table.send(conn, ServerEvent::RoomJoined { room, username });
        Ok(())
    }

    pub async fn leave(&self, conn: ConnectionId, room: &str) -> Result<(), SessionError> {
        let result = self.leave_inner(conn, room).await;
        self.reported(conn, result).await
    }

    async fn leave_inner(&self, conn: ConnectionId, room: &str) -> Result<(), SessionError> {
        let mut table = self.table().await;
        let (identity, room) = table.member(conn, room)?;
        let username = identity.username;
        table.vacate(conn);
        debug!("{} left '{}'", username, room);
        Ok(())
    }

    /// Throttle, validate, encrypt and store a message, then deliver the
    /// plaintext to everyone in the room. Returns the new message id.
    pub async fn publish(&self, conn: ConnectionId, room: &str, content: &str) -> Result<String, SessionError> {
        let result = self.publish_inner(conn, room, content).await;
        self.reported(conn, result).await
    }

    async fn publish_inner(&self, conn: ConnectionId, room: &str, content: &str) -> Result<String, SessionError> {
        let (identity, room) = self.table().await.member(conn, room)?;
        let room = room.as_str();

        let user_key = identity.user_id.to_string();
        if let Decision::Rejected { retry_after_secs } =
            self.inner.limiter.check(actions::MESSAGE, &user_key)
        {
            return Err(SessionError::RateLimited { retry_after_secs });
        }

        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let max = self.inner.config.max_message_len;
        if content.chars().count() > max {
            return Err(SessionError::MessageTooLong { max });
        }

        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_key,
            username: identity.username.clone(),
            content: content.to_string(),
            room: room.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            encrypted: true,
        };
        let stored = self.persist(row.clone()).await?;

        let event = ServerEvent::NewMessage {
            id: stored.id.clone(),
            username: row.username,
            content: row.content,
            room: row.room,
            timestamp: row.timestamp,
        };
        self.table().await.broadcast(room, &event, None);
        debug!("{} posted {} to '{}'", identity.username, stored.id, room);
        Ok(stored.id)
    }

    /// Encrypt the body for its room and insert the row.
    async fn persist(&self, mut row: MessageRow) -> Result<MessageRow, SessionError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            row.content = inner
                .cipher
                .encrypt_for_storage(&row.content, &row.room)
                .map_err(|e| anyhow::anyhow!(e))?
                .ok_or_else(|| anyhow::anyhow!("nothing to encrypt"))?;
            inner.db.insert_message(&row)?;
            Ok::<_, anyhow::Error>(row)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            SessionError::Storage(e.into())
        })?
        .map_err(|e| {
            error!("Failed to store message: {:#}", e);
            SessionError::Storage(e)
        })
    }

    /// Tell the rest of the room that `conn` is typing.
    pub async fn typing(&self, conn: ConnectionId, room: &str) -> Result<(), SessionError> {
        let result = self.typing_inner(conn, room).await;
        self.reported(conn, result).await
    }

    async fn typing_inner(&self, conn: ConnectionId, room: &str) -> Result<(), SessionError> {
        let table = self.table().await;
        let (identity, room) = table.member(conn, room)?;
        table.broadcast(
            &room,
            &ServerEvent::UserTyping {
                username: identity.username,
                room: room.clone(),
            },
            Some(conn),
        );
        Ok(())
    }

    /// Delete a message the caller wrote and announce it to `room`.
    pub async fn delete_message(&self, conn: ConnectionId, message_id: &str, room: &str) -> Result<(), SessionError> {
        let result = self.delete_inner(conn, message_id, room).await;
        self.reported(conn, result).await
    }

    async fn delete_inner(&self, conn: ConnectionId, message_id: &str, room: &str) -> Result<(), SessionError> {
        let identity = self.table().await.identity(conn)?.clone();
        let room = normalize_room_name(room).ok_or(SessionError::InvalidRoom)?;
        if message_id.is_empty() {
            return Err(SessionError::NotFound);
        }

        let db = self.inner.db.clone();
        let id = message_id.to_string();
        let owner = identity.user_id.to_string();
        let verdict = tokio::task::spawn_blocking(move || -> anyhow::Result<Result<(), SessionError>> {
            match db.message_author(&id)? {
                None => Ok(Err(SessionError::NotFound)),
                Some(author) if author != owner => Ok(Err(SessionError::Forbidden)),
                Some(_) => db.delete_message(&id).map(|removed| {
                    if removed { Ok(()) } else { Err(SessionError::NotFound) }
                }),
            }
        })
        .await
        .map_err(|e| SessionError::Storage(e.into()))?
        .map_err(SessionError::Storage)?;
        verdict?;

        self.announce(ServerEvent::MessageDeleted {
            message_id: message_id.to_string(),
            room,
        })
        .await;
        info!("{} deleted message {}", identity.username, message_id);
        Ok(())
    }

    /// Fan a room-scoped event out to everyone in its room. Events without
    /// a room are dropped.
    pub async fn announce(&self, event: ServerEvent) {
        let Some(room) = event.room() else {
            warn!("Dropped an announcement with no room: {:?}", event);
            return;
        };
        self.table().await.broadcast(room, &event, None);
    }

    /// Tear down `conn`. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut table = self.table().await;
        table.vacate(conn);
        if let Some(session) = table.sessions.remove(&conn) {
            match session.identity {
                Some(identity) => info!("{} ({}) disconnected", identity.username, conn),
                None => debug!("Connection {} closed before authenticating", conn),
            }
        }
    }

    /// Number of authenticated connections.
    pub async fn online_count(&self) -> usize {
        self.table()
            .await
            .sessions
            .values()
            .filter(|s| s.identity.is_some())
            .count()
    }

    /// Usernames currently in `room`, sorted.
    pub async fn room_members(&self, room: &str) -> Vec<String> {
        let table = self.table().await;
        let mut names: Vec<String> = table
            .rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|conn| table.sessions.get(conn)?.identity.as_ref())
            .map(|i| i.username.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use hearth_auth::TokenConfig;
    use hearth_crypto::MasterKey;
    use hearth_ratelimit::RateLimitConfig;

    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(
            TokenService::new(TokenConfig::new("a-secret", "r-secret")),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            MessageCipher::with_iterations(MasterKey::generate(), 1_000),
            Arc::new(Database::open_in_memory().unwrap()),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn unauthenticated_join_is_rejected() {
        let sm = manager();
        let (conn, mut rx) = sm.connect().await;

        assert!(matches!(sm.join(conn, "general").await, Err(SessionError::NotAuthenticated)));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::error("Not authenticated"));
        assert!(sm.room_members("general").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_connection_gets_nothing() {
        let sm = manager();
        assert!(matches!(
            sm.join(Uuid::new_v4(), "general").await,
            Err(SessionError::UnknownConnection)
        ));
        sm.disconnect(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn bad_token_reports_authenticated_false() {
        let sm = manager();
        let (conn, mut rx) = sm.connect().await;

        assert!(sm.authenticate(conn, "garbage").await.is_err());
        match rx.try_recv().unwrap() {
            ServerEvent::Authenticated { success, error, .. } => {
                assert!(!success);
                assert!(error.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sm.online_count().await, 0);
    }

    #[test]
    fn error_messages_are_client_facing() {
        assert_eq!(
            SessionError::MessageTooLong { max: 2000 }.to_string(),
            "Message too long (max 2000 characters)"
        );
        assert_eq!(SessionError::NotAuthenticated.to_string(), "Not authenticated");
    }
}
