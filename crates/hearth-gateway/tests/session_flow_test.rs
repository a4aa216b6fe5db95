/// End-to-end flows through the session manager: authenticate, join,
/// publish, fan-out and teardown, against an in-memory database.
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use hearth_auth::{TokenConfig, TokenService};
use hearth_crypto::{MasterKey, MessageCipher};
use hearth_db::Database;
use hearth_gateway::{ConnectionId, SessionConfig, SessionError, SessionManager};
use hearth_ratelimit::{Limit, RateLimitConfig, RateLimiter, actions};
use hearth_types::events::{ClientEvent, ServerEvent};

struct Harness {
    sessions: SessionManager,
    tokens: TokenService,
    cipher: MessageCipher,
    db: Arc<Database>,
}

fn harness_with(limits: RateLimitConfig, config: SessionConfig) -> Harness {
    let tokens = TokenService::new(TokenConfig::new("test-access", "test-refresh"));
    let cipher = MessageCipher::with_iterations(MasterKey::generate(), 1_000);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sessions = SessionManager::new(
        tokens.clone(),
        Arc::new(RateLimiter::new(limits)),
        cipher.clone(),
        db.clone(),
        config,
    );
    Harness {
        sessions,
        tokens,
        cipher,
        db,
    }
}

fn harness() -> Harness {
    harness_with(RateLimitConfig::default(), SessionConfig::default())
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

impl Harness {
    /// A connected, authenticated socket with its setup events drained.
    async fn login(&self, username: &str) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let pair = self.tokens.issue(Uuid::new_v4(), username).unwrap();
        let (conn, mut rx) = self.sessions.connect().await;
        self.sessions.authenticate(conn, &pair.access_token).await.unwrap();
        drain(&mut rx);
        (conn, rx)
    }

    async fn login_into(&self, username: &str, room: &str) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (conn, mut rx) = self.login(username).await;
        self.sessions.join(conn, room).await.unwrap();
        drain(&mut rx);
        (conn, rx)
    }
}

#[tokio::test]
async fn message_reaches_room_members_only() {
    let h = harness();
    let (alice, mut alice_rx) = h.login_into("alice", "general").await;
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;
    let (_carol, mut carol_rx) = h.login_into("carol", "random").await;
    let (_dave, mut dave_rx) = h.login("dave").await;
    drain(&mut alice_rx);

    let id = h.sessions.publish(alice, "general", "hi").await.unwrap();

    for rx in [&mut alice_rx, &mut bob_rx] {
        match drain(rx).as_slice() {
            [ServerEvent::NewMessage { id: got, username, content, room, .. }] => {
                assert_eq!(got, &id);
                assert_eq!(username, "alice");
                assert_eq!(content, "hi");
                assert_eq!(room, "general");
            }
            other => panic!("expected one new_message, got {:?}", other),
        }
    }
    assert!(drain(&mut carol_rx).is_empty());
    assert!(drain(&mut dave_rx).is_empty());
}

#[tokio::test]
async fn stored_message_is_encrypted_for_its_room() {
    let h = harness();
    let (alice, _rx) = h.login_into("alice", "general").await;

    h.sessions.publish(alice, "general", "  secret plans  ").await.unwrap();

    let rows = h.db.get_messages("general", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].encrypted);
    assert!(!rows[0].content.contains("secret"));
    assert_eq!(
        h.cipher.decrypt_from_storage(&rows[0].content, "general").as_deref(),
        Some("secret plans")
    );
    assert_eq!(h.cipher.decrypt_from_storage(&rows[0].content, "random"), None);
}

#[tokio::test]
async fn unauthenticated_publish_is_rejected_and_nothing_is_stored() {
    let h = harness();
    let (_watcher, mut watcher_rx) = h.login_into("watcher", "general").await;
    let (anon, mut anon_rx) = h.sessions.connect().await;

    let err = h.sessions.publish(anon, "general", "hello?").await.unwrap_err();
    assert!(matches!(err, SessionError::NotAuthenticated));

    assert_eq!(drain(&mut anon_rx), vec![ServerEvent::error("Not authenticated")]);
    assert!(drain(&mut watcher_rx).is_empty());
    assert_eq!(h.db.count_messages("general").unwrap(), 0);
}

#[tokio::test]
async fn refresh_token_cannot_authenticate_a_socket() {
    let h = harness();
    let pair = h.tokens.issue(Uuid::new_v4(), "alice").unwrap();
    let (conn, mut rx) = h.sessions.connect().await;

    assert!(h.sessions.authenticate(conn, &pair.refresh_token).await.is_err());
    assert_eq!(
        drain(&mut rx),
        vec![ServerEvent::Authenticated {
            success: false,
            username: None,
            error: Some("wrong token type".into()),
        }]
    );
    assert!(matches!(
        h.sessions.join(conn, "general").await,
        Err(SessionError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn join_announces_to_room_and_confirms_to_joiner() {
    let h = harness();
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;
    let (alice, mut alice_rx) = h.login("alice").await;

    h.sessions.join(alice, "general").await.unwrap();

    let joined = ServerEvent::UserJoined {
        username: "alice".into(),
        room: "general".into(),
    };
    assert_eq!(drain(&mut bob_rx), vec![joined.clone()]);
    assert_eq!(
        drain(&mut alice_rx),
        vec![
            joined,
            ServerEvent::RoomJoined {
                room: "general".into(),
                username: "alice".into(),
            }
        ]
    );
    assert_eq!(h.sessions.room_members("general").await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn switching_rooms_leaves_the_old_one() {
    let h = harness();
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;
    let (alice, _alice_rx) = h.login_into("alice", "general").await;
    drain(&mut bob_rx);

    h.sessions.join(alice, "random").await.unwrap();

    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::UserLeft {
            username: "alice".into(),
            room: "general".into(),
        }]
    );
    assert_eq!(h.sessions.room_members("general").await, vec!["bob"]);
    assert_eq!(h.sessions.room_members("random").await, vec!["alice"]);

    assert!(matches!(
        h.sessions.publish(alice, "general", "still here?").await,
        Err(SessionError::NotInRoom(_))
    ));
}

#[tokio::test]
async fn leave_and_disconnect_notify_the_room() {
    let h = harness();
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;
    let (alice, _) = h.login_into("alice", "general").await;
    let (carol, _) = h.login_into("carol", "general").await;
    drain(&mut bob_rx);

    h.sessions.leave(alice, "general").await.unwrap();
    h.sessions.disconnect(carol).await;
    h.sessions.disconnect(carol).await;

    assert_eq!(
        drain(&mut bob_rx),
        vec![
            ServerEvent::UserLeft {
                username: "alice".into(),
                room: "general".into(),
            },
            ServerEvent::UserLeft {
                username: "carol".into(),
                room: "general".into(),
            },
        ]
    );
    assert_eq!(h.sessions.online_count().await, 2);
}

#[tokio::test]
async fn failed_reauthentication_unbinds() {
    let h = harness();
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;
    let (alice, mut alice_rx) = h.login_into("alice", "general").await;
    drain(&mut bob_rx);

    assert!(h.sessions.authenticate(alice, "expired-or-garbage").await.is_err());

    assert!(matches!(
        drain(&mut alice_rx).as_slice(),
        [ServerEvent::Authenticated { success: false, .. }]
    ));
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::UserLeft {
            username: "alice".into(),
            room: "general".into(),
        }]
    );
    assert!(matches!(
        h.sessions.publish(alice, "general", "hi").await,
        Err(SessionError::NotAuthenticated)
    ));
    assert_eq!(h.sessions.online_count().await, 1);
}

#[tokio::test]
async fn message_validation() {
    let h = harness_with(
        RateLimitConfig::default(),
        SessionConfig { max_message_len: 5 },
    );
    let (alice, mut rx) = h.login_into("alice", "general").await;

    assert!(matches!(
        h.sessions.publish(alice, "general", "   ").await,
        Err(SessionError::EmptyMessage)
    ));
    assert!(matches!(
        h.sessions.publish(alice, "general", "toolong").await,
        Err(SessionError::MessageTooLong { max: 5 })
    ));
    assert!(h.sessions.publish(alice, "general", "héllo").await.is_ok());

    let events = drain(&mut rx);
    assert_eq!(events[0], ServerEvent::error("Message is empty"));
    assert_eq!(events[1], ServerEvent::error("Message too long (max 5 characters)"));
    assert!(matches!(events[2], ServerEvent::NewMessage { .. }));
    assert_eq!(h.db.count_messages("general").unwrap(), 1);
}

#[tokio::test]
async fn publishing_is_rate_limited_per_user() {
    let h = harness_with(
        RateLimitConfig::default().with_limit(actions::MESSAGE, Limit::new(2, 60)),
        SessionConfig::default(),
    );
    let (alice, mut alice_rx) = h.login_into("alice", "general").await;
    let (bob, _) = h.login_into("bob", "general").await;
    drain(&mut alice_rx);

    h.sessions.publish(alice, "general", "one").await.unwrap();
    h.sessions.publish(alice, "general", "two").await.unwrap();
    let err = h.sessions.publish(alice, "general", "three").await.unwrap_err();
    assert!(matches!(err, SessionError::RateLimited { retry_after_secs } if retry_after_secs > 0));

    let events = drain(&mut alice_rx);
    assert!(matches!(
        events.last(),
        Some(ServerEvent::RateLimited { action, retry_after }) if action == "message" && *retry_after > 0
    ));

    // Bob has his own bucket.
    assert!(h.sessions.publish(bob, "general", "mine").await.is_ok());
    assert_eq!(h.db.count_messages("general").unwrap(), 3);
}

#[tokio::test]
async fn room_order_matches_publish_order() {
    let h = harness();
    let (alice, _) = h.login_into("alice", "general").await;
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;

    for i in 0..10 {
        h.sessions.publish(alice, "general", &format!("m{}", i)).await.unwrap();
    }

    let contents: Vec<String> = drain(&mut bob_rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage { content, .. } => Some(content),
            _ => None,
        })
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
    assert_eq!(contents, expected);
}

#[tokio::test]
async fn typing_skips_the_sender() {
    let h = harness();
    let (alice, mut alice_rx) = h.login_into("alice", "general").await;
    let (_bob, mut bob_rx) = h.login_into("bob", "general").await;
    drain(&mut alice_rx);

    h.sessions.typing(alice, "general").await.unwrap();

    assert!(drain(&mut alice_rx).is_empty());
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::UserTyping {
            username: "alice".into(),
            room: "general".into(),
        }]
    );
}

#[tokio::test]
async fn only_the_author_can_delete() {
    let h = harness();
    let (alice, mut alice_rx) = h.login_into("alice", "general").await;
    let (bob, mut bob_rx) = h.login_into("bob", "general").await;
    drain(&mut alice_rx);

    let id = h.sessions.publish(alice, "general", "oops").await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    assert!(matches!(
        h.sessions.delete_message(bob, &id, "general").await,
        Err(SessionError::Forbidden)
    ));
    assert!(matches!(
        h.sessions.delete_message(bob, "no-such-id", "general").await,
        Err(SessionError::NotFound)
    ));
    drain(&mut bob_rx);

    h.sessions.delete_message(alice, &id, "general").await.unwrap();
    let deleted = ServerEvent::MessageDeleted {
        message_id: id.clone(),
        room: "general".into(),
    };
    assert_eq!(drain(&mut bob_rx), vec![deleted.clone()]);
    assert_eq!(drain(&mut alice_rx), vec![deleted]);
    assert_eq!(h.db.count_messages("general").unwrap(), 0);
}

#[tokio::test]
async fn dispatch_routes_client_events() {
    let h = harness();
    let pair = h.tokens.issue(Uuid::new_v4(), "alice").unwrap();
    let (conn, mut rx) = h.sessions.connect().await;

    h.sessions
        .dispatch(conn, ClientEvent::Authenticate { token: pair.access_token })
        .await;
    h.sessions
        .dispatch(conn, ClientEvent::Join { room: "general".into() })
        .await;
    h.sessions
        .dispatch(
            conn,
            ClientEvent::Message {
                room: "general".into(),
                content: "hello".into(),
            },
        )
        .await;

    let events = drain(&mut rx);
    assert_eq!(
        events[0],
        ServerEvent::Authenticated {
            success: true,
            username: Some("alice".into()),
            error: None,
        }
    );
    assert!(matches!(&events[events.len() - 1], ServerEvent::NewMessage { content, .. } if content == "hello"));
}

#[tokio::test]
async fn room_operations_accept_the_name_as_typed() {
    let h = harness();
    let (alice, mut alice_rx) = h.login_into("alice", "Rust Talk").await;
    let (_bob, mut bob_rx) = h.login_into("bob", "rust-talk").await;
    drain(&mut alice_rx);

    let id = h.sessions.publish(alice, "Rust Talk", "hi").await.unwrap();
    match drain(&mut bob_rx).as_slice() {
        [ServerEvent::NewMessage { id: got, room, .. }] => {
            assert_eq!(got, &id);
            assert_eq!(room, "rust-talk");
        }
        other => panic!("expected one new_message, got {:?}", other),
    }
    let rows = h.db.get_messages("rust-talk", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].room, "rust-talk");

    h.sessions.typing(alice, " RUST talk ").await.unwrap();
    assert!(matches!(
        drain(&mut bob_rx).as_slice(),
        [ServerEvent::UserTyping { room, .. }] if room == "rust-talk"
    ));

    h.sessions.delete_message(alice, &id, "Rust Talk").await.unwrap();
    assert!(matches!(
        drain(&mut bob_rx).as_slice(),
        [ServerEvent::MessageDeleted { message_id, room }] if message_id == &id && room == "rust-talk"
    ));

    h.sessions.leave(alice, "Rust Talk").await.unwrap();
    assert!(matches!(
        h.sessions.publish(alice, "rust-talk", "gone").await,
        Err(SessionError::NotInRoom(_))
    ));
}

#[tokio::test]
async fn invalid_room_names_are_refused() {
    let h = harness();
    let (alice, _) = h.login("alice").await;
    assert!(matches!(
        h.sessions.join(alice, "x").await,
        Err(SessionError::InvalidRoom)
    ));
    assert!(matches!(
        h.sessions.join(alice, "bad_name!").await,
        Err(SessionError::InvalidRoom)
    ));
}
